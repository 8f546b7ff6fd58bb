// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

use crate::bitstream::BitSwap;
use crate::error::{ErrorKind, Result};

use std::path::PathBuf;
use std::time::Duration;

/// Timeout for vendor control transfers
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for bulk transfers (high speed bitstream upload)
pub const BULK_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunk size of the low speed (endpoint 0) bitstream upload path
pub const LS_CHUNK_BYTES: usize = 2048;
/// Chunk size of the high speed (bulk) bitstream upload path
pub const HS_CHUNK_BYTES: usize = 65536;
/// Upload attempts before the low speed path gives up
pub const LS_CONFIG_ATTEMPTS: u32 = 10;
/// Upload attempts before the high speed path gives up
pub const HS_CONFIG_ATTEMPTS: u32 = 3;

/// How long the device may take to acknowledge an uploaded job
pub const JOB_ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the validation job may take to produce its known nonce.
/// Sufficient for devices down to roughly 760 kH/s.
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Pause between session restarts after a failure
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(1);
/// Sleep between result register polls when the device is quiet
pub const POLL_IDLE_SLEEP: Duration = Duration::from_millis(25);

/// Upper bound on the per-job interval. New block templates must reach the
/// device reasonably often, most pools enforce this.
pub const MAX_JOB_INTERVAL_S: f64 = 30.0;

/// Worker configuration with all knobs the hotplug manager and the workers
/// understand. Unknown settings cannot exist; everything is typed here.
#[derive(Clone, Debug)]
pub struct Config {
    /// Only drive the board with this serial number (all boards if unset)
    pub serial: Option<String>,
    /// Display name of the worker (derived from the serial if unset)
    pub name: Option<String>,
    /// Upper bound on the per-job work interval in seconds
    pub job_interval_s: f64,
    /// Period of the hotplug bus rescan
    pub scan_interval: Duration,
    /// Directory the FPGA bitstream images are loaded from
    pub bitstream_dir: PathBuf,
    /// Re-upload the bitstream even if the FPGA reports it is configured
    pub force_bitstream: bool,
    /// Force the low speed (endpoint 0) configuration path
    pub ep0_force: bool,
    /// Bitstream bit order handling
    pub bit_swap: BitSwap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: None,
            name: None,
            job_interval_s: MAX_JOB_INTERVAL_S,
            scan_interval: Duration::from_secs(10),
            bitstream_dir: PathBuf::from("bitstreams"),
            force_bitstream: false,
            ep0_force: false,
            bit_swap: BitSwap::Auto,
        }
    }
}

impl Config {
    /// Reject configurations that cannot work before any device is touched
    pub fn validate(&self) -> Result<()> {
        if !self.job_interval_s.is_finite() || self.job_interval_s <= 0.0 {
            Err(ErrorKind::General(format!(
                "invalid job interval: {}",
                self.job_interval_s
            )))?
        }
        if self.scan_interval == Duration::from_secs(0) {
            Err(ErrorKind::General("scan interval must be non-zero".to_string()))?
        }
        if self.bitstream_dir.as_os_str().is_empty() {
            Err(ErrorKind::General("bitstream directory must be set".to_string()))?
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().expect("default config must validate");
    }

    #[test]
    fn test_invalid_job_interval() {
        let mut config = Config::default();
        config.job_interval_s = 0.0;
        assert!(config.validate().is_err());
    }
}
