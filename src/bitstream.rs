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

//! FPGA bitstream upload.
//!
//! Two paths exist: the low speed path pushes the image through endpoint 0 in
//! small checksummed chunks, the high speed path streams it through a bulk
//! endpoint. Both verify the DONE pin afterwards and retry a bounded number
//! of times.

use crate::config;
use crate::device::{Capability, ZtexDevice};
use crate::error::{self, Error, ErrorKind};
use crate::misc::LOGGER;

use slog::{error, info, warn};

use std::fs;
use std::path::Path;

/// Bitstream bit order handling
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BitSwap {
    /// Upload the image as is
    Off,
    /// Reverse the bits of every byte before upload
    On,
    /// Detect the required order from the sync word
    Auto,
}

/// Xilinx sync word as it appears in an image that still needs per byte bit
/// reversal before upload
const SYNC_WORD_RAW: [u8; 4] = [0xaa, 0x99, 0x55, 0x66];
/// Sync word of an image that is already in upload bit order
const SYNC_WORD_SWAPPED: [u8; 4] = [0x55, 0x99, 0xaa, 0x66];

/// Smallest byte count a real bitstream can have
const MIN_BITSTREAM_BYTES: usize = 64;

fn find_marker(buf: &[u8], marker: &[u8; 4]) -> Option<usize> {
    buf.windows(marker.len()).position(|window| window == marker)
}

/// Reverse the bits within every byte of the buffer. The transform is its own
/// inverse.
pub fn swap_bits(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte = byte.reverse_bits();
    }
}

/// Decide from the sync word whether the image needs bit reversal. Returns
/// `false` with a warning when no sync word is present; a missing marker is
/// not a failure.
pub fn detect_bit_order(buf: &[u8]) -> bool {
    let raw = find_marker(buf, &SYNC_WORD_RAW);
    let swapped = find_marker(buf, &SYNC_WORD_SWAPPED);
    match (raw, swapped) {
        (Some(raw_at), Some(swapped_at)) => raw_at < swapped_at,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => {
            warn!(
                LOGGER,
                "unable to determine bitstream bit order: no sync word found"
            );
            false
        }
    }
}

fn should_swap(buf: &[u8], bit_swap: BitSwap) -> bool {
    match bit_swap {
        BitSwap::On => true,
        BitSwap::Off => false,
        BitSwap::Auto => detect_bit_order(buf),
    }
}

/// Read a bitstream image in full. Anything shorter than the minimal
/// plausible size is rejected up front.
pub fn load_bitstream(path: &Path) -> error::Result<Vec<u8>> {
    let buf = fs::read(path)?;
    if buf.len() < MIN_BITSTREAM_BYTES {
        Err(ErrorKind::BitstreamUpload(format!(
            "invalid bitstream size: {} bytes ({})",
            buf.len(),
            path.display()
        )))?
    }
    Ok(buf)
}

impl ZtexDevice {
    /// Configure the FPGA from a bitstream image. The high speed path is
    /// preferred and any failure there falls back to the low speed path;
    /// `ep0_force` skips the high speed attempt entirely.
    pub fn configure_fpga(
        &mut self,
        bitstream: &[u8],
        force: bool,
        bit_swap: BitSwap,
        ep0_force: bool,
    ) -> error::Result<()> {
        if ep0_force {
            return self.configure_fpga_ls(bitstream, force, bit_swap);
        }
        match self.configure_fpga_hs(bitstream, force, bit_swap) {
            Ok(()) => Ok(()),
            Err(e) => match e.kind() {
                // nothing to gain from a second state probe
                ErrorKind::AlreadyConfigured => Err(e),
                _ => {
                    warn!(
                        LOGGER,
                        "{}: high speed FPGA configuration failed ({}), \
                         falling back to the endpoint 0 path",
                        self.serial(),
                        e
                    );
                    self.configure_fpga_ls(bitstream, force, bit_swap)
                }
            },
        }
    }

    /// Upload a bitstream through the high speed (bulk transfer) path
    pub fn configure_fpga_hs(
        &mut self,
        bitstream: &[u8],
        force: bool,
        bit_swap: BitSwap,
    ) -> error::Result<()> {
        self.check_capability(Capability::HsFpga)?;
        let (endpoint, iface) = self.hs_config_settings()?;

        if !force && self.fpga_configured()? {
            Err(ErrorKind::AlreadyConfigured)?
        }

        let mut buf = bitstream.to_vec();
        if should_swap(&buf, bit_swap) {
            swap_bits(&mut buf);
        }

        let release = !self.interface_claimed(iface);
        if release {
            self.claim_interface(iface)?;
        }
        let result = self.upload_hs(endpoint, &buf);
        if release {
            if let Err(e) = self.release_interface(iface) {
                warn!(LOGGER, "{}: {}", self.serial(), e);
            }
        }
        result
    }

    fn upload_hs(&self, endpoint: u8, buf: &[u8]) -> error::Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.init_hs_config()?;
            let mut sent_total = 0;
            while sent_total < buf.len() {
                let end = (sent_total + config::HS_CHUNK_BYTES).min(buf.len());
                let sent = self.bulk_write(endpoint, &buf[sent_total..end])?;
                if sent == 0 {
                    Err(ErrorKind::Usb("bulk write made no progress".to_string()))?
                }
                sent_total += sent;
            }
            self.finish_hs_config()?;

            if self.fpga_state()?.configured() {
                info!(
                    LOGGER,
                    "{}: FPGA configured through the high speed path ({} bytes)",
                    self.serial(),
                    sent_total
                );
                return Ok(());
            }
            let err = Error::from(ErrorKind::BitstreamUpload(format!(
                "DONE pin does not go high after {} bytes",
                sent_total
            )));
            if attempt >= config::HS_CONFIG_ATTEMPTS {
                return Err(err);
            }
            error!(LOGGER, "{}: {}: retrying", self.serial(), err);
        }
    }

    /// Upload a bitstream through the low speed (endpoint 0) path
    pub fn configure_fpga_ls(
        &mut self,
        bitstream: &[u8],
        force: bool,
        bit_swap: BitSwap,
    ) -> error::Result<()> {
        self.check_capability(Capability::Fpga)?;

        if !force && self.fpga_configured()? {
            Err(ErrorKind::AlreadyConfigured)?
        }

        let mut buf = bitstream.to_vec();
        // the firmware forwards configuration data in 64 byte units
        let padding = (64 - buf.len() % 64) % 64;
        buf.resize(buf.len() + padding, 0);
        if should_swap(&buf, bit_swap) {
            swap_bits(&mut buf);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.reset_fpga()?;

            let mut checksum: u8 = 0;
            let mut sent_total = 0;
            while sent_total < buf.len() {
                let end = (sent_total + config::LS_CHUNK_BYTES).min(buf.len());
                let sent = self.send_fpga_data(&buf[sent_total..end])?;
                if sent == 0 {
                    Err(ErrorKind::Usb("control write made no progress".to_string()))?
                }
                checksum = buf[sent_total..sent_total + sent]
                    .iter()
                    .fold(checksum, |cs, &b| cs.wrapping_add(b));
                sent_total += sent;
            }

            let state = self.fpga_state()?;
            if state.configured() {
                info!(
                    LOGGER,
                    "{}: FPGA configured through the endpoint 0 path ({} bytes, checksum {:#04x})",
                    self.serial(),
                    sent_total,
                    checksum
                );
                return Ok(());
            }
            let err = Error::from(ErrorKind::BitstreamUpload(format!(
                "DONE pin does not go high (device received {} of {} bytes, \
                 checksum {:#04x} should be {:#04x}, INIT_B_HIST {})",
                state.transferred_bytes, sent_total, state.checksum, checksum, state.init_b
            )));
            if attempt >= config::LS_CONFIG_ATTEMPTS {
                return Err(err);
            }
            error!(LOGGER, "{}: {}: retrying", self.serial(), err);
        }
    }
}
