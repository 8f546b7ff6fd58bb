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

//! Hash jobs and the work source boundary.
//!
//! The pool protocol lives entirely behind [`WorkSource`]; this crate only
//! consumes jobs, submits shares and reports hash rate changes.

use crate::error::{self, ErrorKind};
use crate::misc::LOGGER;

use bitcoin_hashes::{sha256, Hash, HashEngine};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use lazy_static::lazy_static;
use slog::{info, trace};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Identifier of the block chain a pool mines on; long polls invalidate work
/// per chain
pub type ChainId = u64;

/// Jobs must carry at least the first 76 bytes of a block header (the last
/// 12 of which are uploaded to the device)
pub const MIN_JOB_DATA_BYTES: usize = 76;
/// Data tail plus midstate as the hardware wants it
pub const DEVICE_PAYLOAD_BYTES: usize = 44;

/// Expected nonce of the validation job (bytes 7b c2 b3 02 on the wire)
pub const VALIDATION_NONCE: u32 = 0x02b3_c27b;

lazy_static! {
    /// Midstate of the known-answer job every device has to solve on attach
    static ref VALIDATION_MIDSTATE: [u8; 32] = {
        let bytes = hex::decode("1625cbf1a5bc6ba648d1218441389e00a9dc79768a2fc6f2b79c70cf576febd0")
            .expect("BUG: bad validation midstate literal");
        let mut midstate = [0u8; 32];
        midstate.copy_from_slice(&bytes);
        midstate
    };
    /// Header tail of the known-answer job
    static ref VALIDATION_DATA_TAIL: Vec<u8> =
        hex::decode("4c0afa494de837d81a269421").expect("BUG: bad validation data literal");
}

/// Reference to the pool a job came from
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub chain: ChainId,
    epoch: AtomicU64,
}

impl Pool {
    pub fn new<T: Into<String>>(name: T, chain: ChainId) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            chain,
            epoch: AtomicU64::new(0),
        })
    }

    /// Long poll epoch of the chain this pool mines on
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Called by the work source when a long poll announces a new block
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// One piece of work as handed out by the work source. Exactly one job is
/// current per device and at most one is pending upload.
#[derive(Clone, Debug)]
pub struct Job {
    data: Vec<u8>,
    /// SHA-256 state after the first header chunk, h0..h7 as little endian
    /// words (the order the device consumes)
    midstate: [u8; 32],
    /// Expected nonce of a known-answer job
    pub check: Option<u32>,
    pub pool: Option<Arc<Pool>>,
    /// Long poll epoch the job was created under
    pub epoch: u64,
    /// Set when the device acknowledged the job
    pub start_time: Option<Instant>,
}

impl Job {
    pub fn new(
        data: Vec<u8>,
        midstate: [u8; 32],
        pool: Option<Arc<Pool>>,
    ) -> error::Result<Self> {
        if data.len() < MIN_JOB_DATA_BYTES {
            Err(ErrorKind::General(format!(
                "job payload too short: {} bytes",
                data.len()
            )))?
        }
        let epoch = pool.as_ref().map_or(0, |pool| pool.current_epoch());
        Ok(Self {
            data,
            midstate,
            check: None,
            pool,
            epoch,
            start_time: None,
        })
    }

    /// The known-answer job used to validate a freshly attached device
    pub fn validation() -> Self {
        let mut data = vec![0u8; 64];
        data.extend_from_slice(&VALIDATION_DATA_TAIL);
        Self {
            data,
            midstate: *VALIDATION_MIDSTATE,
            check: Some(VALIDATION_NONCE),
            pool: None,
            epoch: 0,
            start_time: None,
        }
    }

    /// Chain this job mines on, if it came from a pool
    pub fn chain(&self) -> Option<ChainId> {
        self.pool.as_ref().map(|pool| pool.chain)
    }

    /// Whether a long poll made this job stale since it was fetched
    pub fn is_stale(&self) -> bool {
        self.pool
            .as_ref()
            .map_or(false, |pool| pool.current_epoch() != self.epoch)
    }

    /// Range block and midstate in upload order
    pub fn device_payload(&self) -> [u8; DEVICE_PAYLOAD_BYTES] {
        let mut payload = [0u8; DEVICE_PAYLOAD_BYTES];
        payload[..12].copy_from_slice(&self.data[64..76]);
        payload[12..].copy_from_slice(&self.midstate);
        payload
    }

    /// Double SHA-256 of the block header completed with the given nonce,
    /// resumed from the midstate
    pub fn hash_with_nonce(&self, nonce: u32) -> [u8; 32] {
        // the engine wants the state words big endian
        let mut midstate_be = [0u8; 32];
        for i in 0..8 {
            let word = LittleEndian::read_u32(&self.midstate[i * 4..i * 4 + 4]);
            BigEndian::write_u32(&mut midstate_be[i * 4..i * 4 + 4], word);
        }
        let mut engine = sha256::HashEngine::from_midstate(sha256::Midstate(midstate_be), 64);
        engine.input(&self.data[64..76]);
        engine.input(&nonce.to_le_bytes());
        let single = sha256::Hash::from_engine(engine);
        sha256::Hash::hash(&single[..]).into_inner()
    }
}

/// The work source every device worker draws from. Implemented by the pool
/// layer; this crate never speaks the pool protocol itself.
pub trait WorkSource: Send + Sync {
    /// Block until a new piece of work is available
    fn fetch_job(&self) -> Job;

    /// Hand a found share back to the pool. Must not block; the device
    /// responder thread calls this on its hot path.
    fn submit_share(&self, job: &Job, nonce: u32);

    /// The effective device hash rate changed
    fn hashrate_changed(&self, mhps: f64);
}

/// Work source that fabricates unique throwaway jobs; keeps a device busy
/// without any pool attached (hardware exercise, tests)
pub struct NullWorkSource {
    counter: AtomicU64,
    pool: Arc<Pool>,
}

impl NullWorkSource {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            pool: Pool::new("null", 0),
        }
    }
}

impl WorkSource for NullWorkSource {
    fn fetch_job(&self) -> Job {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut data = vec![0u8; MIN_JOB_DATA_BYTES];
        LittleEndian::write_u64(&mut data[64..72], id);
        let mut midstate = [0u8; 32];
        LittleEndian::write_u64(&mut midstate, id);
        Job::new(data, midstate, Some(self.pool.clone())).expect("BUG: bad null job payload")
    }

    fn submit_share(&self, _job: &Job, nonce: u32) {
        info!(LOGGER, "null work source: share with nonce {:08x}", nonce);
    }

    fn hashrate_changed(&self, mhps: f64) {
        trace!(LOGGER, "null work source: hash rate now {:.2} MH/s", mhps);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_job_rejects_short_payload() {
        assert!(Job::new(vec![0u8; 75], [0u8; 32], None).is_err());
        assert!(Job::new(vec![0u8; 76], [0u8; 32], None).is_ok());
    }

    #[test]
    fn test_validation_job_payload() {
        let job = Job::validation();
        let payload = job.device_payload();
        assert_eq!(&payload[..12], &hex::decode("4c0afa494de837d81a269421").unwrap()[..]);
        assert_eq!(
            &payload[12..],
            &hex::decode("1625cbf1a5bc6ba648d1218441389e00a9dc79768a2fc6f2b79c70cf576febd0")
                .unwrap()[..]
        );
        assert_eq!(job.check, Some(VALIDATION_NONCE));
    }

    #[test]
    fn test_hash_with_nonce_matches_full_header_hash() {
        // build an arbitrary 80 byte header and the matching midstate
        let mut header = [0u8; 80];
        for (i, byte) in header.iter_mut().enumerate() {
            *byte = (i * 13 + 7) as u8;
        }

        let mut engine = sha256::Hash::engine();
        engine.input(&header[..64]);
        let midstate_be = engine.midstate().0;
        // job midstates store the state words little endian
        let mut midstate_le = [0u8; 32];
        for i in 0..8 {
            let word = BigEndian::read_u32(&midstate_be[i * 4..i * 4 + 4]);
            LittleEndian::write_u32(&mut midstate_le[i * 4..i * 4 + 4], word);
        }

        let job = Job::new(header[..76].to_vec(), midstate_le, None).unwrap();
        let nonce = LittleEndian::read_u32(&header[76..80]);

        let single = sha256::Hash::hash(&header[..]);
        let expected = sha256::Hash::hash(&single[..]).into_inner();
        assert_eq!(job.hash_with_nonce(nonce), expected);
    }

    #[test]
    fn test_long_poll_staleness() {
        let pool = Pool::new("test", 1);
        let job = Job::new(vec![0u8; 76], [0u8; 32], Some(pool.clone())).unwrap();
        assert!(!job.is_stale());
        pool.advance_epoch();
        assert!(job.is_stale());
    }

    #[test]
    fn test_null_work_source_produces_unique_jobs() {
        let source = NullWorkSource::new();
        let first = source.fetch_job();
        let second = source.fetch_job();
        assert_ne!(first.device_payload()[..], second.device_payload()[..]);
    }
}
