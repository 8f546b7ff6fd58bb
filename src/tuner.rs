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

//! Closed loop clock tuning.
//!
//! The tuner never talks to the hardware itself. It consumes good/bad
//! verdicts about nonces the device reported and decides when the clock
//! offset should move; the caller owning the device issues the actual clock
//! command.

use crate::job::Job;

use byteorder::{BigEndian, ByteOrder};

use std::time::{Duration, Instant};

/// Good samples required before the first upward step
const GOOD_TRIGGER_INITIAL: u32 = 1000;
/// Factor the trigger grows by whenever the clock had to back off
const GOOD_TRIGGER_GROWTH: u32 = 5;
/// Bad samples tolerated before the ratio check engages
const BAD_SAMPLE_LIMIT: u32 = 10;
/// Smallest good:bad ratio still considered healthy
const MIN_GOOD_BAD_RATIO: u32 = 33;
/// Settling time after a clock change; verdicts within it are indeterminate
const SETTLE_GRACE: Duration = Duration::from_millis(250);

/// Nonce offsets the hardware is known to report around the actual solution
const NONCE_OFFSETS: [i32; 5] = [0, 1, -1, 2, -2];
/// SHA-256 h7 initialisation vector the hardware leaves out of its reported
/// hash word
const SHA256_H7_IV: u32 = 0x5be0_cd19;

/// Check a reported nonce against the hash word the hardware computed for it
pub fn check_nonce(job: &Job, nonce: u32, hash7: u32) -> bool {
    let target = hash7.wrapping_add(SHA256_H7_IV);
    NONCE_OFFSETS.iter().any(|&offset| {
        let hash = job.hash_with_nonce(nonce.wrapping_add(offset as u32));
        BigEndian::read_u32(&hash[28..32]) == target
    })
}

/// Clock offset controller. Starts locked: nothing is tuned until the device
/// passed its validation job.
#[derive(Debug)]
pub struct FreqTuner {
    locked: bool,
    freq_delta: i32,
    good: u32,
    bad: u32,
    good_trigger: u32,
    grace_until: Option<Instant>,
}

impl FreqTuner {
    pub fn new() -> Self {
        Self {
            locked: true,
            freq_delta: 0,
            good: 0,
            bad: 0,
            good_trigger: GOOD_TRIGGER_INITIAL,
            grace_until: None,
        }
    }

    /// Enable tuning; called once the validation job succeeded
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn freq_delta(&self) -> i32 {
        self.freq_delta
    }

    pub fn good_trigger(&self) -> u32 {
        self.good_trigger
    }

    fn in_grace(&self, now: Instant) -> bool {
        self.grace_until.map_or(false, |until| now < until)
    }

    /// Record one validation verdict. Returns the new clock offset when the
    /// sample pushed the tuner over a decision threshold.
    pub fn record(&mut self, good: bool) -> Option<i32> {
        self.record_at(good, Instant::now())
    }

    pub fn record_at(&mut self, good: bool, now: Instant) -> Option<i32> {
        if self.locked || self.in_grace(now) {
            // indeterminate: the hardware may still be settling
            return None;
        }
        if good {
            self.good += 1;
            if self.good > self.good_trigger {
                if self.bad == 0 {
                    return Some(self.adjust(self.freq_delta + 1, now));
                }
                // some errors seen, but the ratio was acceptable
                self.good = 0;
                self.bad = 0;
            }
        } else {
            self.bad += 1;
            if self.bad > BAD_SAMPLE_LIMIT && self.good < MIN_GOOD_BAD_RATIO * self.bad {
                self.good_trigger = self.good_trigger.saturating_mul(GOOD_TRIGGER_GROWTH);
                return Some(self.adjust(self.freq_delta - 1, now));
            }
        }
        None
    }

    fn adjust(&mut self, freq_delta: i32, now: Instant) -> i32 {
        self.freq_delta = freq_delta;
        self.good = 0;
        self.bad = 0;
        self.grace_until = Some(now + SETTLE_GRACE);
        freq_delta
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use bitcoin_hashes::{sha256, Hash, HashEngine};
    use byteorder::LittleEndian;

    #[test]
    fn test_check_nonce_accepts_neighbouring_offsets() {
        // build a header and the matching job so the hash is known
        let mut header = [0u8; 80];
        for (i, byte) in header.iter_mut().enumerate() {
            *byte = (i * 31 + 5) as u8;
        }
        let mut engine = sha256::Hash::engine();
        engine.input(&header[..64]);
        let midstate_be = engine.midstate().0;
        let mut midstate_le = [0u8; 32];
        for i in 0..8 {
            let word = BigEndian::read_u32(&midstate_be[i * 4..i * 4 + 4]);
            LittleEndian::write_u32(&mut midstate_le[i * 4..i * 4 + 4], word);
        }
        let job = Job::new(header[..76].to_vec(), midstate_le, None).unwrap();
        let nonce = LittleEndian::read_u32(&header[76..80]);

        // what the hardware would report: hash word 7 without the IV term
        let digest = job.hash_with_nonce(nonce);
        let hash7 = BigEndian::read_u32(&digest[28..32]).wrapping_sub(SHA256_H7_IV);

        assert!(check_nonce(&job, nonce, hash7));
        // the hardware may report the nonce slightly off
        assert!(check_nonce(&job, nonce.wrapping_sub(2), hash7));
        assert!(check_nonce(&job, nonce.wrapping_add(1), hash7));
        // anything further away is a miscomputation
        assert!(!check_nonce(&job, nonce.wrapping_add(9), hash7));
    }

    fn unlocked_tuner() -> FreqTuner {
        let mut tuner = FreqTuner::new();
        tuner.unlock();
        tuner
    }

    /// Feed samples with fabricated timestamps far enough apart to stay out
    /// of the settling grace window
    fn feed(tuner: &mut FreqTuner, base: Instant, samples: &[bool]) -> Vec<i32> {
        let mut changes = Vec::new();
        for (i, &good) in samples.iter().enumerate() {
            let at = base + Duration::from_secs(i as u64 + 1);
            if let Some(delta) = tuner.record_at(good, at) {
                changes.push(delta);
            }
        }
        changes
    }

    #[test]
    fn test_locked_tuner_ignores_samples() {
        let mut tuner = FreqTuner::new();
        let base = Instant::now();
        let changes = feed(&mut tuner, base, &[false; 100]);
        assert!(changes.is_empty());
        assert_eq!(tuner.freq_delta(), 0);
    }

    #[test]
    fn test_bad_ratio_steps_down_and_grows_trigger() {
        let mut tuner = unlocked_tuner();
        let base = Instant::now();
        // eleven bad samples with no good ones: ratio is hopeless
        let changes = feed(&mut tuner, base, &[false; 11]);
        assert_eq!(changes, vec![-1]);
        assert_eq!(tuner.freq_delta(), -1);
        assert_eq!(tuner.good_trigger(), GOOD_TRIGGER_INITIAL * 5);
    }

    #[test]
    fn test_bad_ratio_with_some_good_samples_still_steps_down() {
        let mut tuner = unlocked_tuner();
        let base = Instant::now();
        // 20 good samples cannot outweigh 11 bad ones at 33:1
        let mut samples = vec![true; 20];
        samples.extend_from_slice(&[false; 11]);
        let changes = feed(&mut tuner, base, &samples);
        assert_eq!(changes, vec![-1]);
    }

    #[test]
    fn test_clean_run_steps_up_once() {
        let mut tuner = unlocked_tuner();
        let base = Instant::now();
        let samples = vec![true; GOOD_TRIGGER_INITIAL as usize + 1];
        let changes = feed(&mut tuner, base, &samples);
        assert_eq!(changes, vec![1]);
        assert_eq!(tuner.freq_delta(), 1);
        // counters were reset by the adjustment
        assert_eq!(tuner.good, 0);
    }

    #[test]
    fn test_acceptable_error_rate_only_resets_counters() {
        let mut tuner = unlocked_tuner();
        let base = Instant::now();
        let mut samples = vec![true; 500];
        samples.push(false);
        samples.extend(vec![true; GOOD_TRIGGER_INITIAL as usize - 500 + 1]);
        let changes = feed(&mut tuner, base, &samples);
        assert!(changes.is_empty());
        assert_eq!(tuner.freq_delta(), 0);
        assert_eq!(tuner.good, 0);
        assert_eq!(tuner.bad, 0);
    }

    #[test]
    fn test_grace_window_swallows_samples() {
        let mut tuner = unlocked_tuner();
        let base = Instant::now();
        feed(&mut tuner, base, &[false; 11]);
        assert_eq!(tuner.freq_delta(), -1);

        // samples right after the change are indeterminate
        let just_after = base + Duration::from_secs(11) + Duration::from_millis(100);
        assert_eq!(tuner.record_at(false, just_after), None);
        assert_eq!(tuner.bad, 0);

        // past the grace window they count again
        let later = base + Duration::from_secs(12);
        assert_eq!(tuner.record_at(false, later), None);
        assert_eq!(tuner.bad, 1);
    }
}
