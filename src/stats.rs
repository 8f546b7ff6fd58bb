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

//! Worker statistics.
//!
//! The counters live behind their own lock, separate from the job hand-off
//! monitor, so reporting reads never compete with the mining threads. When a
//! thread needs both locks it takes the monitor first, the statistics lock
//! second.

use std::time::SystemTime;

/// Cumulative counters of one worker
#[derive(Debug)]
pub struct Stats {
    /// Total megahashes calculated since startup
    pub mhashes: f64,
    /// Current hash rate in MH/s
    pub mhps: f64,
    /// Jobs accepted from the work source
    pub jobs_accepted: u64,
    /// Accepted shares, weighted by difficulty
    pub accepted: u64,
    /// Rejected shares, weighted by difficulty
    pub rejected: u64,
    /// Shares the pool considered invalid
    pub invalid: u64,
    pub start_time: SystemTime,
    /// Name of the pool the current job came from
    pub current_pool: Option<String>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            mhashes: 0.0,
            mhps: 0.0,
            jobs_accepted: 0,
            accepted: 0,
            rejected: 0,
            invalid: 0,
            start_time: SystemTime::now(),
            current_pool: None,
        }
    }
}

/// Outcome of a submitted share as reported back by the pool layer
#[derive(Clone, Copy, Debug)]
pub enum ShareOutcome {
    /// Accepted at the given difficulty
    Accepted(u64),
    /// Rejected at the given difficulty
    Rejected(u64),
    Invalid,
}

/// Consistent point-in-time view of one worker (plus its children, for the
/// hotplug manager)
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub name: String,
    pub mhashes: f64,
    pub mhps: f64,
    pub jobs_accepted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub start_time: SystemTime,
    pub current_pool: Option<String>,
    pub children: Vec<Snapshot>,
}

impl Snapshot {
    pub fn from_stats(name: String, stats: &Stats, children: Vec<Snapshot>) -> Self {
        Self {
            name,
            mhashes: stats.mhashes,
            mhps: stats.mhps,
            jobs_accepted: stats.jobs_accepted,
            accepted: stats.accepted,
            rejected: stats.rejected,
            invalid: stats.invalid,
            start_time: stats.start_time,
            current_pool: stats.current_pool.clone(),
            children,
        }
    }
}

pub fn sum_f64<F>(children: &[Snapshot], field: F) -> f64
where
    F: Fn(&Snapshot) -> f64,
{
    children.iter().map(field).sum()
}

pub fn sum_u64<F>(children: &[Snapshot], field: F) -> u64
where
    F: Fn(&Snapshot) -> u64,
{
    children.iter().map(field).sum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_snapshot_sums() {
        let mut a = Snapshot::from_stats("a".to_string(), &Stats::new(), Vec::new());
        let mut b = Snapshot::from_stats("b".to_string(), &Stats::new(), Vec::new());
        a.mhps = 100.0;
        a.accepted = 7;
        b.mhps = 50.0;
        b.accepted = 3;
        let children = vec![a, b];
        assert!((sum_f64(&children, |s| s.mhps) - 150.0).abs() < 1e-9);
        assert_eq!(sum_u64(&children, |s| s.accepted), 10);
    }
}
