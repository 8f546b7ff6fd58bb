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

//! Hotplug device manager: periodically rescans the bus, spawns one worker
//! per board and retires workers whose session died. Thin glue around
//! [`crate::worker::ZtexWorker`].

use crate::config::Config;
use crate::device::ZtexDevice;
use crate::error;
use crate::job::{ChainId, WorkSource};
use crate::misc::LOGGER;
use crate::stats::{self, Snapshot, Stats};
use crate::usb::{self, Transport};
use crate::worker::ZtexWorker;

use slog::{error, info, warn};

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

struct Child {
    serial: String,
    worker: Arc<ZtexWorker>,
    handle: Option<thread::JoinHandle<()>>,
}

pub struct HotplugManager {
    name: String,
    config: Config,
    work_source: Arc<dyn WorkSource>,
    children: Mutex<Vec<Child>>,
    /// Accumulated counters of retired children
    stats: Mutex<Stats>,
}

impl HotplugManager {
    pub fn new(config: Config, work_source: Arc<dyn WorkSource>) -> Arc<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| "ztex hotplug manager".to_string());
        Arc::new(Self {
            name,
            config,
            work_source,
            children: Mutex::new(Vec::new()),
            stats: Mutex::new(Stats::new()),
        })
    }

    /// Scan loop; never returns
    pub fn run(&self) {
        info!(LOGGER, "{}: watching the bus for ZTEX boards", self.name);
        loop {
            self.reap_dead();
            if let Err(e) = self.rescan() {
                error!(LOGGER, "{}: bus scan failed: {}", self.name, e);
            }
            thread::sleep(self.config.scan_interval);
        }
    }

    /// Fold the final statistics of dead children into the accumulators and
    /// drop them; their serial becomes eligible for a fresh worker again
    fn reap_dead(&self) {
        let mut children = self.lock_children();
        let mut index = 0;
        while index < children.len() {
            if !children[index].worker.is_dead() {
                index += 1;
                continue;
            }
            let child = children.remove(index);
            if let Some(handle) = child.handle {
                let _ = handle.join();
            }
            let snapshot = child.worker.statistics(Vec::new());
            {
                let mut stats = self.lock_stats();
                stats.mhashes += snapshot.mhashes;
                stats.jobs_accepted += snapshot.jobs_accepted;
                stats.accepted += snapshot.accepted;
                stats.rejected += snapshot.rejected;
                stats.invalid += snapshot.invalid;
            }
            info!(LOGGER, "{}: retired worker for {}", self.name, child.serial);
        }
    }

    fn rescan(&self) -> error::Result<()> {
        let transports = usb::scan(self.config.serial.as_ref().map(|s| s.as_str()))?;
        let mut children = self.lock_children();
        for transport in transports {
            let serial = match transport.serial() {
                Some(serial) => serial,
                None => continue,
            };
            if children.iter().any(|child| child.serial == serial) {
                // already driven; the redundant handle closes on drop
                continue;
            }

            let device = match ZtexDevice::new(Box::new(transport)) {
                Ok(device) => device,
                Err(e) => {
                    warn!(LOGGER, "{}: skipping device {}: {}", self.name, serial, e);
                    continue;
                }
            };

            let mut config = self.config.clone();
            config.serial = Some(serial.clone());
            config.name = Some(format!("ztex {}", serial));
            let worker = ZtexWorker::new(config, Arc::clone(&self.work_source));
            info!(LOGGER, "{}: starting worker for {}", self.name, serial);
            let handle = Arc::clone(&worker).attach(device);
            children.push(Child {
                serial,
                worker,
                handle: Some(handle),
            });
        }
        Ok(())
    }

    /// Forward a long poll cancellation to every child
    pub fn cancel(&self, chain: ChainId) {
        for child in self.lock_children().iter() {
            child.worker.cancel(chain);
        }
    }

    /// Aggregated statistics: own accumulators plus all live children
    pub fn statistics(&self) -> Snapshot {
        let children: Vec<Snapshot> = self
            .lock_children()
            .iter()
            .map(|child| child.worker.statistics(Vec::new()))
            .collect();
        let stats = self.lock_stats();
        Snapshot {
            name: self.name.clone(),
            mhashes: stats.mhashes + stats::sum_f64(&children, |s| s.mhashes),
            mhps: stats::sum_f64(&children, |s| s.mhps),
            jobs_accepted: stats.jobs_accepted + stats::sum_u64(&children, |s| s.jobs_accepted),
            accepted: stats.accepted + stats::sum_u64(&children, |s| s.accepted),
            rejected: stats.rejected + stats::sum_u64(&children, |s| s.rejected),
            invalid: stats.invalid + stats::sum_u64(&children, |s| s.invalid),
            start_time: stats.start_time,
            current_pool: None,
            children,
        }
    }

    fn lock_children(&self) -> MutexGuard<Vec<Child>> {
        self.children.lock().expect("BUG: children lock poisoned")
    }

    fn lock_stats(&self) -> MutexGuard<Stats> {
        self.stats.lock().expect("BUG: statistics lock poisoned")
    }
}
