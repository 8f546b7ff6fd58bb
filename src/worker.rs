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

//! Per device worker: the job hand-off state machine and the result
//! processor.
//!
//! Two threads drive one board. The control thread fetches work and places
//! it into the pending slot; the responder thread uploads pending jobs to
//! the hardware, polls the result registers, reports shares and feeds the
//! clock tuner. Both share one monitor (mutex plus condition variable) that
//! owns the job slots and all session flags. A job is never both pending and
//! current; only the responder performs the transition, while holding the
//! monitor.

use crate::bitstream;
use crate::config::{self, Config};
use crate::device::ZtexDevice;
use crate::error::{self, Error, ErrorKind};
use crate::job::{Job, WorkSource};
use crate::misc::LOGGER;
use crate::stats::{ShareOutcome, Snapshot, Stats};
use crate::tuner::{self, FreqTuner};
use crate::usb;

use slog::{error, info, trace, warn};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Explicit session lifecycle; every failure goes through `Failed` and a
/// full restart, never through partial recovery
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    UploadingValidation,
    AwaitingValidationAck,
    Validating,
    Running,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Everything the two threads share, owned by one monitor
struct Shared {
    state: SessionState,
    /// Job the hardware is processing
    job: Option<Job>,
    /// Job uploaded but not yet acknowledged
    next_job: Option<Job>,
    /// A long poll invalidated the work in flight
    canceled: bool,
    /// The validation job produced its known nonce
    check_success: bool,
    /// The responder wants fresh work as soon as possible
    urgent: bool,
    /// Error deposited by whichever side failed first
    error: Option<ErrorKind>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            job: None,
            next_job: None,
            canceled: false,
            check_success: false,
            urgent: false,
            error: None,
        }
    }

    /// Re-raise an error the other thread deposited
    fn rethrow(&self) -> error::Result<()> {
        if let Some(kind) = &self.error {
            Err(Error::from(kind.clone()))?
        }
        Ok(())
    }
}

struct Monitor {
    shared: Mutex<Shared>,
    wakeup: Condvar,
}

/// Device state the responder thread owns exclusively: the hardware handle,
/// the clock tuner and the result window used for overflow detection
struct HashCore {
    device: ZtexDevice,
    tuner: FreqTuner,
    golden: Vec<u32>,
    nonce: Vec<u32>,
    hash7: Vec<u32>,
    overflow_count: u64,
    offs_nonces: i32,
}

impl HashCore {
    fn new(device: ZtexDevice) -> error::Result<Self> {
        let descriptor = device.descriptor();
        let num_nonces = descriptor.num_nonces;
        let offs_nonces = descriptor.offs_nonces;
        let freq_m = descriptor.freq_m;

        // start at the descriptor default clock
        device.set_freq(freq_m)?;
        info!(
            LOGGER,
            "{}: clock set to {:.2} MHz",
            device.serial(),
            device.descriptor().frequency_mhz(freq_m)
        );

        Ok(Self {
            device,
            tuner: FreqTuner::new(),
            golden: vec![0; num_nonces],
            nonce: vec![0; num_nonces],
            hash7: vec![0; num_nonces],
            overflow_count: 0,
            offs_nonces,
        })
    }

    fn set_freq_delta(&self, freq_delta: i32) -> error::Result<()> {
        let descriptor = self.device.descriptor();
        let m = (descriptor.freq_m as i32 + freq_delta)
            .max(0)
            .min(descriptor.freq_max_m as i32) as u8;
        self.device.set_freq(m)?;
        info!(
            LOGGER,
            "{}: clock adjusted to {:.2} MHz (offset {})",
            self.device.serial(),
            descriptor.frequency_mhz(m),
            freq_delta
        );
        Ok(())
    }

    /// Upload a job payload; the hardware restarts its nonce counters
    fn send_data(&mut self, payload: &[u8]) -> error::Result<()> {
        self.device.send_hash_data(payload)?;
        for nonce in self.nonce.iter_mut() {
            *nonce = 0;
        }
        Ok(())
    }

    /// Poll the result registers and fold them into the window. The running
    /// nonce counter moving backwards means the hardware wrapped its 2^32
    /// keyspace; the low bits are ignored to tolerate slot jitter.
    fn read_nonces(&mut self) -> error::Result<()> {
        let slots = self.device.read_hash_data()?;
        let mut overflow = false;
        for (i, slot) in slots.iter().enumerate() {
            self.golden[i] = slot.golden_nonce.wrapping_sub(self.offs_nonces as u32);
            let nonce = slot.nonce.wrapping_sub(self.offs_nonces as u32);
            overflow = overflow || (nonce >> 4) < (self.nonce[i] >> 4);
            self.nonce[i] = nonce;
            self.hash7[i] = slot.hash7;
        }
        if overflow {
            self.overflow_count += 1;
        }
        Ok(())
    }
}

/// Responder-local bookkeeping that survives across loop iterations
struct ListenerCtx {
    /// Recently reported golden nonces, to not resubmit duplicates
    recent: VecDeque<u32>,
    /// Overflow count already handled
    overflow_seen: u64,
}

impl ListenerCtx {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
            overflow_seen: 0,
        }
    }
}

/// One worker drives one board through attach, validation and mining.
pub struct ZtexWorker {
    name: String,
    config: Config,
    work_source: Arc<dyn WorkSource>,
    monitor: Monitor,
    stats: Mutex<Stats>,
    dead: AtomicBool,
}

impl ZtexWorker {
    pub fn new(config: Config, work_source: Arc<dyn WorkSource>) -> Arc<Self> {
        let name = config.name.clone().unwrap_or_else(|| {
            match &config.serial {
                Some(serial) => format!("ztex {}", serial),
                None => "ztex".to_string(),
            }
        });
        Arc::new(Self {
            name,
            config,
            work_source,
            monitor: Monitor {
                shared: Mutex::new(Shared::new()),
                wakeup: Condvar::new(),
            },
            stats: Mutex::new(Stats::new()),
            dead: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this worker gave up its device (managed mode only)
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn session_state(&self) -> SessionState {
        self.lock_shared().state
    }

    /// Managed mode: run one session on an already opened device and mark
    /// the worker dead afterwards so the hotplug manager can retire it
    pub fn attach(self: Arc<Self>, device: ZtexDevice) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("{}_main", self.name))
            .spawn(move || {
                if let Err(e) = self.session(device) {
                    error!(LOGGER, "{}: session failed: {}", self.name, e);
                }
                self.dead.store(true, Ordering::SeqCst);
            })
            .expect("BUG: cannot spawn worker main thread")
    }

    /// Standalone mode: discover the device, run sessions and restart after
    /// failures until the error is permanent for this device
    pub fn run(self: &Arc<Self>) {
        loop {
            if let Err(e) = self.discover_and_run() {
                match e.kind() {
                    ErrorKind::DeviceNotSupported(_)
                    | ErrorKind::InvalidFirmware(_)
                    | ErrorKind::Capability(_) => {
                        error!(LOGGER, "{}: giving up: {}", self.name, e);
                        self.dead.store(true, Ordering::SeqCst);
                        return;
                    }
                    _ => error!(LOGGER, "{}: session failed: {}", self.name, e),
                }
            }
            thread::sleep(config::RESTART_COOLDOWN);
        }
    }

    fn discover_and_run(self: &Arc<Self>) -> error::Result<()> {
        let mut transports = usb::scan(self.config.serial.as_ref().map(|s| s.as_str()))?;
        if transports.is_empty() {
            info!(LOGGER, "{}: no device found, rescanning", self.name);
            return Ok(());
        }
        let device = ZtexDevice::new(Box::new(transports.remove(0)))?;
        self.session(device)
    }

    /// One full session: configure the FPGA, bootstrap with the validation
    /// job and mine until something fails. All session state is rebuilt from
    /// scratch on entry; nothing survives from a failed predecessor.
    fn session(self: &Arc<Self>, mut device: ZtexDevice) -> error::Result<()> {
        {
            let mut shared = self.lock_shared();
            *shared = Shared::new();
            self.transition(&mut shared, SessionState::UploadingValidation);
        }
        {
            let mut stats = self.lock_stats();
            stats.mhps = 0.0;
            stats.current_pool = None;
        }

        let configure_started = Instant::now();
        if !self.config.force_bitstream && device.fpga_configured()? {
            info!(
                LOGGER,
                "{}: FPGA already configured, skipping bitstream upload", self.name
            );
        } else {
            let path = self
                .config
                .bitstream_dir
                .join(format!("{}.bit", device.descriptor().bitfile_name));
            let image = bitstream::load_bitstream(&path)?;
            device.configure_fpga(&image, true, self.config.bit_swap, self.config.ep0_force)?;
            info!(
                LOGGER,
                "{}: configuring the FPGA took {} ms",
                self.name,
                configure_started.elapsed().as_millis()
            );
        }

        let core = HashCore::new(device)?;

        let listener = {
            let worker = Arc::clone(self);
            thread::Builder::new()
                .name(format!("{}_listener", self.name))
                .spawn(move || worker.listener(core))?
        };

        let result = self.drive();

        // make sure the responder observes the failure and dies with us
        {
            let mut shared = self.lock_shared();
            if shared.error.is_none() {
                shared.error = Some(match &result {
                    Err(e) => e.kind(),
                    Ok(()) => ErrorKind::General("session ended".to_string()),
                });
            }
            self.transition(&mut shared, SessionState::Failed);
            self.monitor.wakeup.notify_all();
        }
        let _ = listener.join();
        self.lock_stats().mhps = 0.0;

        result
    }

    /// Control loop. Holds the monitor by default and releases it only while
    /// blocked on the work source or parked on the condition variable.
    fn drive(&self) -> error::Result<()> {
        let mut shared = self.lock_shared();

        // bootstrap with the known-answer job
        self.transition(&mut shared, SessionState::AwaitingValidationAck);
        shared.next_job = Some(Job::validation());

        shared = self.wait_while(shared, config::JOB_ACK_TIMEOUT, |s| {
            s.error.is_none() && s.next_job.is_some()
        });
        shared.rethrow()?;
        if shared.next_job.is_some() {
            Err(ErrorKind::General(
                "timeout waiting for job ACK".to_string(),
            ))?
        }

        self.transition(&mut shared, SessionState::Validating);
        shared = self.wait_while(shared, config::VALIDATION_TIMEOUT, |s| {
            s.error.is_none() && !s.check_success
        });
        shared.rethrow()?;
        if !shared.check_success {
            Err(ErrorKind::Validation(
                "timeout waiting for the validation job to finish".to_string(),
            ))?
        }

        // the responder measured the hash rate while validating
        let mhps = self.lock_stats().mhps;
        info!(LOGGER, "{}: validated, running at {:.2} MH/s", self.name, mhps);

        // time for one 2^32 sweep bounds the job interval; cap it so new
        // block templates still reach the device in time and leave margin
        // for transfer latency
        let sweep_s = (config::MAX_JOB_INTERVAL_S).min((u32::max_value() as f64 + 1.0) / 1e6 / mhps);
        let interval_s = self.config.job_interval_s.min((sweep_s * 0.8 - 1.0).max(0.5));
        info!(LOGGER, "{}: job interval: {:.2} s", self.name, interval_s);
        self.work_source.hashrate_changed(mhps);
        let interval = Duration::from_secs_f64(interval_s);

        self.transition(&mut shared, SessionState::Running);

        loop {
            shared.canceled = false;
            shared.urgent = false;

            // the fetch may block indefinitely; hand the monitor back to the
            // responder while it does
            drop(shared);
            let job = self.work_source.fetch_job();
            self.lock_stats().jobs_accepted += 1;
            shared = self.lock_shared();

            // a long poll may have fired while we fetched; only keep the job
            // if it is from the new epoch already
            if shared.canceled && job.is_stale() {
                continue;
            }
            shared.canceled = false;
            shared.rethrow()?;

            shared.next_job = Some(job);
            shared = self.wait_while(shared, config::JOB_ACK_TIMEOUT, |s| {
                s.error.is_none() && s.next_job.is_some()
            });
            shared.rethrow()?;
            if shared.next_job.is_some() {
                Err(ErrorKind::General(
                    "timeout waiting for job ACK".to_string(),
                ))?
            }
            // canceled while uploading: fetch fresh work without burning a
            // full interval on stale data
            if shared.canceled {
                continue;
            }

            shared = self.wait_while(shared, interval, |s| {
                s.error.is_none() && !s.canceled && !s.urgent
            });
            shared.rethrow()?;
        }
    }

    /// Responder thread entry point: deposit any failure into the shared
    /// error slot, wake the control thread and terminate
    fn listener(&self, core: HashCore) {
        let mut core = core;
        let mut ctx = ListenerCtx::new();
        loop {
            match self.listen_step(&mut core, &mut ctx) {
                Ok(true) => continue,
                Ok(false) => return,
                Err(e) => {
                    error!(LOGGER, "{}: responder failed: {}", self.name, e);
                    let mut shared = self.lock_shared();
                    if shared.error.is_none() {
                        shared.error = Some(e.kind());
                    }
                    self.monitor.wakeup.notify_all();
                    return;
                }
            }
        }
    }

    /// One responder iteration. Hand-off takes priority over polling.
    /// Returns `Ok(false)` once the control thread signalled a teardown.
    fn listen_step(&self, core: &mut HashCore, ctx: &mut ListenerCtx) -> error::Result<bool> {
        {
            let mut shared = self.lock_shared();
            if shared.error.is_some() {
                return Ok(false);
            }
            if let Some(mut job) = shared.next_job.take() {
                core.send_data(&job.device_payload())?;
                job.start_time = Some(Instant::now());

                // the replaced job is done; bank the time it was processed
                let finished = shared.job.take();
                {
                    let mut stats = self.lock_stats();
                    if let Some(started) = finished.and_then(|job| job.start_time) {
                        stats.mhashes += started.elapsed().as_secs_f64() * stats.mhps;
                    }
                    stats.current_pool = job.pool.as_ref().map(|pool| pool.name.clone());
                }

                shared.job = Some(job);
                self.monitor.wakeup.notify_all();
                return Ok(true);
            }
        }

        core.read_nonces()?;

        // a previously unseen nonzero golden nonce is a share
        let mut found = None;
        for &golden in core.golden.iter() {
            if golden != 0 && !ctx.recent.contains(&golden) {
                ctx.recent.push_back(golden);
                while ctx.recent.len() > 2 * core.golden.len() + 2 {
                    ctx.recent.pop_front();
                }
                found = Some(golden);
                break;
            }
        }

        match found {
            Some(nonce) => self.process_share(core, nonce)?,
            None => {
                if core.overflow_count > ctx.overflow_seen {
                    ctx.overflow_seen = core.overflow_count;
                    self.process_overflow()?;
                } else if self.feed_tuner(core)? {
                    thread::sleep(config::POLL_IDLE_SLEEP);
                }
            }
        }
        Ok(true)
    }

    fn process_share(&self, core: &mut HashCore, nonce: u32) -> error::Result<()> {
        let job = {
            let shared = self.lock_shared();
            shared.job.clone().ok_or_else(|| {
                Error::from(ErrorKind::General(
                    "device sent a share before getting a job".to_string(),
                ))
            })?
        };
        let started = job.start_time.ok_or_else(|| {
            Error::from(ErrorKind::General(
                "BUG: current job has no start time".to_string(),
            ))
        })?;

        // latency critical, report the share before anything else
        self.work_source.submit_share(&job, nonce);

        // the device walks the keyspace sequentially, so the running counter
        // over the elapsed time is the effective hash rate
        let elapsed = started.elapsed().as_secs_f64();
        let mhps = core.nonce[0] as f64 / 1e6 / elapsed;
        self.lock_stats().mhps = mhps;
        self.work_source.hashrate_changed(mhps);
        trace!(
            LOGGER,
            "{}: share {:08x}, {:.2} MH/s",
            self.name,
            nonce,
            mhps
        );

        if let Some(check) = job.check {
            if nonce != check {
                Err(ErrorKind::Validation(format!(
                    "device returned nonce {:08x} instead of {:08x}",
                    nonce, check
                )))?
            }
            // known answer matched: the device computes correctly
            core.tuner.unlock();
            let mut shared = self.lock_shared();
            shared.check_success = true;
            self.monitor.wakeup.notify_all();
        }
        Ok(())
    }

    /// The hardware walked all 2^32 nonces before new work arrived
    fn process_overflow(&self) -> error::Result<()> {
        warn!(LOGGER, "{}: exhausted keyspace", self.name);
        let mut shared = self.lock_shared();

        // a validation job that sweeps the whole keyspace without finding
        // its known share means the hardware is broken, unless fresh work is
        // about to replace it anyway
        let validating = shared.job.as_ref().map_or(false, |job| job.check.is_some());
        if validating && shared.next_job.is_none() {
            Err(ErrorKind::Validation(
                "validation job exhausted keyspace without finding a share".to_string(),
            ))?
        }

        // the device is redoing old work now; bank the useful time
        if let Some(started) = shared.job.as_mut().and_then(|job| job.start_time.take()) {
            let mut stats = self.lock_stats();
            stats.mhashes += started.elapsed().as_secs_f64() * stats.mhps;
        }

        shared.urgent = true;
        self.monitor.wakeup.notify_all();
        Ok(())
    }

    /// Between shares, judge the hash the hardware computed for its current
    /// nonce and feed the verdict to the clock tuner. Returns whether a
    /// sample was taken (the caller then backs off briefly).
    fn feed_tuner(&self, core: &mut HashCore) -> error::Result<bool> {
        let verdict = {
            let shared = self.lock_shared();
            if shared.next_job.is_some() || core.nonce[0] == 0 {
                return Ok(false);
            }
            match &shared.job {
                Some(job) => tuner::check_nonce(job, core.nonce[0], core.hash7[0]),
                None => return Ok(false),
            }
        };
        if !verdict {
            trace!(
                LOGGER,
                "{}: nonce {:08x} failed the hash check",
                self.name,
                core.nonce[0]
            );
        }
        if let Some(freq_delta) = core.tuner.record(verdict) {
            core.set_freq_delta(freq_delta)?;
        }
        Ok(true)
    }

    /// Long poll upcall: discard work for the given chain as soon as
    /// possible. No-op when the device mines a different chain.
    pub fn cancel(&self, chain: crate::job::ChainId) {
        let mut shared = self.lock_shared();
        let affected = |job: &Option<Job>| {
            job.as_ref()
                .and_then(|job| job.chain())
                .map_or(false, |job_chain| job_chain == chain)
        };
        if affected(&shared.job) || affected(&shared.next_job) {
            shared.canceled = true;
            self.monitor.wakeup.notify_all();
        }
    }

    /// Consistent statistics snapshot; only the statistics lock is taken
    pub fn statistics(&self, children: Vec<Snapshot>) -> Snapshot {
        let stats = self.lock_stats();
        Snapshot::from_stats(self.name.clone(), &stats, children)
    }

    /// Pool layer reports the fate of an earlier submitted share
    pub fn account_share(&self, outcome: ShareOutcome) {
        let mut stats = self.lock_stats();
        match outcome {
            ShareOutcome::Accepted(difficulty) => stats.accepted += difficulty,
            ShareOutcome::Rejected(difficulty) => stats.rejected += difficulty,
            ShareOutcome::Invalid => stats.invalid += 1,
        }
    }

    fn transition(&self, shared: &mut Shared, state: SessionState) {
        trace!(LOGGER, "{}: {} -> {}", self.name, shared.state, state);
        shared.state = state;
    }

    fn wait_while<'a, F>(
        &self,
        guard: MutexGuard<'a, Shared>,
        timeout: Duration,
        mut condition: F,
    ) -> MutexGuard<'a, Shared>
    where
        F: FnMut(&Shared) -> bool,
    {
        let (guard, _) = self
            .monitor
            .wakeup
            .wait_timeout_while(guard, timeout, |shared| condition(shared))
            .expect("BUG: job monitor poisoned");
        guard
    }

    fn lock_shared(&self) -> MutexGuard<Shared> {
        self.monitor.shared.lock().expect("BUG: job monitor poisoned")
    }

    fn lock_stats(&self) -> MutexGuard<Stats> {
        self.stats.lock().expect("BUG: statistics lock poisoned")
    }
}
