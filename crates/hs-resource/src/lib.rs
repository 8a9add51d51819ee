//! # hs-resource
//!
//! Resource managers own a pool of schedulable slots and run trials
//! against them asynchronously.  Every variant reports completions over a
//! channel owned by the manager; the experiment loop is the single
//! consumer, which keeps proposer access serialized without any lock
//! juggling in callbacks.

mod aws;
mod cpu;
mod earlystop;
mod gpu;
mod passive;
mod ssh;
pub(crate) mod worker;

pub use aws::AwsResourceManager;
pub use cpu::CpuResourceManager;
pub use earlystop::{bandit_stop, median_stop, truncation_stop, EarlyStopMonitor};
pub use gpu::GpuResourceManager;
pub use passive::PassiveResourceManager;
pub use ssh::{parse_host_spec, HostSpec, SshResourceManager};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use hs_store::Connector;
use hs_types::{
    BestResult, ExperimentConfig, ExperimentStatus, HsResult, Job, JobStatus, ResourceError,
    ResourceKind,
};

/// Default deadline for one job attempt on remote and passive slots.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Delivered once per dispatched job, over the manager's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    pub jid: i64,
    pub outcome: JobOutcome,
}

/// How one job attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Script exited cleanly and reported a final score.
    Finished(f64),
    /// Stopped by an early-stopping policy; carries the last
    /// intermediate score when one was reported.
    EarlyStopped(Option<f64>),
    /// Non-zero exit, missing result marker, crash, or deadline;
    /// the string is the operator-facing diagnostic.
    Failed(String),
}

/// Result of draining a manager at teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub still_running: usize,
    pub waited: Duration,
    pub best: Option<BestResult>,
}

/// Per-dispatch execution context assembled by the experiment.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Extra environment for the job process.
    pub env: BTreeMap<String, String>,
    /// Deadline for one attempt; None uses [`DEFAULT_JOB_TIMEOUT`] where
    /// a deadline is enforced at all.
    pub timeout: Option<Duration>,
    /// Persist intermediate-result lines in the store.
    pub track_intermediate: bool,
}

impl RunContext {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            env: config.runtime_args.env.clone(),
            timeout: config.resource_args.timeout_secs.map(Duration::from_secs),
            track_intermediate: config.track_intermediate(),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_JOB_TIMEOUT)
    }
}

/// Slot bookkeeping shared by every manager variant.
///
/// Invariants: a slot is bound to at most one running job; releasing a
/// job that is no longer tracked is a logged no-op, so a duplicate
/// completion can never double-free a slot.
pub struct ManagerCore {
    connector: Arc<dyn Connector>,
    eid: AtomicI64,
    maximize: bool,
    /// jid → rid for in-flight jobs.
    jobs: DashMap<i64, i64>,
    /// Jobs flagged for early termination; workers poll this.
    stopped: DashSet<i64>,
    suspended: AtomicBool,
    inflight: Arc<AtomicUsize>,
    tx: Sender<CompletionEvent>,
    rx: Receiver<CompletionEvent>,
    claim_lock: Mutex<()>,
    monitor: Mutex<Option<EarlyStopMonitor>>,
}

impl ManagerCore {
    pub fn new(connector: Arc<dyn Connector>, maximize: bool) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            connector,
            eid: AtomicI64::new(0),
            maximize,
            jobs: DashMap::new(),
            stopped: DashSet::new(),
            suspended: AtomicBool::new(false),
            inflight: Arc::new(AtomicUsize::new(0)),
            tx,
            rx,
            claim_lock: Mutex::new(()),
            monitor: Mutex::new(None),
        })
    }

    /// Hand ownership of an early-stop monitor to this core; it is shut
    /// down at [`ManagerCore::finish`].
    pub fn attach_monitor(&self, monitor: EarlyStopMonitor) {
        *self.monitor.lock() = Some(monitor);
    }

    fn stop_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn eid(&self) -> i64 {
        self.eid.load(Ordering::SeqCst)
    }

    pub fn set_eid(&self, eid: i64) {
        self.eid.store(eid, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &Receiver<CompletionEvent> {
        &self.rx
    }

    pub(crate) fn sender(&self) -> Sender<CompletionEvent> {
        self.tx.clone()
    }

    /// Resource bound to an in-flight job.
    pub fn rid_of(&self, jid: i64) -> Option<i64> {
        self.jobs.get(&jid).map(|entry| *entry)
    }

    pub fn running_jobs(&self) -> Vec<i64> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    /// Atomically claim one free slot of `rtype`, picked uniformly at
    /// random so callers cannot rely on ordering.  None when everything
    /// is busy or the manager is suspended.
    pub fn get_available(
        &self,
        username: &str,
        rtype: ResourceKind,
        blacklist: &[i64],
    ) -> Option<i64> {
        if self.is_suspended() {
            return None;
        }
        let _claim = self.claim_lock.lock();
        let rids = match self
            .connector
            .get_available_resource(username, rtype, blacklist)
        {
            Ok(rids) => rids,
            Err(e) => {
                warn!("resource lookup failed: {e}");
                return None;
            }
        };
        if rids.is_empty() {
            return None;
        }
        let pick = rids[rand::thread_rng().gen_range(0..rids.len())];
        match self.connector.take_available_resource(pick) {
            Ok(true) => Some(pick),
            Ok(false) => None,
            Err(e) => {
                warn!("resource claim failed: {e}");
                None
            }
        }
    }

    /// Bind a dispatched job to its slot.
    pub(crate) fn register(&self, jid: i64, rid: i64) {
        self.jobs.insert(jid, rid);
    }

    /// Undo the claim of a job whose dispatch failed before execution.
    pub(crate) fn abort_claim(&self, jid: i64) {
        if let Some((_, rid)) = self.jobs.remove(&jid) {
            if let Err(e) = self.connector.free_used_resource(rid) {
                warn!(rid, "failed to free resource: {e}");
            }
        }
    }

    /// Release the slot of a finished job and record the final result.
    /// Exactly-once: a jid that is no longer tracked is a logged no-op.
    pub fn finish_job(&self, jid: i64, score: Option<f64>, status: JobStatus) {
        match self.jobs.remove(&jid) {
            Some((_, rid)) => {
                if let Err(e) = self.connector.free_used_resource(rid) {
                    warn!(rid, "failed to free resource: {e}");
                }
                if let Err(e) = self.connector.job_finished(self.eid(), jid, score, status) {
                    warn!(jid, "failed to record job result: {e}");
                }
                self.stopped.remove(&jid);
                debug!(jid, rid, status = status.as_str(), "job finished");
            }
            None => {
                warn!(jid, "job finished after suspension or duplicate release, result may be lost");
            }
        }
    }

    /// Release the slot of a failed attempt that will be retried; the job
    /// record stays running.  Returns the freed rid for blacklisting.
    pub fn release_attempt(&self, jid: i64) -> Option<i64> {
        let (_, rid) = self.jobs.remove(&jid)?;
        if let Err(e) = self.connector.free_used_resource(rid) {
            warn!(rid, "failed to free resource: {e}");
        }
        if let Err(e) = self.connector.job_failed_attempt(jid) {
            warn!(jid, "failed to record failed attempt: {e}");
        }
        Some(rid)
    }

    /// Stop accepting new work and flag all in-flight jobs for
    /// termination.  In-flight work still reports through the channel.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        for entry in self.jobs.iter() {
            let jid = *entry.key();
            warn!(jid, "job is cancelled");
            self.stopped.insert(jid);
        }
    }

    pub fn mark_stopped(&self, jid: i64) {
        if !self.jobs.contains_key(&jid) {
            debug!(jid, "tried to stop a job not currently running");
        }
        self.stopped.insert(jid);
    }

    pub fn is_stopped(&self, jid: i64) -> bool {
        self.stopped.contains(&jid)
    }

    /// Persist one intermediate score line.
    pub(crate) fn record_intermediate(&self, jid: i64, score: f64) {
        if let Err(e) = self.connector.save_intermediate_result(jid, score) {
            warn!(jid, "could not save intermediate result: {e}");
        }
    }

    pub(crate) fn inflight_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.inflight)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Wait for in-flight jobs to report, bounded by `timeout`.
    pub fn drain(&self, timeout: Duration) -> (usize, Duration) {
        let started = Instant::now();
        while self.inflight() > 0 && started.elapsed() < timeout {
            std::thread::sleep(DRAIN_POLL);
        }
        (self.inflight(), started.elapsed())
    }

    /// Drain, close out the experiment record, and report the best result.
    pub fn finish(&self, timeout: Duration, status: ExperimentStatus) -> DrainReport {
        let (still_running, waited) = self.drain(timeout);
        self.stop_monitor();
        if still_running > 0 {
            warn!(still_running, "jobs still in flight at teardown");
        }
        let eid = self.eid();
        if let Err(e) = self.connector.end_experiment(eid, status) {
            warn!(eid, "failed to end experiment record: {e}");
        }
        let best = self
            .connector
            .get_best_result(eid, self.maximize)
            .unwrap_or_else(|e| {
                warn!(eid, "failed to query best result: {e}");
                None
            });
        DrainReport {
            still_running,
            waited,
            best,
        }
    }

    pub fn log_error_message(&self, msg: &str) {
        if let Err(e) = self.connector.log_error_message(self.eid(), msg) {
            warn!("failed to record error message: {e}");
        }
    }
}

/// Uniform contract over the resource variants.
///
/// Variants implement [`ResourceManager::run`], asynchronous dispatch of
/// one verified job onto a claimed slot, and inherit the bookkeeping.
pub trait ResourceManager: Send + Sync {
    fn core(&self) -> &Arc<ManagerCore>;

    fn kind(&self) -> ResourceKind;

    /// Begin asynchronous execution of `job` on the claimed slot.  Must
    /// not block; completion arrives on [`ResourceManager::events`].
    fn run(&self, job: &Job, rid: i64, ctx: &RunContext) -> HsResult<()>;

    fn set_eid(&self, eid: i64) {
        self.core().set_eid(eid);
    }

    /// Atomically claim one free slot, or None when all are busy.
    fn get_available(
        &self,
        username: &str,
        rtype: ResourceKind,
        blacklist: &[i64],
    ) -> Option<i64> {
        self.core().get_available(username, rtype, blacklist)
    }

    /// Job bookkeeping plus [`ResourceManager::run`].  The slot was
    /// already claimed by [`ResourceManager::get_available`]; dispatch
    /// failures free it before the error propagates.
    fn run_job(&self, job: &Job, rid: i64, ctx: &RunContext) -> HsResult<()> {
        let core = self.core();
        if core.is_suspended() {
            core.register(job.jid, rid);
            core.abort_claim(job.jid);
            return Err(ResourceError::Suspended.into());
        }
        core.register(job.jid, rid);
        match self.run(job, rid, ctx) {
            Ok(()) => Ok(()),
            Err(e) => {
                core.abort_claim(job.jid);
                Err(e)
            }
        }
    }

    /// Release the slot and record the final score/status.  Guaranteed
    /// exactly-once per dispatched job; duplicates are logged no-ops.
    fn finish_job(&self, jid: i64, score: Option<f64>, status: JobStatus) {
        self.core().finish_job(jid, score, status);
    }

    /// Free the slot of a failed attempt ahead of a retry.
    fn release_attempt(&self, jid: i64) -> Option<i64> {
        self.core().release_attempt(jid)
    }

    /// Completion events, one per dispatched job.
    fn events(&self) -> &Receiver<CompletionEvent> {
        self.core().events()
    }

    /// Stop accepting new work without killing in-flight jobs outright.
    fn suspend(&self) {
        self.core().suspend();
    }

    /// Drain outstanding jobs bounded by `timeout`, close the experiment
    /// record, and report the best result.
    fn finish(&self, timeout: Duration, status: ExperimentStatus) -> DrainReport {
        self.core().finish(timeout, status)
    }

    /// Flag a job for early termination.
    fn stop_job(&self, jid: i64) {
        self.core().mark_stopped(jid);
    }

    fn is_job_stopped(&self, jid: i64) -> bool {
        self.core().is_stopped(jid)
    }

    fn log_error_message(&self, msg: &str) {
        self.core().log_error_message(msg);
    }
}

/// Build the manager variant named by the experiment config.  This is
/// the full resource registry; nothing is looked up dynamically.
pub fn create_resource_manager(
    config: &ExperimentConfig,
    connector: Arc<dyn Connector>,
) -> HsResult<Box<dyn ResourceManager>> {
    let maximize = config.target.maximize();
    let manager: Box<dyn ResourceManager> = match config.resource {
        ResourceKind::Cpu => Box::new(CpuResourceManager::new(connector, maximize)),
        ResourceKind::Gpu => Box::new(GpuResourceManager::new(
            connector,
            maximize,
            config.resource_args.gpu_mapping.clone(),
        )?),
        ResourceKind::Node => Box::new(SshResourceManager::new(
            connector,
            maximize,
            &config.resource_args,
        )?),
        ResourceKind::Passive => Box::new(PassiveResourceManager::new(connector, maximize)),
        ResourceKind::Aws => Box::new(AwsResourceManager::new(
            connector,
            maximize,
            &config.resource_args,
        )?),
    };
    if let Some(early_stop) = &config.resource_args.early_stop {
        info!(policy = ?early_stop.policy, "early stopping enabled");
        let monitor =
            EarlyStopMonitor::start(Arc::clone(manager.core()), early_stop.clone(), maximize);
        manager.core().attach_monitor(monitor);
    }
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_store::MemoryConnector;

    fn core_with_slots(n: usize) -> (Arc<ManagerCore>, Vec<i64>) {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
        let rids = hs_store::seed_resources(&connector, ResourceKind::Cpu, n).unwrap();
        let core = ManagerCore::new(connector, true);
        (core, rids)
    }

    #[test]
    fn claim_is_exclusive_until_release() {
        let (core, rids) = core_with_slots(1);
        let rid = core.get_available("user", ResourceKind::Cpu, &[]).unwrap();
        assert_eq!(rid, rids[0]);
        assert!(core.get_available("user", ResourceKind::Cpu, &[]).is_none());

        core.register(7, rid);
        core.finish_job(7, Some(1.0), JobStatus::Finished);
        assert!(core.get_available("user", ResourceKind::Cpu, &[]).is_some());
    }

    #[test]
    fn concurrent_claims_never_share_a_slot() {
        let (core, _) = core_with_slots(4);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let core = Arc::clone(&core);
                std::thread::spawn(move || core.get_available("user", ResourceKind::Cpu, &[]))
            })
            .collect();

        let claimed: Vec<i64> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        // 4 slots → at most 4 winners, all distinct.
        assert!(claimed.len() <= 4);
        let mut dedup = claimed.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), claimed.len());
    }

    #[test]
    fn duplicate_finish_is_a_noop() {
        let (core, _) = core_with_slots(1);
        let rid = core.get_available("user", ResourceKind::Cpu, &[]).unwrap();
        core.set_eid(1);
        core.register(3, rid);

        core.finish_job(3, Some(0.5), JobStatus::Finished);
        // Second finish must not double-free the slot.
        core.finish_job(3, Some(0.5), JobStatus::Finished);

        let rid = core.get_available("user", ResourceKind::Cpu, &[]).unwrap();
        core.register(4, rid);
        // Slot busy again: nothing else available.
        assert!(core.get_available("user", ResourceKind::Cpu, &[]).is_none());
    }

    #[test]
    fn blacklist_respected_on_claim() {
        let (core, rids) = core_with_slots(2);
        let claimed = core
            .get_available("user", ResourceKind::Cpu, &[rids[0]])
            .unwrap();
        assert_eq!(claimed, rids[1]);
    }

    #[test]
    fn suspend_blocks_new_claims_and_flags_jobs() {
        let (core, _) = core_with_slots(2);
        let rid = core.get_available("user", ResourceKind::Cpu, &[]).unwrap();
        core.register(11, rid);

        core.suspend();
        assert!(core.get_available("user", ResourceKind::Cpu, &[]).is_none());
        assert!(core.is_stopped(11));
    }

    #[test]
    fn release_attempt_frees_slot_and_returns_rid() {
        let (core, _) = core_with_slots(1);
        let rid = core.get_available("user", ResourceKind::Cpu, &[]).unwrap();
        core.register(5, rid);

        assert_eq!(core.release_attempt(5), Some(rid));
        assert_eq!(core.release_attempt(5), None); // already released
        assert!(core.get_available("user", ResourceKind::Cpu, &[]).is_some());
    }

    #[test]
    fn drain_times_out_with_inflight_work() {
        let (core, _) = core_with_slots(1);
        core.inflight_handle().fetch_add(1, Ordering::SeqCst);
        let (still, waited) = core.drain(Duration::from_millis(120));
        assert_eq!(still, 1);
        assert!(waited >= Duration::from_millis(120));
    }
}
