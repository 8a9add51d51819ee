//! The experiment orchestrator: binds a proposer and a resource manager
//! and drives the propose-dispatch-evaluate loop until termination.
//!
//! The loop is the single consumer of the manager's completion channel,
//! so every proposer call is serialized without callbacks reaching into
//! shared state from worker threads.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hs_proposer::{create_proposer, Proposer, ProposerStatus};
use hs_resource::{
    create_resource_manager, CompletionEvent, JobOutcome, ResourceManager, RunContext,
};
use hs_store::Connector;
use hs_types::{
    config_error, BestResult, ExperimentConfig, ExperimentStatus, HsError, HsResult, Job,
    JobStatus, ProposerError,
};

const EVENT_POLL: Duration = Duration::from_millis(200);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// What an experiment run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub eid: i64,
    pub status: ExperimentStatus,
    pub best: Option<BestResult>,
}

fn submit_outcome_label(outcome: &SubmitOutcome) -> &'static str {
    match outcome {
        SubmitOutcome::Submitted => "submitted",
        SubmitOutcome::NoResource(_) => "no-resource",
        SubmitOutcome::NoProposal => "no-proposal",
    }
}

enum SubmitOutcome {
    Submitted,
    /// All matching slots busy; a retried job is handed back.
    NoResource(Option<Job>),
    /// The proposer had nothing to offer right now.
    NoProposal,
}

/// One run of the propose-dispatch-evaluate loop.
pub struct Experiment {
    config: ExperimentConfig,
    username: String,
    run_id: Uuid,
    eid: i64,
    connector: Arc<dyn Connector>,
    proposer: Box<dyn Proposer>,
    manager: Box<dyn ResourceManager>,
    /// Jobs dispatched and not yet finished, keyed by job id.
    pending_jobs: HashMap<i64, Job>,
    /// Failed jobs with retry budget left, waiting for a slot.
    retry_queue: VecDeque<Job>,
    /// Jobs reconstructed from the store at resume; reconciled as
    /// cancelled before the loop proposes anything new.
    resumed_jobs: Vec<i64>,
    stop_flag: Arc<AtomicBool>,
    run_ctx: RunContext,
    drain_timeout: Duration,
    ever_submitted: bool,
    finished: bool,
    final_status: ExperimentStatus,
    best: Option<BestResult>,
}

impl Experiment {
    /// Create and start a new experiment record.
    pub fn new(config: ExperimentConfig, connector: Arc<dyn Connector>) -> HsResult<Self> {
        config.verify()?;
        let proposer = create_proposer(&config)?;
        let manager = create_resource_manager(&config, Arc::clone(&connector))?;
        let username = default_username();
        let eid = connector.start_experiment(&username, &serde_json::to_string(&config)?)?;
        manager.set_eid(eid);

        let run_id = Uuid::new_v4();
        info!(eid, %run_id, name = %config.name, "experiment created");
        debug!(config = %serde_json::to_string(&config)?, "experiment config");

        Ok(Self {
            run_ctx: RunContext::from_config(&config),
            config,
            username,
            run_id,
            eid,
            connector,
            proposer,
            manager,
            pending_jobs: HashMap::new(),
            retry_queue: VecDeque::new(),
            resumed_jobs: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            ever_submitted: false,
            finished: false,
            final_status: ExperimentStatus::Running,
            best: None,
        })
    }

    /// Restore a suspended experiment: reload the proposer snapshot and
    /// reconstruct `pending_jobs` from the store's still-running records.
    /// Those jobs are not run again; the loop reconciles them as
    /// cancelled and continues with fresh proposals.
    pub fn resume(
        config: ExperimentConfig,
        connector: Arc<dyn Connector>,
        eid: i64,
    ) -> HsResult<Self> {
        config.verify()?;
        let mut proposer = create_proposer(&config)?;
        let snapshot = snapshot_path(&config, eid);
        proposer.reload(&snapshot)?;
        info!(eid, path = %snapshot.display(), "proposer state reloaded");

        let manager = create_resource_manager(&config, Arc::clone(&connector))?;
        connector.start_experiment_by_eid(eid)?;
        // Suspension leaves claimed slots busy in the store.
        connector.free_all_resources()?;
        manager.set_eid(eid);

        let mut pending_jobs = HashMap::new();
        let mut resumed_jobs = Vec::new();
        for jid in connector.get_running_job(eid)? {
            let job_config = connector.job_config(jid)?;
            let mut job = Job::new(&config.script, job_config, &config.workingdir, 0);
            job.jid = jid;
            pending_jobs.insert(jid, job);
            resumed_jobs.push(jid);
        }
        info!(eid, reconstructed = resumed_jobs.len(), "experiment resumed");

        Ok(Self {
            run_ctx: RunContext::from_config(&config),
            username: default_username(),
            run_id: Uuid::new_v4(),
            config,
            eid,
            connector,
            proposer,
            manager,
            pending_jobs,
            retry_queue: VecDeque::new(),
            resumed_jobs,
            stop_flag: Arc::new(AtomicBool::new(false)),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            ever_submitted: false,
            finished: false,
            final_status: ExperimentStatus::Running,
            best: None,
        })
    }

    pub fn eid(&self) -> i64 {
        self.eid
    }

    /// Unique id of this process's run of the experiment; distinguishes
    /// resumed runs of the same eid in logs.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Shared flag that requests a clean suspension when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Job ids currently tracked as dispatched-but-unfinished.
    pub fn pending_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.pending_jobs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    fn fail_safe(&self) -> bool {
        self.config.job_failure.ignore_fail
    }

    /// Drive the loop to completion (or suspension).  Fatal errors still
    /// drain in-flight work before propagating.
    pub fn run(&mut self) -> HsResult<RunSummary> {
        match self.run_loop() {
            Ok(summary) => Ok(summary),
            Err(HsError::Suspended) => Err(HsError::Suspended),
            Err(e) => {
                error!(eid = self.eid, "experiment failed: {e}");
                self.final_status = ExperimentStatus::Failed;
                if let Err(finish_err) = self.finish() {
                    warn!("teardown after failure also failed: {finish_err}");
                }
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> HsResult<RunSummary> {
        if self.finished {
            return Ok(self.summary());
        }
        self.reconcile_resumed_jobs();

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                return self.suspend();
            }

            self.pump_submissions()?;

            let idle = self.pending_jobs.is_empty() && self.retry_queue.is_empty();
            if idle {
                if self.proposer.status() != ProposerStatus::Running {
                    break;
                }
                if !self.ever_submitted {
                    self.manager.log_error_message("Not enough resources!");
                    self.proposer.set_status(ProposerStatus::Failed);
                    return Err(config_error!(
                        "Cannot run experiment: no job could be submitted; \
                         increase resources or reduce n_parallel"
                    ));
                }
            }

            match self.manager.events().recv_timeout(EVENT_POLL) {
                Ok(event) => {
                    self.handle_completion(event)?;
                    // Drain whatever else arrived while we were busy.
                    while let Ok(event) = self.manager.events().try_recv() {
                        self.handle_completion(event)?;
                    }
                }
                Err(_) => {
                    // Timeout: fall through and re-check stop/submissions.
                }
            }
        }

        self.final_status = if self.proposer.status() == ProposerStatus::Failed {
            ExperimentStatus::Failed
        } else {
            ExperimentStatus::Finished
        };
        self.finish()
    }

    /// Jobs in flight at suspension are never run again; close their
    /// records so the store and the slot table agree.
    fn reconcile_resumed_jobs(&mut self) {
        for jid in std::mem::take(&mut self.resumed_jobs) {
            warn!(jid, "job was in flight at suspension and will not be re-run");
            self.pending_jobs.remove(&jid);
            if let Err(e) = self
                .connector
                .job_finished(self.eid, jid, None, JobStatus::Cancelled)
            {
                warn!(jid, "failed to cancel suspended job record: {e}");
            }
        }
    }

    /// Submit retries first, then fresh proposals, until slots or
    /// proposals run out.
    fn pump_submissions(&mut self) -> HsResult<()> {
        while let Some(job) = self.retry_queue.pop_front() {
            match self.submit_job(Some(job))? {
                SubmitOutcome::Submitted => {}
                SubmitOutcome::NoResource(Some(job)) => {
                    self.retry_queue.push_front(job);
                    break;
                }
                other => {
                    debug!(outcome = submit_outcome_label(&other), "unexpected retry outcome");
                    break;
                }
            }
        }

        while self.proposer.status() == ProposerStatus::Running {
            match self.submit_job(None)? {
                SubmitOutcome::Submitted => {
                    self.ever_submitted = true;
                }
                SubmitOutcome::NoResource(_) | SubmitOutcome::NoProposal => break,
            }
        }
        Ok(())
    }

    /// Submit one job: a retried one when given, otherwise the
    /// proposer's next configuration.
    fn submit_job(&mut self, job: Option<Job>) -> HsResult<SubmitOutcome> {
        let blacklist: Vec<i64> = job
            .as_ref()
            .map(|j| j.rid_blacklist.iter().copied().collect())
            .unwrap_or_default();

        let mut rid = self
            .manager
            .get_available(&self.username, self.config.resource, &blacklist);
        if rid.is_none() && !blacklist.is_empty() && self.pending_jobs.is_empty() {
            // Every remaining slot is blacklisted and nothing will free
            // up; retrying on a previously failed slot beats hanging.
            warn!("all eligible slots blacklisted, retrying without blacklist");
            rid = self
                .manager
                .get_available(&self.username, self.config.resource, &[]);
        }
        let Some(rid) = rid else {
            if job.is_none() {
                debug!("no free resource, waiting for running jobs");
            }
            return Ok(SubmitOutcome::NoResource(job));
        };

        let mut job = match job {
            Some(job) => {
                self.connector.job_retry(rid, job.jid)?;
                job
            }
            None => match self.proposer.get() {
                Some(proposal) => {
                    self.proposer.increment_job_counter();
                    let mut job = Job::new(
                        &self.config.script,
                        proposal,
                        &self.config.workingdir,
                        self.config.job_failure.job_retries,
                    );
                    job.jid = self.connector.job_started(self.eid, rid, &job.config)?;
                    job
                }
                None => {
                    self.connector.free_used_resource(rid)?;
                    if self.proposer.is_special_exit()
                        && self.proposer.status() == ProposerStatus::Running
                    {
                        debug!(
                            proposer = self.proposer.name(),
                            "waiting for outstanding trials before the next rung"
                        );
                    }
                    return Ok(SubmitOutcome::NoProposal);
                }
            },
        };

        info!(jid = job.jid, rid, eid = self.eid, "submitting job");
        job.was_executed = false;
        self.pending_jobs.insert(job.jid, job.clone());
        // Update status after the pending insert to avoid premature
        // termination of the loop.
        self.proposer.check_termination();
        if let Err(e) = self.manager.run_job(&job, rid, &self.run_ctx) {
            self.pending_jobs.remove(&job.jid);
            return Err(e);
        }
        Ok(SubmitOutcome::Submitted)
    }

    /// Fold one completion event back into proposer and store state.
    fn handle_completion(&mut self, event: CompletionEvent) -> HsResult<()> {
        let jid = event.jid;
        match event.outcome {
            JobOutcome::Finished(score) => {
                let Some(job) = self.pending_jobs.remove(&jid) else {
                    warn!(jid, "completion for an untracked job, dropped");
                    return Ok(());
                };
                self.proposer.update(score, &job)?;
                self.manager.finish_job(jid, Some(score), JobStatus::Finished);
                info!(jid, score, "job finished");
            }
            JobOutcome::EarlyStopped(score) => {
                if self.pending_jobs.remove(&jid).is_none() {
                    warn!(jid, "early stop for an untracked job, dropped");
                    return Ok(());
                }
                self.manager.finish_job(jid, score, JobStatus::EarlyStopped);
                info!(jid, "job was early stopped");
            }
            JobOutcome::Failed(diagnostic) => {
                let Some(mut job) = self.pending_jobs.remove(&jid) else {
                    warn!(jid, "failure for an untracked job, dropped");
                    return Ok(());
                };
                if job.curr_retries < job.retries {
                    if let Some(rid) = self.manager.release_attempt(jid) {
                        job.rid_blacklist.insert(rid);
                    }
                    job.curr_retries += 1;
                    info!(
                        jid,
                        attempt = job.curr_retries,
                        retries = job.retries,
                        "retrying job: {diagnostic}"
                    );
                    self.retry_queue.push_back(job);
                } else {
                    self.manager.finish_job(jid, None, JobStatus::Failed);
                    error!(
                        jid,
                        script = %job.script,
                        "job failed permanently: {diagnostic}"
                    );
                    if !self.fail_safe() {
                        self.proposer.set_status(ProposerStatus::Failed);
                        error!("stopping experiment: job failure with ignore_fail unset");
                    } else {
                        match self.proposer.failed(&job) {
                            Ok(()) => info!(jid, "job finished (failed)"),
                            Err(ProposerError::Unsupported { .. }) => {
                                self.proposer.set_status(ProposerStatus::Failed);
                                error!(
                                    "stopping experiment: failed jobs unsupported by proposer"
                                );
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Finish the experiment: drain in-flight jobs, close out the
    /// record, persist the proposer, report the best result.  Safe to
    /// call more than once; later calls return the cached summary.
    pub fn finish(&mut self) -> HsResult<RunSummary> {
        if self.finished {
            return Ok(self.summary());
        }
        let report = self.manager.finish(self.drain_timeout, self.final_status);
        self.best = report.best;
        self.save_proposer();
        self.connector.close();
        self.finished = true;

        match &self.best {
            Some(best) => info!(
                eid = self.eid,
                jid = best.jid,
                score = best.score,
                "best job in experiment"
            ),
            None => warn!(eid = self.eid, "no result so far"),
        }
        Ok(self.summary())
    }

    /// Suspension: stop proposing, drain the managers, persist state,
    /// and surface a non-zero outcome to the runner.  The still-running
    /// job records stay in the store for `resume` to reconstruct.
    fn suspend(&mut self) -> HsResult<RunSummary> {
        error!(eid = self.eid, "experiment ended at user's request");
        for jid in self.pending_ids() {
            warn!(jid, "job is cancelled");
        }
        self.save_proposer();
        self.manager.suspend();
        let report = self.manager.finish(self.drain_timeout, ExperimentStatus::Stopped);
        match &report.best {
            Some(best) => info!(
                eid = self.eid,
                jid = best.jid,
                score = best.score,
                "best job so far"
            ),
            None => warn!(eid = self.eid, "no valid result so far"),
        }
        self.best = report.best;
        self.final_status = ExperimentStatus::Stopped;
        self.finished = true;
        self.connector.close();
        Err(HsError::Suspended)
    }

    fn save_proposer(&mut self) {
        let path = snapshot_path(&self.config, self.eid);
        match self.proposer.save(&path) {
            Ok(()) => info!(path = %path.display(), "proposer state saved"),
            Err(ProposerError::Unsupported { .. }) => {
                debug!(
                    proposer = self.proposer.name(),
                    "proposer does not support persistence"
                );
            }
            Err(e) => warn!("failed to save proposer state: {e}"),
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            eid: self.eid,
            status: self.final_status,
            best: self.best,
        }
    }
}

/// Where the proposer snapshot of experiment `eid` lives.
pub fn snapshot_path(config: &ExperimentConfig, eid: i64) -> PathBuf {
    PathBuf::from(&config.workingdir).join(format!("exp{eid}.json"))
}

fn default_username() -> String {
    std::env::var("USER").unwrap_or_else(|_| "hypersweep".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_store::MemoryConnector;
    use hs_types::{ResourceKind, SearchSpace};

    fn connector() -> Arc<dyn Connector> {
        Arc::new(MemoryConnector::new())
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = ExperimentConfig::new("exp", "./t.sh", ResourceKind::Cpu, "random");
        // No parameters at all.
        assert!(Experiment::new(config, connector()).is_err());
    }

    #[test]
    fn new_rejects_unknown_proposer() {
        let config = ExperimentConfig::new("exp", "./t.sh", ResourceKind::Cpu, "simulated-annealing")
            .with_parameters(SearchSpace::new().add_int("x", 0, 1));
        assert!(Experiment::new(config, connector()).is_err());
    }

    #[test]
    fn run_without_resources_is_fatal() {
        let config = ExperimentConfig::new("exp", "./t.sh", ResourceKind::Cpu, "sequence")
            .with_parameters(SearchSpace::new().add_int("x", 0, 1));
        // No slots seeded: first submission can never happen.
        let mut experiment = Experiment::new(config, connector()).unwrap();
        match experiment.run() {
            Err(HsError::Config(msg)) => assert!(msg.contains("no job could be submitted")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn stop_flag_before_start_suspends() {
        let store = connector();
        hs_store::seed_resources(&store, ResourceKind::Cpu, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = ExperimentConfig::new("exp", "./t.sh", ResourceKind::Cpu, "sequence")
            .with_workingdir(dir.path().display().to_string())
            .with_parameters(SearchSpace::new().add_int("x", 0, 1));
        let mut experiment = Experiment::new(config, store).unwrap();
        experiment.stop_handle().store(true, Ordering::SeqCst);
        match experiment.run() {
            Err(HsError::Suspended) => {}
            other => panic!("expected Suspended, got {other:?}"),
        }
    }
}
