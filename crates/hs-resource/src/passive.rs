//! Passive slots: no execution, just a seat at the table.
//!
//! A passive slot is claimed like any other, but the trial itself is run
//! by an external actor (a human, a lab machine, another pipeline) that
//! reports the score back through [`PassiveResourceManager::report`].  A
//! waiter thread per job turns the external report into a completion
//! event, or reconciles the slot as failed at the deadline.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use hs_store::Connector;
use hs_types::{HsResult, Job, ResourceKind};

use crate::worker::WorkerGuard;
use crate::{CompletionEvent, JobOutcome, ManagerCore, ResourceManager, RunContext};

const WAIT_POLL: Duration = Duration::from_millis(100);

/// Resource manager whose jobs are executed outside the scheduler.
pub struct PassiveResourceManager {
    core: Arc<ManagerCore>,
    /// Externally reported outcomes waiting to be collected, keyed by jid.
    reports: Arc<DashMap<i64, JobOutcome>>,
}

impl PassiveResourceManager {
    pub fn new(connector: Arc<dyn Connector>, maximize: bool) -> Self {
        Self {
            core: ManagerCore::new(connector, maximize),
            reports: Arc::new(DashMap::new()),
        }
    }

    /// Deliver the outcome of an externally executed job.
    pub fn report(&self, jid: i64, outcome: JobOutcome) {
        info!(jid, ?outcome, "external result reported");
        self.reports.insert(jid, outcome);
    }

    pub fn report_finished(&self, jid: i64, score: f64) {
        self.report(jid, JobOutcome::Finished(score));
    }

    pub fn report_failed(&self, jid: i64, diagnostic: impl Into<String>) {
        self.report(jid, JobOutcome::Failed(diagnostic.into()));
    }
}

impl ResourceManager for PassiveResourceManager {
    fn core(&self) -> &Arc<ManagerCore> {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Passive
    }

    fn run(&self, job: &Job, rid: i64, ctx: &RunContext) -> HsResult<()> {
        // Leave the config where the external executor expects it, when a
        // working directory exists at all.
        if job.workdir.is_dir() {
            fs::create_dir_all(job.jobs_dir())?;
            job.config.save(&job.config_path())?;
        }
        debug!(jid = job.jid, rid, "waiting for external report");

        let core = Arc::clone(&self.core);
        let reports = Arc::clone(&self.reports);
        let jid = job.jid;
        let deadline = ctx.deadline();
        let guard = WorkerGuard::new(&core);
        std::thread::Builder::new()
            .name(format!("hs-passive-{jid}"))
            .spawn(move || {
                let _guard = guard;
                let started = Instant::now();
                let outcome = loop {
                    if let Some((_, outcome)) = reports.remove(&jid) {
                        break outcome;
                    }
                    if core.is_stopped(jid) {
                        break JobOutcome::EarlyStopped(None);
                    }
                    if started.elapsed() >= deadline {
                        break JobOutcome::Failed(format!(
                            "no external report within {}s, reconciled as failed",
                            deadline.as_secs()
                        ));
                    }
                    std::thread::sleep(WAIT_POLL);
                };
                let _ = core.sender().send(CompletionEvent { jid, outcome });
            })?;
        Ok(())
    }
}
