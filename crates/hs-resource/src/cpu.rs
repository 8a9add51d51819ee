//! Local subprocess execution on CPU slots.

use std::collections::BTreeMap;
use std::fs;
use std::process::Command;
use std::sync::Arc;

use tracing::debug;

use hs_store::Connector;
use hs_types::{HsResult, Job, ResourceKind};

use crate::worker;
use crate::{ManagerCore, ResourceManager, RunContext};

/// Runs each trial as a local subprocess in the job's working directory.
/// Parallelism is bounded by the number of CPU slots registered in the
/// store, one running job per slot.
pub struct CpuResourceManager {
    core: Arc<ManagerCore>,
}

impl CpuResourceManager {
    pub fn new(connector: Arc<dyn Connector>, maximize: bool) -> Self {
        Self {
            core: ManagerCore::new(connector, maximize),
        }
    }

    /// Verify, write the job config, and hand the subprocess to a worker
    /// thread.  Shared with the GPU variant, which only changes the
    /// environment.
    pub(crate) fn spawn_local(
        &self,
        job: &Job,
        env: BTreeMap<String, String>,
        ctx: &RunContext,
    ) -> HsResult<()> {
        job.verify_local()?;
        job.config.save(&job.config_path())?;

        let workdir = fs::canonicalize(&job.workdir)?;
        let script = fs::canonicalize(job.resolved_script())?;
        let config_path = workdir.join("jobs").join(format!("{}.json", job.jid));
        let log_path = workdir
            .join("jobs")
            .join(format!("{}.{}.out", job.jid, job.curr_retries));

        let mut tokens = job.script.split_whitespace();
        tokens.next(); // the script itself, canonicalized above
        let mut command = Command::new(&script);
        command
            .args(tokens)
            .arg(&config_path)
            .current_dir(&workdir)
            .envs(env);

        debug!(jid = job.jid, script = %script.display(), "job started");
        worker::dispatch(
            &self.core,
            job.jid,
            command,
            Some(log_path),
            ctx.track_intermediate,
            ctx.timeout,
        )?;
        Ok(())
    }
}

impl ResourceManager for CpuResourceManager {
    fn core(&self) -> &Arc<ManagerCore> {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn run(&self, job: &Job, _rid: i64, ctx: &RunContext) -> HsResult<()> {
        let mut env = ctx.env.clone();
        // Keep CPU trials off the GPUs unless the operator says otherwise.
        env.entry("CUDA_VISIBLE_DEVICES".to_string())
            .or_insert_with(|| "-1".to_string());
        self.spawn_local(job, env, ctx)
    }
}
