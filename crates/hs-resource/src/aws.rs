//! Cloud slots: SSH execution against provisioned instances.
//!
//! Instances are provisioned outside the scheduler (terraform, console,
//! whatever) and registered in `node_mapping` as `user@address` entries,
//! one slot per instance.  Execution, streaming, and deadline
//! reconciliation are exactly the SSH path; this variant adds instance
//! lifecycle logging so operators can correlate spend with trials.

use std::sync::Arc;

use tracing::info;

use hs_store::Connector;
use hs_types::{config_error, HsResult, Job, ResourceArgs, ResourceKind};

use crate::{ManagerCore, ResourceManager, RunContext, SshResourceManager};

/// Remote execution on cloud instances, one slot per instance address.
pub struct AwsResourceManager {
    ssh: SshResourceManager,
}

impl AwsResourceManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        maximize: bool,
        args: &ResourceArgs,
    ) -> HsResult<Self> {
        if args.node_mapping.is_empty() {
            return Err(config_error!(
                "Missing node_mapping in resource_args for aws resource: \
                 list instance addresses as user@address entries"
            ));
        }
        Ok(Self {
            ssh: SshResourceManager::new(connector, maximize, args)?,
        })
    }
}

impl ResourceManager for AwsResourceManager {
    fn core(&self) -> &Arc<ManagerCore> {
        self.ssh.core()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Aws
    }

    fn run(&self, job: &Job, rid: i64, ctx: &RunContext) -> HsResult<()> {
        info!(jid = job.jid, rid, "dispatching trial to cloud instance");
        self.ssh.run(job, rid, ctx)
    }
}
