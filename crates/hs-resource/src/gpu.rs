//! GPU slots: local subprocess execution pinned to a CUDA device per slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use hs_store::Connector;
use hs_types::{config_error, HsResult, Job, ResourceError, ResourceKind};

use crate::{CpuResourceManager, ManagerCore, ResourceManager, RunContext};

/// Local execution with one CUDA device (or device set) per slot.  There
/// is no enforcement of GPU memory limits; the mapping only controls
/// visibility.
pub struct GpuResourceManager {
    inner: CpuResourceManager,
    /// rid → CUDA_VISIBLE_DEVICES value.
    mapping: BTreeMap<i64, String>,
}

impl GpuResourceManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        maximize: bool,
        mapping: BTreeMap<i64, String>,
    ) -> HsResult<Self> {
        if mapping.is_empty() {
            return Err(config_error!(
                "Missing gpu_mapping in resource_args for gpu resource"
            ));
        }
        Ok(Self {
            inner: CpuResourceManager::new(connector, maximize),
            mapping,
        })
    }
}

impl ResourceManager for GpuResourceManager {
    fn core(&self) -> &Arc<ManagerCore> {
        self.inner.core()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Gpu
    }

    fn run(&self, job: &Job, rid: i64, ctx: &RunContext) -> HsResult<()> {
        let device = self
            .mapping
            .get(&rid)
            .ok_or(ResourceError::MissingMapping { rid })?;
        debug!(jid = job.jid, rid, device, "job started on GPU");

        let mut env = ctx.env.clone();
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), device.clone());
        self.inner.spawn_local(job, env, ctx)
    }
}
