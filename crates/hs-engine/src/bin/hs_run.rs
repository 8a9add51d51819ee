//! Experiment runner: `hs-run <experiment.json> [--resume <eid>]`.
//!
//! The store location comes from `HYPERSWEEP_DB` (default
//! `hypersweep.db` in the working directory).  When the store has no
//! slots of the configured resource type yet, `n_parallel` slots are
//! seeded so a fresh checkout works out of the box; mapped resource
//! types (gpu/node/aws) seed one slot per mapping entry instead.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hs_engine::{spawn_status_watcher, Experiment, DEFAULT_WATCH_PERIOD};
use hs_store::{Connector, SqliteConnector};
use hs_types::{ExperimentConfig, HsError, ResourceKind};

fn seed_missing_slots(
    connector: &Arc<dyn Connector>,
    config: &ExperimentConfig,
) -> anyhow::Result<()> {
    let existing = connector.get_available_resource("", config.resource, &[])?;
    if !existing.is_empty() {
        return Ok(());
    }
    let count = match config.resource {
        ResourceKind::Gpu => config.resource_args.gpu_mapping.len(),
        ResourceKind::Node | ResourceKind::Aws => config.resource_args.node_mapping.len(),
        ResourceKind::Cpu | ResourceKind::Passive => config.n_parallel,
    };
    if count == 0 {
        bail!(
            "no {} resources registered and nothing to seed from the config",
            config.resource
        );
    }
    warn!(count, rtype = %config.resource, "seeding resource slots");
    hs_store::seed_resources(connector, config.resource, count)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().context("usage: hs-run <experiment.json> [--resume <eid>]")?;
    let resume_eid = match args.next().as_deref() {
        Some("--resume") => Some(
            args.next()
                .context("--resume needs an experiment id")?
                .parse::<i64>()
                .context("experiment id must be an integer")?,
        ),
        Some(other) => bail!("unknown argument {other}"),
        None => None,
    };

    let config = ExperimentConfig::load(Path::new(&config_path))
        .with_context(|| format!("failed to load {config_path}"))?;

    let db_path = std::env::var("HYPERSWEEP_DB").unwrap_or_else(|_| "hypersweep.db".to_string());
    let connector: Arc<dyn Connector> = Arc::new(SqliteConnector::open(&db_path)?);
    seed_missing_slots(&connector, &config)?;

    let mut experiment = match resume_eid {
        Some(eid) => Experiment::resume(config, Arc::clone(&connector), eid)?,
        None => Experiment::new(config, Arc::clone(&connector))?,
    };

    let stop_flag = experiment.stop_handle();
    let watcher = spawn_status_watcher(
        Arc::clone(&connector),
        experiment.eid(),
        Arc::clone(&stop_flag),
        DEFAULT_WATCH_PERIOD,
    );

    let interrupt_flag = Arc::clone(&stop_flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, suspending experiment");
            interrupt_flag.store(true, Ordering::SeqCst);
        }
    });

    let result = tokio::task::spawn_blocking(move || experiment.run()).await?;
    stop_flag.store(true, Ordering::SeqCst);
    let _ = watcher.join();

    match result {
        Ok(summary) => {
            match &summary.best {
                Some(best) => info!(
                    eid = summary.eid,
                    jid = best.jid,
                    score = best.score,
                    "experiment done"
                ),
                None => warn!(eid = summary.eid, "experiment done without results"),
            }
            if summary.status == hs_types::ExperimentStatus::Failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(HsError::Suspended) => {
            warn!("experiment suspended; resume with --resume <eid>");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
