//! # hs-engine
//!
//! The HyperSweep orchestrator: the [`Experiment`] scheduling loop that
//! binds a proposer to a resource manager, plus the stop-request watcher
//! and the runner binaries.

pub mod experiment;
pub mod watcher;

pub use experiment::{snapshot_path, Experiment, RunSummary};
pub use watcher::{spawn_status_watcher, DEFAULT_WATCH_PERIOD};
