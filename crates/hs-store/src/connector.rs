//! The interface between experiment tracking and the execution engine.

use std::collections::HashMap;

use hs_types::{BestResult, ExperimentStatus, JobConfig, JobStatus, ResourceKind, StoreResult};

/// Persistent record of experiments, resources, jobs, and intermediate
/// results.
///
/// All methods are synchronous: callers are either the scheduling loop or
/// a worker thread, and implementations are expected to answer quickly.
/// A closed connector fails every call with [`StoreError::Closed`]
/// (`hs_types::StoreError`).
pub trait Connector: Send + Sync {
    // ---- lifecycle ----

    /// Mark the connector as closed.  A closed connector is not used again.
    fn close(&self);

    fn is_closed(&self) -> bool;

    // ---- resources ----

    /// Register a schedulable resource slot, returning its id.
    fn add_resource(&self, rtype: ResourceKind, name: &str) -> StoreResult<i64>;

    /// All free resource ids of the given type, minus the blacklist.
    /// There is currently no per-user limitation; the username is recorded
    /// for diagnostics only.
    fn get_available_resource(
        &self,
        username: &str,
        rtype: ResourceKind,
        blacklist: &[i64],
    ) -> StoreResult<Vec<i64>>;

    /// Mark a resource as used.  Returns false when someone else claimed
    /// it first.
    fn take_available_resource(&self, rid: i64) -> StoreResult<bool>;

    /// Mark a resource as free (opposite of [`take_available_resource`]).
    ///
    /// [`take_available_resource`]: Connector::take_available_resource
    fn free_used_resource(&self, rid: i64) -> StoreResult<()>;

    /// Mark every resource as free.  Used when resuming after a suspension
    /// that left slots busy in the store.
    fn free_all_resources(&self) -> StoreResult<()>;

    // ---- experiments ----

    /// Create an experiment record without starting it.
    fn create_experiment(&self, username: &str, config_json: &str) -> StoreResult<i64>;

    /// Create and immediately start an experiment record.
    fn start_experiment(&self, username: &str, config_json: &str) -> StoreResult<i64>;

    /// Transition a previously created (or suspended) experiment to running.
    fn start_experiment_by_eid(&self, eid: i64) -> StoreResult<()>;

    fn end_experiment(&self, eid: i64, status: ExperimentStatus) -> StoreResult<()>;

    fn experiment_status(&self, eid: i64) -> StoreResult<ExperimentStatus>;

    /// Status lookup that swallows errors; used by watcher threads that
    /// must never bring the experiment down.
    fn maybe_experiment_status(&self, eid: i64) -> Option<ExperimentStatus> {
        self.experiment_status(eid).ok()
    }

    /// Ask a running experiment to stop from the outside.
    fn request_stop(&self, eid: i64) -> StoreResult<()>;

    /// Best job id and score recorded for the experiment, if any job
    /// finished with a score.
    fn get_best_result(&self, eid: i64, maximize: bool) -> StoreResult<Option<BestResult>>;

    fn log_error_message(&self, eid: i64, msg: &str) -> StoreResult<()>;

    // ---- jobs ----

    /// Record a job starting on a resource; returns the job id.
    fn job_started(&self, eid: i64, rid: i64, config: &JobConfig) -> StoreResult<i64>;

    /// Close the current attempt of a job that failed.
    fn job_failed_attempt(&self, jid: i64) -> StoreResult<()>;

    /// Open a new attempt for a job being retried on `rid`.
    fn job_retry(&self, rid: i64, jid: i64) -> StoreResult<()>;

    fn job_finished(
        &self,
        eid: i64,
        jid: i64,
        score: Option<f64>,
        status: JobStatus,
    ) -> StoreResult<()>;

    /// Ids of jobs still recorded as running, oldest first.
    fn get_running_job(&self, eid: i64) -> StoreResult<Vec<i64>>;

    fn job_config(&self, jid: i64) -> StoreResult<JobConfig>;

    // ---- intermediate results ----

    /// Append an intermediate result; returns its sequence number
    /// (monotonic per job, starting at 1).
    fn save_intermediate_result(&self, jid: i64, score: f64) -> StoreResult<i64>;

    fn get_intermediate_results_job(&self, jid: i64) -> StoreResult<Vec<f64>>;

    fn get_intermediate_results_jobs(&self, jids: &[i64])
        -> StoreResult<HashMap<i64, Vec<f64>>>;

    /// Intermediate results of all jobs of `eid` currently in `status`.
    fn get_intermediate_results_experiment(
        &self,
        eid: i64,
        status: JobStatus,
    ) -> StoreResult<HashMap<i64, Vec<f64>>>;
}
