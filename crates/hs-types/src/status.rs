//! Lifecycle enums shared between the scheduler, the store, and the
//! resource managers.

use serde::{Deserialize, Serialize};

/// Whether the experiment maximizes or minimizes the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Max,
    Min,
}

impl Target {
    pub fn maximize(self) -> bool {
        matches!(self, Target::Max)
    }

    /// Returns true when `candidate` improves on `current`.
    pub fn better(self, candidate: f64, current: f64) -> bool {
        match self {
            Target::Max => candidate > current,
            Target::Min => candidate < current,
        }
    }
}

impl Default for Target {
    fn default() -> Self {
        Target::Max
    }
}

/// Lifecycle state of an experiment record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    Created,
    Running,
    Finished,
    Failed,
    /// Suspended by signal or stop request; in-flight jobs were drained.
    Stopped,
    /// An external actor asked the running experiment to stop.
    RequestStop,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::RequestStop => "REQUEST_STOP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "RUNNING" => Some(Self::Running),
            "FINISHED" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            "STOPPED" => Some(Self::Stopped),
            "REQUEST_STOP" => Some(Self::RequestStop),
            _ => None,
        }
    }
}

/// Lifecycle state of a single job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
    EarlyStopped,
    /// In-flight at suspension; will not be re-run.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::EarlyStopped => "EARLY_STOPPED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "FINISHED" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            "EARLY_STOPPED" => Some(Self::EarlyStopped),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Best job found so far in an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub jid: i64,
    pub score: f64,
}

/// A partial score reported by a still-running trial.  Append-only;
/// `seq` is monotonic per job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntermediateResult {
    pub jid: i64,
    pub seq: i64,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_comparison() {
        assert!(Target::Max.better(2.0, 1.0));
        assert!(!Target::Max.better(1.0, 2.0));
        assert!(Target::Min.better(1.0, 2.0));
        assert!(!Target::Min.better(2.0, 1.0));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            ExperimentStatus::Created,
            ExperimentStatus::Running,
            ExperimentStatus::Finished,
            ExperimentStatus::Failed,
            ExperimentStatus::Stopped,
            ExperimentStatus::RequestStop,
        ] {
            assert_eq!(ExperimentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExperimentStatus::parse("NONSENSE"), None);
    }

    #[test]
    fn job_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::EarlyStopped.is_terminal());
    }
}
