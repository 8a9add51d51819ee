//! # hs-proposer
//!
//! Pluggable search strategies for HyperSweep.  A [`Proposer`] produces
//! trial configurations tagged with a trial id and consumes per-trial
//! feedback; the experiment loop is its only caller, so implementations
//! are single-threaded by construction.

mod hyperband;
mod random;
mod sequence;

pub use hyperband::HyperbandProposer;
pub use random::RandomProposer;
pub use sequence::SequenceProposer;

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use hs_types::{ExperimentConfig, HsResult, Job, JobConfig, ProposerError};

/// Whether the proposer keeps producing trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposerStatus {
    Running,
    Finished,
    Failed,
}

/// A search strategy producing trial configurations.
///
/// `get()` returning `None` means "done" for ordinary strategies, but
/// strategies with [`Proposer::is_special_exit`] set may return `None`
/// while still `Running`, meaning "no trial right now, poll again after
/// other trials report back".  Callers must consult `status()` and never
/// treat `None` alone as terminal for those strategies.
pub trait Proposer: Send {
    /// Next configuration to try, tagged with a fresh trial id.
    fn get(&mut self) -> Option<JobConfig>;

    /// Feed back the final score of the trial identified by the job's
    /// `tid`.  Fails with `UnknownTrial` when the tid was never issued;
    /// that is a scheduler bug, not a recoverable condition.
    fn update(&mut self, score: f64, job: &Job) -> Result<(), ProposerError>;

    /// A trial failed permanently (retries exhausted).  Strategies that
    /// cannot absorb failures keep the default, which the experiment
    /// treats as fatal.
    fn failed(&mut self, job: &Job) -> Result<(), ProposerError> {
        let _ = job;
        Err(ProposerError::Unsupported {
            operation: "failed".to_string(),
        })
    }

    /// Persist internal search state for suspend/resume.
    fn save(&self, path: &Path) -> Result<(), ProposerError> {
        let _ = path;
        Err(ProposerError::Unsupported {
            operation: "save".to_string(),
        })
    }

    /// Restore internal search state saved by [`Proposer::save`].
    fn reload(&mut self, path: &Path) -> Result<(), ProposerError> {
        let _ = path;
        Err(ProposerError::Unsupported {
            operation: "reload".to_string(),
        })
    }

    fn status(&self) -> ProposerStatus;

    fn set_status(&mut self, status: ProposerStatus);

    /// Count one issued trial.  Flips the status to `Finished` once the
    /// sample budget is exhausted.
    fn increment_job_counter(&mut self);

    /// Re-evaluate the termination condition.
    fn check_termination(&mut self);

    /// How many trials could still be issued right now.
    fn remaining_jobs(&self) -> usize;

    /// True for strategies that may legitimately return `None` from
    /// `get()` while still running (waiting for capacity to drain).
    fn is_special_exit(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// Counter and status bookkeeping shared by the concrete strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposerCore {
    /// Total trial budget; 0 means the strategy terminates itself.
    pub n_samples: usize,
    /// Number of trials issued so far.
    pub counter: usize,
    status: ProposerStatus,
    next_tid: i64,
    /// Trial ids issued and not yet resolved by update/failed.
    issued: BTreeSet<i64>,
}

impl ProposerCore {
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            counter: 0,
            status: ProposerStatus::Running,
            next_tid: 0,
            issued: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> ProposerStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ProposerStatus) {
        self.status = status;
    }

    pub fn increment_job_counter(&mut self) {
        self.counter += 1;
        self.check_termination();
    }

    pub fn check_termination(&mut self) {
        if self.n_samples > 0
            && self.counter >= self.n_samples
            && self.status == ProposerStatus::Running
        {
            debug!(counter = self.counter, "sample budget exhausted");
            self.status = ProposerStatus::Finished;
        }
    }

    pub fn remaining_jobs(&self) -> usize {
        self.n_samples.saturating_sub(self.counter)
    }

    /// Hand out the next trial id and remember it as outstanding.
    pub fn issue_tid(&mut self) -> i64 {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.issued.insert(tid);
        tid
    }

    /// Resolve an outstanding trial id.  False when it was never issued.
    pub fn resolve_tid(&mut self, tid: i64) -> bool {
        self.issued.remove(&tid)
    }

    /// The job's trial id, or an `UnknownTrial` error when missing.
    pub fn job_tid(job: &Job) -> Result<i64, ProposerError> {
        job.tid().ok_or(ProposerError::UnknownTrial { tid: -1 })
    }
}

type Factory = fn(&ExperimentConfig) -> HsResult<Box<dyn Proposer>>;

/// One registry entry: strategy name, special-exit membership, factory.
pub struct ProposerEntry {
    pub name: &'static str,
    pub special_exit: bool,
    factory: Factory,
}

/// The proposer registry, resolved at startup instead of any dynamic
/// module lookup.
pub static PROPOSERS: &[ProposerEntry] = &[
    ProposerEntry {
        name: "random",
        special_exit: false,
        factory: |config| Ok(Box::new(RandomProposer::from_config(config)?)),
    },
    ProposerEntry {
        name: "sequence",
        special_exit: false,
        factory: |config| Ok(Box::new(SequenceProposer::from_config(config)?)),
    },
    ProposerEntry {
        name: "hyperband",
        special_exit: true,
        factory: |config| Ok(Box::new(HyperbandProposer::from_config(config)?)),
    },
];

/// Build the proposer named in the experiment config.
pub fn create_proposer(config: &ExperimentConfig) -> HsResult<Box<dyn Proposer>> {
    let name = config.proposer.to_lowercase();
    let entry = PROPOSERS
        .iter()
        .find(|entry| entry.name == name)
        .ok_or(ProposerError::UnknownName { name: name.clone() })?;
    debug!(proposer = entry.name, "choose proposer");
    (entry.factory)(config)
}

/// Whether the named strategy uses special-exit semantics.
pub fn is_special_exit_proposer(name: &str) -> bool {
    let name = name.to_lowercase();
    PROPOSERS
        .iter()
        .any(|entry| entry.name == name && entry.special_exit)
}

pub(crate) fn persistence_error(err: impl std::fmt::Display) -> ProposerError {
    ProposerError::Persistence {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::{ResourceKind, SearchSpace};

    fn config(proposer: &str) -> ExperimentConfig {
        ExperimentConfig::new("exp", "./train.sh", ResourceKind::Cpu, proposer)
            .with_parameters(SearchSpace::new().add_int("x1", 0, 3))
            .with_n_samples(4)
    }

    #[test]
    fn registry_resolves_known_names() {
        for name in ["random", "sequence", "hyperband"] {
            let proposer = create_proposer(&config(name)).unwrap();
            assert_eq!(proposer.name(), name);
        }
    }

    #[test]
    fn registry_rejects_unknown_names() {
        match create_proposer(&config("spearmint")) {
            Err(hs_types::HsError::Proposer(ProposerError::UnknownName { name })) => {
                assert_eq!(name, "spearmint");
            }
            Err(other) => panic!("expected UnknownName, got {other:?}"),
            Ok(_) => panic!("expected UnknownName, got Ok(_)"),
        }
    }

    #[test]
    fn special_exit_membership() {
        assert!(is_special_exit_proposer("hyperband"));
        assert!(is_special_exit_proposer("HYPERBAND"));
        assert!(!is_special_exit_proposer("random"));
        assert!(!is_special_exit_proposer("sequence"));
    }

    #[test]
    fn core_counter_flips_status() {
        let mut core = ProposerCore::new(2);
        assert_eq!(core.status(), ProposerStatus::Running);
        core.increment_job_counter();
        assert_eq!(core.status(), ProposerStatus::Running);
        core.increment_job_counter();
        assert_eq!(core.status(), ProposerStatus::Finished);
        assert_eq!(core.remaining_jobs(), 0);
    }

    #[test]
    fn core_tid_tracking() {
        let mut core = ProposerCore::new(10);
        let a = core.issue_tid();
        let b = core.issue_tid();
        assert_ne!(a, b);
        assert!(core.resolve_tid(a));
        assert!(!core.resolve_tid(a)); // second resolve fails
        assert!(core.resolve_tid(b));
    }
}
