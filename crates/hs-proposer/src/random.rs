//! Random sampling of the search space.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use hs_types::{
    config_error, ExperimentConfig, HsResult, Job, JobConfig, ParameterKind, ParameterValue,
    ProposerError, SearchSpace,
};

use crate::{persistence_error, Proposer, ProposerCore, ProposerStatus};

/// Independent random draws from the search space, up to `n_samples`
/// trials.  Seeded for reproducibility; suspend/resume re-seeds and
/// replays the draw count so the next `get()` sequence is unchanged.
#[derive(Debug)]
pub struct RandomProposer {
    core: ProposerCore,
    space: SearchSpace,
    seed: u64,
    draws: u64,
    rng: StdRng,
}

/// On-disk snapshot for suspend/resume.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    core: ProposerCore,
    space: SearchSpace,
    seed: u64,
    draws: u64,
}

impl RandomProposer {
    pub fn from_config(config: &ExperimentConfig) -> HsResult<Self> {
        let n_samples = config
            .n_samples
            .ok_or_else(|| config_error!("Specify number of samples to randomly draw"))?;
        let seed = config.random_seed.unwrap_or(0);
        Ok(Self::new(config.search_space(), n_samples, seed))
    }

    pub fn new(space: SearchSpace, n_samples: usize, seed: u64) -> Self {
        Self {
            core: ProposerCore::new(n_samples),
            space,
            seed,
            draws: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample_one(&mut self) -> JobConfig {
        let mut config = JobConfig::new();
        for param in &self.space.parameters {
            let value = match &param.kind {
                ParameterKind::Int { low, high, .. } => {
                    ParameterValue::Int(self.rng.gen_range(*low..=*high))
                }
                ParameterKind::Float { low, high, .. } => {
                    ParameterValue::Float(self.rng.gen_range(*low..=*high))
                }
                ParameterKind::Choice { values } => {
                    let idx = self.rng.gen_range(0..values.len());
                    ParameterValue::Json(values[idx].clone())
                }
            };
            config.insert(param.name.clone(), value);
        }
        config
    }
}

impl Proposer for RandomProposer {
    fn get(&mut self) -> Option<JobConfig> {
        self.core.check_termination();
        if self.core.status() != ProposerStatus::Running {
            return None;
        }
        let mut config = self.sample_one();
        self.draws += 1;
        config.set_tid(self.core.issue_tid());
        debug!(?config, "random proposal");
        Some(config)
    }

    fn update(&mut self, score: f64, job: &Job) -> Result<(), ProposerError> {
        let tid = ProposerCore::job_tid(job)?;
        if !self.core.resolve_tid(tid) {
            return Err(ProposerError::UnknownTrial { tid });
        }
        debug!(tid, score, "trial finished");
        Ok(())
    }

    fn failed(&mut self, job: &Job) -> Result<(), ProposerError> {
        let tid = ProposerCore::job_tid(job)?;
        if !self.core.resolve_tid(tid) {
            return Err(ProposerError::UnknownTrial { tid });
        }
        debug!(tid, "trial marked as failed");
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), ProposerError> {
        let snapshot = Snapshot {
            core: self.core.clone(),
            space: self.space.clone(),
            seed: self.seed,
            draws: self.draws,
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(persistence_error)?;
        std::fs::write(path, json).map_err(persistence_error)
    }

    fn reload(&mut self, path: &Path) -> Result<(), ProposerError> {
        let json = std::fs::read_to_string(path).map_err(persistence_error)?;
        let snapshot: Snapshot = serde_json::from_str(&json).map_err(persistence_error)?;
        self.core = snapshot.core;
        self.space = snapshot.space;
        self.seed = snapshot.seed;
        self.draws = 0;
        self.rng = StdRng::seed_from_u64(self.seed);
        // Replay past draws so the RNG continues where it left off.
        for _ in 0..snapshot.draws {
            self.sample_one();
            self.draws += 1;
        }
        Ok(())
    }

    fn status(&self) -> ProposerStatus {
        self.core.status()
    }

    fn set_status(&mut self, status: ProposerStatus) {
        self.core.set_status(status);
    }

    fn increment_job_counter(&mut self) {
        self.core.increment_job_counter();
    }

    fn check_termination(&mut self) {
        self.core.check_termination();
    }

    fn remaining_jobs(&self) -> usize {
        self.core.remaining_jobs()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
