//! Hyperband: bandit-based successive halving over random configurations
//! (Li et al., 2018).
//!
//! Brackets run from `s_max = floor(log_eta(max_iter))` down to 0.  Each
//! bracket starts a batch of random configurations on a small resource
//! budget and repeatedly keeps the best `1/eta` fraction on an
//! `eta`-times larger budget.  The proposer hands the per-trial budget to
//! the training script through the `n_iterations` config key.
//!
//! Between rungs the proposer has nothing to issue until every trial of
//! the current rung reports back, so `get()` returns `None` while
//! `status()` stays `Running`; that is the special-exit contract.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use hs_types::{
    ExperimentConfig, HsResult, Job, JobConfig, ParameterKind, ParameterValue, ProposerError,
    SearchSpace, Target,
};

use crate::{Proposer, ProposerCore, ProposerStatus};

/// Config key carrying the rung budget into the training script.
pub const BUDGET_KEY: &str = "n_iterations";

const DEFAULT_MAX_ITER: usize = 81;
const DEFAULT_ETA: f64 = 3.0;

/// Bandit-based successive-halving proposer.
#[derive(Debug)]
pub struct HyperbandProposer {
    core: ProposerCore,
    space: SearchSpace,
    eta: f64,
    max_iter: usize,
    maximize: bool,
    rng: StdRng,
    /// Current bracket index; `None` once all brackets are done.
    s: Option<usize>,
    /// `(n_i, r_i)` rungs of the current bracket.
    plan: Vec<(usize, usize)>,
    rung: usize,
    /// Configurations ready to issue at the current rung.
    queue: VecDeque<JobConfig>,
    /// Issued trials awaiting a score, keyed by tid.
    inflight: HashMap<i64, JobConfig>,
    /// Scores collected at the current rung.
    scored: Vec<(JobConfig, f64)>,
}

impl HyperbandProposer {
    pub fn from_config(config: &ExperimentConfig) -> HsResult<Self> {
        let max_iter = config.max_iter.unwrap_or(DEFAULT_MAX_ITER);
        let eta = config.eta.unwrap_or(DEFAULT_ETA).max(2.0);
        let seed = config.random_seed.unwrap_or(0);
        Ok(Self::new(
            config.search_space(),
            max_iter,
            eta,
            config.target == Target::Max,
            seed,
        ))
    }

    pub fn new(
        space: SearchSpace,
        max_iter: usize,
        eta: f64,
        maximize: bool,
        seed: u64,
    ) -> Self {
        let mut proposer = Self {
            core: ProposerCore::new(0),
            space,
            eta,
            max_iter: max_iter.max(1),
            maximize,
            rng: StdRng::seed_from_u64(seed),
            s: None,
            plan: Vec::new(),
            rung: 0,
            queue: VecDeque::new(),
            inflight: HashMap::new(),
            scored: Vec::new(),
        };
        proposer.open_bracket(proposer.s_max());
        proposer
    }

    /// Number of successive-halving brackets.
    pub fn s_max(&self) -> usize {
        (self.max_iter as f64).log(self.eta).floor() as usize
    }

    /// Total budget per bracket.
    fn budget(&self) -> usize {
        (self.s_max() + 1) * self.max_iter
    }

    /// `(n_i, r_i)` for each rung of bracket `s`.
    pub fn bracket(&self, s: usize) -> Vec<(usize, usize)> {
        let n = ((self.budget() as f64 / self.max_iter as f64)
            * (self.eta.powi(s as i32) / (s + 1) as f64))
            .ceil() as usize;
        let r = (self.max_iter as f64 / self.eta.powi(s as i32)).floor() as usize;

        (0..=s)
            .map(|i| {
                let n_i = ((n as f64) / self.eta.powi(i as i32)).floor() as usize;
                let r_i = ((r as f64) * self.eta.powi(i as i32)).floor() as usize;
                (n_i.max(1), r_i.max(1))
            })
            .collect()
    }

    fn sample_config(&mut self) -> JobConfig {
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

    fn open_bracket(&mut self, s: usize) {
        self.s = Some(s);
        self.plan = self.bracket(s);
        self.rung = 0;
        self.scored.clear();
        let (n_0, r_0) = self.plan[0];
        info!(bracket = s, configs = n_0, budget = r_0, "open hyperband bracket");
        self.queue.clear();
        for _ in 0..n_0 {
            let mut config = self.sample_config();
            config.insert(BUDGET_KEY.to_string(), ParameterValue::Int(r_0 as i64));
            self.queue.push_back(config);
        }
    }

    /// Advance past a drained rung.  Returns false when the search is over.
    fn advance(&mut self) -> bool {
        let Some(s) = self.s else { return false };

        if self.rung + 1 < self.plan.len() {
            let (n_next, r_next) = self.plan[self.rung + 1];
            let maximize = self.maximize;
            // Keep the best n_next survivors of this rung.
            self.scored.sort_by(|a, b| {
                let ordering = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                if maximize {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            let survivors: Vec<JobConfig> = self.scored.drain(..).map(|(c, _)| c).collect();
            debug!(
                rung = self.rung + 1,
                survivors = n_next.min(survivors.len()),
                budget = r_next,
                "promote rung survivors"
            );
            for mut config in survivors.into_iter().take(n_next) {
                config.0.remove(hs_types::TID_KEY);
                config.insert(BUDGET_KEY.to_string(), ParameterValue::Int(r_next as i64));
                self.queue.push_back(config);
            }
            self.rung += 1;
            !self.queue.is_empty() || self.advance()
        } else if s > 0 {
            self.open_bracket(s - 1);
            true
        } else {
            self.s = None;
            false
        }
    }
}

impl Proposer for HyperbandProposer {
    fn get(&mut self) -> Option<JobConfig> {
        if self.core.status() != ProposerStatus::Running {
            return None;
        }
        loop {
            if let Some(mut config) = self.queue.pop_front() {
                let tid = self.core.issue_tid();
                config.set_tid(tid);
                self.inflight.insert(tid, config.clone());
                return Some(config);
            }
            if !self.inflight.is_empty() {
                // Wait for the rung to drain; not done yet.
                return None;
            }
            if !self.advance() {
                self.core.set_status(ProposerStatus::Finished);
                return None;
            }
        }
    }

    fn update(&mut self, score: f64, job: &Job) -> Result<(), ProposerError> {
        let tid = ProposerCore::job_tid(job)?;
        let config = self
            .inflight
            .remove(&tid)
            .ok_or(ProposerError::UnknownTrial { tid })?;
        self.core.resolve_tid(tid);
        self.scored.push((config, score));
        Ok(())
    }

    fn failed(&mut self, job: &Job) -> Result<(), ProposerError> {
        let tid = ProposerCore::job_tid(job)?;
        self.inflight
            .remove(&tid)
            .ok_or(ProposerError::UnknownTrial { tid })?;
        self.core.resolve_tid(tid);
        debug!(tid, "dropped failed trial from rung");
        Ok(())
    }

    // save/reload keep the trait defaults: resuming a half-run bracket is
    // not supported.

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
        // Termination is decided by bracket progression in get().
    }

    fn remaining_jobs(&self) -> usize {
        self.queue.len()
    }

    fn is_special_exit(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "hyperband"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SearchSpace {
        SearchSpace::new().add_float("lr", 0.001, 0.1)
    }

    fn make_job(config: &JobConfig) -> Job {
        Job::new("./t.sh", config.clone(), "/tmp", 0)
    }

    #[test]
    fn s_max_and_bracket_shape() {
        let hb = HyperbandProposer::new(space(), 81, 3.0, true, 0);
        // log_3(81) = 4
        assert_eq!(hb.s_max(), 4);

        let rungs = hb.bracket(4);
        assert_eq!(rungs.len(), 5);
        // First rung: many configs, small budget; last rung: few, full budget.
        assert!(rungs[0].0 > rungs[4].0);
        assert!(rungs[0].1 < rungs[4].1);
        assert_eq!(rungs[4].1, 81);
    }

    #[test]
    fn proposals_carry_the_rung_budget() {
        let mut hb = HyperbandProposer::new(space(), 9, 3.0, true, 0);
        let config = hb.get().unwrap();
        let budget = config.get(BUDGET_KEY).unwrap().as_i64().unwrap();
        assert!(budget >= 1);
    }

    #[test]
    fn waits_for_rung_then_promotes_best() {
        let mut hb = HyperbandProposer::new(space(), 9, 3.0, true, 0);

        // Drain the first rung of the first bracket.
        let mut issued = Vec::new();
        while let Some(config) = hb.get() {
            hb.increment_job_counter();
            issued.push(config);
        }
        assert!(!issued.is_empty());
        // Rung outstanding: special-exit None while still running.
        assert_eq!(hb.status(), ProposerStatus::Running);

        // Report scores; higher is better.
        for (i, config) in issued.iter().enumerate() {
            hb.update(i as f64, &make_job(config)).unwrap();
        }

        // Next rung opens with a larger budget for the survivors.
        let first_budget = issued[0].get(BUDGET_KEY).unwrap().as_i64().unwrap();
        let next = hb.get().unwrap();
        let next_budget = next.get(BUDGET_KEY).unwrap().as_i64().unwrap();
        assert!(next_budget > first_budget);
    }

    #[test]
    fn failed_trials_are_dropped_not_fatal() {
        let mut hb = HyperbandProposer::new(space(), 9, 3.0, true, 0);
        let config = hb.get().unwrap();
        hb.increment_job_counter();
        hb.failed(&make_job(&config)).unwrap();

        // Same tid again is unknown now.
        assert!(matches!(
            hb.failed(&make_job(&config)),
            Err(ProposerError::UnknownTrial { .. })
        ));
    }

    #[test]
    fn exhausting_all_brackets_finishes() {
        let mut hb = HyperbandProposer::new(space(), 4, 2.0, true, 0);
        let mut guard = 0;
        loop {
            guard += 1;
            assert!(guard < 10_000, "hyperband failed to terminate");
            match hb.get() {
                Some(config) => {
                    hb.increment_job_counter();
                    // Score by learning rate so promotion has an ordering.
                    let score = config.get("lr").unwrap().as_f64().unwrap();
                    hb.update(score, &make_job(&config)).unwrap();
                }
                None => {
                    if hb.status() == ProposerStatus::Finished {
                        break;
                    }
                    // Special exit with nothing in flight must not happen.
                    panic!("get() returned None while running with no inflight trials");
                }
            }
        }
    }

    #[test]
    fn save_is_unsupported() {
        let hb = HyperbandProposer::new(space(), 9, 3.0, true, 0);
        match hb.save(std::path::Path::new("/tmp/x.json")) {
            Err(ProposerError::Unsupported { operation }) => assert_eq!(operation, "save"),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }
}
