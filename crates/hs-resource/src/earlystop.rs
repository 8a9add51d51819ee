//! Early-stopping policies over intermediate results.
//!
//! A background monitor compares the intermediate-result curves of
//! running trials against their peers every few steps and flags hopeless
//! trials for termination.  The decision rules are pure functions so the
//! policies can be tested without any running jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use hs_types::{EarlyStopConfig, EarlyStopPolicy, JobStatus};

use crate::ManagerCore;

const MONITOR_SLEEP: Duration = Duration::from_secs(1);

fn best(values: &[f64], maximize: bool) -> f64 {
    values
        .iter()
        .copied()
        .fold(if maximize { f64::NEG_INFINITY } else { f64::INFINITY }, |acc, v| {
            if maximize {
                acc.max(v)
            } else {
                acc.min(v)
            }
        })
}

fn average(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &mut Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn no_worse(candidate: f64, threshold: f64, maximize: bool) -> bool {
    if maximize {
        candidate >= threshold
    } else {
        candidate <= threshold
    }
}

/// Median policy: stop when the trial's running average over the first
/// `step` results is worse than the median of the other trials' averages.
pub fn median_stop(current: &[f64], others: &[Vec<f64>], step: usize, maximize: bool) -> bool {
    if others.is_empty() || current.len() < step {
        return false;
    }
    let mut averages: Vec<f64> = others.iter().map(|vals| average(&vals[..step])).collect();
    let median = median(&mut averages);
    !no_worse(average(&current[..step]), median, maximize)
}

/// Bandit policy: stop when the trial's best value is worse than a
/// factor of the best value any other trial reached by `step`.
pub fn bandit_stop(
    current: &[f64],
    others: &[Vec<f64>],
    step: usize,
    factor: f64,
    maximize: bool,
) -> bool {
    if others.is_empty() || current.len() < step {
        return false;
    }
    let bests: Vec<f64> = others.iter().map(|vals| best(&vals[..step], maximize)).collect();
    let overall_best = best(&bests, maximize);
    // A negative best flips the comparison direction; mirror the factor.
    let factor = if (maximize && overall_best.is_sign_positive())
        || (!maximize && overall_best.is_sign_negative())
    {
        factor
    } else {
        2.0 - factor
    };
    !no_worse(best(&current[..step], maximize), factor * overall_best, maximize)
}

/// Truncation policy: stop trials ranked in the bottom
/// `percentage` fraction of all trials at this step.
pub fn truncation_stop(
    jid: i64,
    all: &HashMap<i64, Vec<f64>>,
    step: usize,
    percentage: f64,
    maximize: bool,
) -> bool {
    if all.len() < 2 || !all.contains_key(&jid) {
        return false;
    }
    let mut ranking: Vec<(i64, f64)> = all
        .iter()
        .filter(|(_, vals)| vals.len() >= step)
        .map(|(j, vals)| (*j, best(&vals[..step], maximize)))
        .collect();
    if ranking.len() < 2 {
        return false;
    }
    // Worst first, so a low rank means the bottom of the field.
    ranking.sort_by(|a, b| {
        let ordering = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        if maximize {
            ordering
        } else {
            ordering.reverse()
        }
    });
    let rank = match ranking.iter().position(|(j, _)| *j == jid) {
        Some(idx) => idx + 1,
        None => return false,
    };
    rank as f64 / ranking.len() as f64 <= percentage
}

/// Background policy thread flagging hopeless trials on a manager core.
pub struct EarlyStopMonitor {
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EarlyStopMonitor {
    pub fn start(core: Arc<ManagerCore>, config: EarlyStopConfig, maximize: bool) -> Self {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handle = std::thread::Builder::new()
            .name("hs-earlystop".to_string())
            .spawn(move || monitor_loop(core, config, maximize, flag))
            .expect("failed to spawn early-stop monitor");
        Self {
            finished,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.finished.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn monitor_loop(
    core: Arc<ManagerCore>,
    config: EarlyStopConfig,
    maximize: bool,
    finished: Arc<AtomicBool>,
) {
    let policy_steps = config.policy_steps.max(1);
    // Steps already compared, per job; a step is only judged once.
    let mut checked: HashMap<i64, Vec<usize>> = HashMap::new();

    while !finished.load(Ordering::SeqCst) {
        std::thread::sleep(MONITOR_SLEEP);

        let current: Vec<i64> = core
            .running_jobs()
            .into_iter()
            .filter(|jid| !core.is_stopped(*jid))
            .collect();
        if current.is_empty() {
            continue;
        }

        let connector = core.connector();
        let finished_res = connector
            .get_intermediate_results_experiment(core.eid(), JobStatus::Finished)
            .unwrap_or_default();
        let current_res = connector
            .get_intermediate_results_jobs(&current)
            .unwrap_or_default();
        let mut all = finished_res;
        all.extend(current_res.iter().map(|(j, v)| (*j, v.clone())));

        for (jid, series) in &current_res {
            if series.len() < config.warmup {
                continue;
            }
            let k = series.len() / policy_steps;
            if k < 1 {
                continue;
            }
            let step = k * policy_steps;
            if checked.get(jid).is_some_and(|steps| steps.contains(&step)) {
                continue;
            }

            let others: Vec<Vec<f64>> = all
                .iter()
                .filter(|(j, vals)| *j != jid && vals.len() >= step)
                .map(|(_, vals)| vals.clone())
                .collect();
            if others.is_empty() {
                debug!(jid, step, "too few peers to compare against");
                continue;
            }

            let stop = match config.policy {
                EarlyStopPolicy::Median => median_stop(series, &others, step, maximize),
                EarlyStopPolicy::Bandit => {
                    bandit_stop(series, &others, step, config.bandit_factor, maximize)
                }
                EarlyStopPolicy::Truncation => truncation_stop(
                    *jid,
                    &all,
                    step,
                    config.truncation_percentage,
                    maximize,
                ),
            };
            if stop {
                info!(
                    jid,
                    step,
                    policy = ?config.policy,
                    "stopping trial early, curve is not competitive"
                );
                core.mark_stopped(*jid);
            }
            checked.entry(*jid).or_default().push(step);
        }
    }
}
