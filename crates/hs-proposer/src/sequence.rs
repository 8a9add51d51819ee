//! Exhaustive sweep over the parameter grid, one axis at a time.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use hs_types::{
    ExperimentConfig, HsResult, Job, JobConfig, ParameterDef, ParameterKind, ParameterValue,
    ProposerError,
};

use crate::{persistence_error, Proposer, ProposerCore, ProposerStatus};

/// One sweep axis with its cursor.  Advancing past the end wraps back to
/// the start and carries into the next axis, odometer style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Axis {
    Int {
        name: String,
        min: i64,
        max: i64,
        interval: i64,
        current: i64,
    },
    Float {
        name: String,
        min: f64,
        max: f64,
        interval: f64,
        current: f64,
    },
    Choice {
        name: String,
        values: Vec<serde_json::Value>,
        current: usize,
    },
}

impl Axis {
    fn from_def(def: &ParameterDef) -> Self {
        match &def.kind {
            ParameterKind::Int { low, high, .. } => Axis::Int {
                name: def.name.clone(),
                min: *low,
                max: *high,
                interval: def.kind.int_interval().unwrap_or(1),
                current: *low,
            },
            ParameterKind::Float { low, high, .. } => Axis::Float {
                name: def.name.clone(),
                min: *low,
                max: *high,
                interval: def.kind.float_interval().unwrap_or(1.0),
                current: *low,
            },
            ParameterKind::Choice { values } => Axis::Choice {
                name: def.name.clone(),
                values: values.clone(),
                current: 0,
            },
        }
    }

    fn name(&self) -> &str {
        match self {
            Axis::Int { name, .. } | Axis::Float { name, .. } | Axis::Choice { name, .. } => name,
        }
    }

    fn len(&self) -> usize {
        match self {
            Axis::Int {
                min, max, interval, ..
            } => ((max - min) / interval) as usize + 1,
            Axis::Float {
                min, max, interval, ..
            } => ((max - min) / interval).floor() as usize + 1,
            Axis::Choice { values, .. } => values.len(),
        }
    }

    /// Current value; advances the cursor first when `step` is set.
    /// Returns `(value, wrapped)`; `wrapped` carries into the next axis.
    fn advance(&mut self, step: bool) -> (ParameterValue, bool) {
        match self {
            Axis::Int {
                min,
                max,
                interval,
                current,
                ..
            } => {
                if step {
                    let next = *current + *interval;
                    if next > *max {
                        *current = *min;
                        (ParameterValue::Int(*current), true)
                    } else {
                        *current = next;
                        (ParameterValue::Int(*current), false)
                    }
                } else {
                    (ParameterValue::Int(*current), false)
                }
            }
            Axis::Float {
                min,
                max,
                interval,
                current,
                ..
            } => {
                if step {
                    let next = *current + *interval;
                    // Tolerance guards against accumulated rounding error
                    // at the top of the range.
                    if next > *max + *interval * 0.1 {
                        *current = *min;
                        (ParameterValue::Float(*current), true)
                    } else {
                        *current = next;
                        (ParameterValue::Float(*current), false)
                    }
                } else {
                    (ParameterValue::Float(*current), false)
                }
            }
            Axis::Choice {
                values, current, ..
            } => {
                if step {
                    *current += 1;
                    if *current >= values.len() {
                        *current = 0;
                        (ParameterValue::Json(values[0].clone()), true)
                    } else {
                        (ParameterValue::Json(values[*current].clone()), false)
                    }
                } else {
                    (ParameterValue::Json(values[*current].clone()), false)
                }
            }
        }
    }
}

/// Grid sweep proposer: enumerates every combination of the configured
/// axes exactly once, first axis fastest.
#[derive(Debug, Serialize, Deserialize)]
pub struct SequenceProposer {
    core: ProposerCore,
    axes: Vec<Axis>,
}

impl SequenceProposer {
    pub fn from_config(config: &ExperimentConfig) -> HsResult<Self> {
        let axes: Vec<Axis> = config.parameter_config.iter().map(Axis::from_def).collect();
        let n_samples = axes.iter().map(Axis::len).product();
        Ok(Self {
            core: ProposerCore::new(n_samples),
            axes,
        })
    }

    fn next_point(&mut self) -> JobConfig {
        let mut config = JobConfig::new();
        // The first proposal reports the grid origin without advancing.
        let mut carry = self.core.counter > 0;
        for axis in &mut self.axes {
            let (value, wrapped) = axis.advance(carry);
            config.insert(axis.name().to_string(), value);
            carry = wrapped;
        }
        config
    }
}

impl Proposer for SequenceProposer {
    fn get(&mut self) -> Option<JobConfig> {
        self.core.check_termination();
        if self.core.status() != ProposerStatus::Running {
            return None;
        }
        let mut config = self.next_point();
        config.set_tid(self.core.issue_tid());
        debug!(?config, "sequence proposal");
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
        let json = serde_json::to_string_pretty(self).map_err(persistence_error)?;
        std::fs::write(path, json).map_err(persistence_error)
    }

    fn reload(&mut self, path: &Path) -> Result<(), ProposerError> {
        let json = std::fs::read_to_string(path).map_err(persistence_error)?;
        *self = serde_json::from_str(&json).map_err(persistence_error)?;
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
        "sequence"
    }
}
