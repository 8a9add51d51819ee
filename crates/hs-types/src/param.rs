//! Search space definitions for hyperparameter configurations.

use serde::{Deserialize, Serialize};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name, must match what the training script reads from its
    /// job config (e.g. "learning_rate").
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled or enumerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterKind {
    /// Continuous range [low, high].  `interval` or `n` fix a step for
    /// sequence sweeps; random sampling ignores them.
    Float {
        low: f64,
        high: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        n: Option<usize>,
    },
    /// Integer range [low, high] inclusive.
    Int {
        low: i64,
        high: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        n: Option<usize>,
    },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    /// Step width for sequence sweeps.  Defaults to 1 when neither
    /// `interval` nor `n` is given, matching the sweep semantics the
    /// training scripts were written against.
    pub fn int_interval(&self) -> Option<i64> {
        match self {
            Self::Int {
                low,
                high,
                interval,
                n,
            } => Some(match (interval, n) {
                (Some(i), _) => *i,
                (None, Some(n)) if *n > 1 => ((high - low) / (*n as i64 - 1)).max(1),
                _ => 1,
            }),
            _ => None,
        }
    }

    pub fn float_interval(&self) -> Option<f64> {
        match self {
            Self::Float {
                low,
                high,
                interval,
                n,
            } => Some(match (interval, n) {
                (Some(i), _) => *i,
                (None, Some(n)) if *n > 1 => (high - low) / (*n as f64 - 1.0),
                _ => 1.0,
            }),
            _ => None,
        }
    }

    /// Number of grid points along this dimension.
    pub fn axis_len(&self) -> usize {
        match self {
            Self::Int { low, high, .. } => {
                let interval = self.int_interval().unwrap_or(1);
                ((high - low) / interval) as usize + 1
            }
            Self::Float { low, high, .. } => {
                let interval = self.float_interval().unwrap_or(1.0);
                ((high - low) / interval).floor() as usize + 1
            }
            Self::Choice { values } => values.len(),
        }
    }
}

/// A concrete parameter value produced by a proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            Self::Json(v) => v.as_i64(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Float {
                low,
                high,
                interval: None,
                n: None,
            },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Int {
                low,
                high,
                interval: None,
                n: None,
            },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Fix the sweep interval of the most recently added parameter.
    pub fn with_interval(mut self, interval: f64) -> Self {
        if let Some(param) = self.parameters.last_mut() {
            match &mut param.kind {
                ParameterKind::Float { interval: i, .. } => *i = Some(interval),
                ParameterKind::Int { interval: i, .. } => *i = Some(interval as i64),
                ParameterKind::Choice { .. } => {}
            }
        }
        self
    }

    /// Fix the number of sweep steps of the most recently added parameter.
    pub fn with_steps(mut self, n: usize) -> Self {
        if let Some(param) = self.parameters.last_mut() {
            match &mut param.kind {
                ParameterKind::Float { n: slot, .. } => *slot = Some(n),
                ParameterKind::Int { n: slot, .. } => *slot = Some(n),
                ParameterKind::Choice { .. } => {}
            }
        }
        self
    }

    /// Total number of grid points across all dimensions.
    pub fn grid_size(&self) -> usize {
        self.parameters
            .iter()
            .map(|p| p.kind.axis_len())
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}
