//! Experiment configuration, loaded from a JSON file by the runner.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::errors::HsResult;
use crate::param::{ParameterDef, SearchSpace};
use crate::status::Target;

/// The resource class an experiment schedules its trials on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Gpu,
    /// Remote machines reached over SSH.
    Node,
    /// Slots that wait for an externally reported result.
    Passive,
    Aws,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Node => "node",
            Self::Passive => "passive",
            Self::Aws => "aws",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = crate::errors::ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "node" => Ok(Self::Node),
            "passive" => Ok(Self::Passive),
            "aws" => Ok(Self::Aws),
            other => Err(crate::errors::ResourceError::UnknownType {
                rtype: other.to_string(),
            }),
        }
    }
}

/// How job failures are absorbed before they become experiment failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailureConfig {
    /// Keep the experiment alive after a job exhausts its retries.
    #[serde(default)]
    pub ignore_fail: bool,
    /// Re-submissions per job after a failed attempt.
    #[serde(default = "default_job_retries")]
    pub job_retries: u32,
}

fn default_job_retries() -> u32 {
    3
}

impl Default for JobFailureConfig {
    fn default() -> Self {
        // Without an explicit job_failure block, a failing job fails once.
        Self {
            ignore_fail: false,
            job_retries: 0,
        }
    }
}

/// Early-stopping policy over intermediate results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyStopPolicy {
    /// Stop a trial whose running average falls below the median of the
    /// other trials' averages.
    Median,
    /// Stop a trial whose best value falls below a factor of the best
    /// value across trials.
    Bandit,
    /// Stop trials ranked in the bottom fraction at a checkpoint.
    Truncation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopConfig {
    pub policy: EarlyStopPolicy,
    /// Compare trials every `policy_steps` intermediate results.
    pub policy_steps: usize,
    /// Number of intermediate results a trial may report before it is
    /// eligible for stopping.
    #[serde(default)]
    pub warmup: usize,
    #[serde(default = "default_bandit_factor")]
    pub bandit_factor: f64,
    #[serde(default = "default_truncation_percentage")]
    pub truncation_percentage: f64,
}

fn default_bandit_factor() -> f64 {
    0.5
}

fn default_truncation_percentage() -> f64 {
    0.3
}

/// Arguments consumed by the resource manager variants.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceArgs {
    /// Deadline for one job attempt, enforced by remote and passive
    /// variants (seconds).  None means the built-in default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// rid → CUDA device string, for the GPU variant.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gpu_mapping: BTreeMap<i64, String>,
    /// rid → host spec (`user@host[:port]`), for the SSH and AWS variants.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_mapping: BTreeMap<i64, String>,
    /// Shell fragment run before the script on remote nodes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prescript: String,
    /// Shell fragment run after the script on remote nodes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub postscript: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stop: Option<EarlyStopConfig>,
    /// Record intermediate-result lines in the store.  Implied by
    /// `early_stop`.
    #[serde(default)]
    pub track_intermediate_results: bool,
}

/// Arguments forwarded to the job execution environment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeArgs {
    /// Extra environment variables set on every job process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Top-level configuration for one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    /// Script invocation relative to `workingdir`.
    pub script: String,
    #[serde(default = "default_workingdir")]
    pub workingdir: String,
    pub resource: ResourceKind,
    #[serde(default = "default_n_parallel")]
    pub n_parallel: usize,
    pub target: Target,
    /// Search strategy name, resolved through the proposer registry.
    pub proposer: String,
    pub parameter_config: Vec<ParameterDef>,
    /// Trial budget for sampling proposers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    /// Hyperband bracket width (max resource per trial).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iter: Option<usize>,
    /// Hyperband reduction factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default)]
    pub job_failure: JobFailureConfig,
    #[serde(default)]
    pub resource_args: ResourceArgs,
    #[serde(default)]
    pub runtime_args: RuntimeArgs,
}

fn default_workingdir() -> String {
    ".".to_string()
}

fn default_n_parallel() -> usize {
    1
}

impl ExperimentConfig {
    pub fn new(
        name: impl Into<String>,
        script: impl Into<String>,
        resource: ResourceKind,
        proposer: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            workingdir: default_workingdir(),
            resource,
            n_parallel: 1,
            target: Target::Max,
            proposer: proposer.into(),
            parameter_config: Vec::new(),
            n_samples: None,
            random_seed: None,
            max_iter: None,
            eta: None,
            job_failure: JobFailureConfig::default(),
            resource_args: ResourceArgs::default(),
            runtime_args: RuntimeArgs::default(),
        }
    }

    pub fn with_workingdir(mut self, dir: impl Into<String>) -> Self {
        self.workingdir = dir.into();
        self
    }

    pub fn with_n_parallel(mut self, n: usize) -> Self {
        self.n_parallel = n.max(1);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_parameters(mut self, space: SearchSpace) -> Self {
        self.parameter_config = space.parameters;
        self
    }

    pub fn with_n_samples(mut self, n: usize) -> Self {
        self.n_samples = Some(n);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.job_failure.job_retries = retries;
        self
    }

    pub fn with_ignore_fail(mut self, ignore: bool) -> Self {
        self.job_failure.ignore_fail = ignore;
        self
    }

    pub fn search_space(&self) -> SearchSpace {
        SearchSpace {
            parameters: self.parameter_config.clone(),
        }
    }

    /// Whether intermediate-result lines should be persisted.
    pub fn track_intermediate(&self) -> bool {
        self.resource_args.track_intermediate_results || self.resource_args.early_stop.is_some()
    }

    pub fn load(path: &Path) -> HsResult<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.verify()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> HsResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject configurations the scheduler cannot run.
    pub fn verify(&self) -> HsResult<()> {
        if self.name.is_empty() {
            return Err(config_error!("Missing required value for 'name'"));
        }
        if self.script.is_empty() {
            return Err(config_error!("Missing required value for 'script'"));
        }
        if self.parameter_config.is_empty() {
            return Err(config_error!(
                "Specify the parameter configuration 'parameter_config' to be searched"
            ));
        }
        for param in &self.parameter_config {
            if param.name.is_empty() {
                return Err(config_error!("hyperparameter name is missing"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "name": "mnist_sweep",
            "script": "./train.sh",
            "resource": "cpu",
            "target": "max",
            "proposer": "random",
            "n_samples": 10,
            "parameter_config": [
                {"name": "lr", "type": "float", "low": 0.001, "high": 0.1}
            ]
        }"#
    }

    #[test]
    fn defaults_fill_in() {
        let config: ExperimentConfig = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.workingdir, ".");
        assert_eq!(config.n_parallel, 1);
        assert_eq!(config.job_failure.job_retries, 0);
        assert!(!config.job_failure.ignore_fail);
        assert!(config.resource_args.node_mapping.is_empty());
        config.verify().unwrap();
    }

    #[test]
    fn job_failure_block_defaults_to_three_retries() {
        let json = r#"{"ignore_fail": true}"#;
        let jf: JobFailureConfig = serde_json::from_str(json).unwrap();
        assert!(jf.ignore_fail);
        assert_eq!(jf.job_retries, 3);
    }

    #[test]
    fn verify_rejects_empty_parameters() {
        let config =
            ExperimentConfig::new("exp", "./train.sh", ResourceKind::Cpu, "random");
        assert!(config.verify().is_err());
    }

    #[test]
    fn early_stop_implies_tracking() {
        let mut config: ExperimentConfig = serde_json::from_str(minimal_json()).unwrap();
        assert!(!config.track_intermediate());
        config.resource_args.early_stop = Some(EarlyStopConfig {
            policy: EarlyStopPolicy::Median,
            policy_steps: 2,
            warmup: 0,
            bandit_factor: 0.5,
            truncation_percentage: 0.3,
        });
        assert!(config.track_intermediate());
    }

    #[test]
    fn resource_kind_round_trip() {
        for kind in [
            ResourceKind::Cpu,
            ResourceKind::Gpu,
            ResourceKind::Node,
            ResourceKind::Passive,
            ResourceKind::Aws,
        ] {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("tpu".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn config_json_round_trip() {
        let config = ExperimentConfig::new("exp", "./train.sh", ResourceKind::Gpu, "sequence")
            .with_n_parallel(4)
            .with_target(Target::Min)
            .with_parameters(SearchSpace::new().add_int("x1", 0, 10));
        let json = serde_json::to_string(&config).unwrap();
        let back: ExperimentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
