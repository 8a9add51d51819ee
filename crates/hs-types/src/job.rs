//! The job value object handed to resource managers for execution.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{HsResult, JobError};
use crate::param::ParameterValue;

/// Key under which the proposer's trial id travels inside the job config.
/// It is the join key between scheduler and proposer state.
pub const TID_KEY: &str = "tid";

/// One trial's hyperparameter assignment, written to `jobs/<jid>.json` for
/// the training script to read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobConfig(pub BTreeMap<String, ParameterValue>);

impl JobConfig {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    /// Trial id assigned by the proposer, if any.
    pub fn tid(&self) -> Option<i64> {
        self.0.get(TID_KEY).and_then(|v| v.as_i64())
    }

    pub fn set_tid(&mut self, tid: i64) {
        self.0.insert(TID_KEY.to_string(), ParameterValue::Int(tid));
    }

    pub fn save(&self, path: &Path) -> HsResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> HsResult<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }
}

/// One trial: script, configuration, working directory, retry budget.
///
/// Owned by the experiment until dispatched; resource managers only hold
/// the job id plus transient execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Script invocation, e.g. `./train.sh` (extra argv tokens allowed).
    pub script: String,
    pub config: JobConfig,
    /// Working directory the script runs in; the `jobs/` scratch dir for
    /// config files and attempt logs lives underneath it.
    pub workdir: PathBuf,
    /// Store-assigned id; 0 until dispatch.
    pub jid: i64,
    /// Max number of re-submissions after a failed attempt.
    pub retries: u32,
    pub curr_retries: u32,
    /// Resources this job already failed on; retries avoid them.
    pub rid_blacklist: HashSet<i64>,
    pub was_executed: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        script: impl Into<String>,
        config: JobConfig,
        workdir: impl Into<PathBuf>,
        retries: u32,
    ) -> Self {
        let script = script.into();
        debug!(script = %script, "create job");
        Self {
            script,
            config,
            workdir: workdir.into(),
            jid: 0,
            retries,
            curr_retries: 0,
            rid_blacklist: HashSet::new(),
            was_executed: false,
            created_at: Utc::now(),
        }
    }

    pub fn tid(&self) -> Option<i64> {
        self.config.tid()
    }

    /// The script file itself, without trailing argv tokens.
    pub fn script_file(&self) -> &str {
        self.script.split_whitespace().next().unwrap_or(&self.script)
    }

    /// Scratch directory for job configs and attempt logs.
    pub fn jobs_dir(&self) -> PathBuf {
        self.workdir.join("jobs")
    }

    /// Where this job's config file is written before dispatch.
    pub fn config_path(&self) -> PathBuf {
        self.jobs_dir().join(format!("{}.json", self.jid))
    }

    /// Captured output of the current attempt.
    pub fn log_path(&self) -> PathBuf {
        self.jobs_dir()
            .join(format!("{}.{}.out", self.jid, self.curr_retries))
    }

    /// Check the script is runnable on the local machine: working
    /// directory exists, script file exists and is executable.  Creates
    /// the `jobs/` scratch dir when missing.
    pub fn verify_local(&self) -> HsResult<()> {
        if !self.workdir.is_dir() {
            return Err(JobError::MissingWorkdir {
                path: self.workdir.display().to_string(),
            }
            .into());
        }

        let jobs_dir = self.jobs_dir();
        if !jobs_dir.exists() {
            warn!(path = %jobs_dir.display(), "create missing jobs directory");
            fs::create_dir_all(&jobs_dir)?;
        }

        let script = self.resolved_script();
        if !script.is_file() {
            return Err(JobError::MissingScript {
                script: self.script.clone(),
            }
            .into());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script)?.permissions().mode();
            if mode & 0o111 == 0 {
                return Err(JobError::NotExecutable {
                    script: self.script.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Script path resolved against the working directory.
    pub fn resolved_script(&self) -> PathBuf {
        let file = Path::new(self.script_file());
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.workdir.join(file)
        }
    }
}
