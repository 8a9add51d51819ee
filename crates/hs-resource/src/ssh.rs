//! Remote execution over SSH.
//!
//! Slots map to host specs of the form `user@host`, `user@host:port`,
//! `user@host key` or `user@host:port key`.  The config file is copied
//! over with `scp`, the script runs under `ssh` with its stdout streamed
//! back for markers, and a per-job deadline reconciles slots whose remote
//! side went silent.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, warn};

use hs_store::Connector;
use hs_types::{config_error, HsResult, Job, ResourceArgs, ResourceError, ResourceKind};

use crate::worker::{self, WorkerGuard};
use crate::{CompletionEvent, JobOutcome, ManagerCore, ResourceManager, RunContext};

/// A parsed remote host entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub username: String,
    pub hostname: String,
    pub port: u16,
    pub key_file: Option<PathBuf>,
}

/// Parse a host entry: `user@host`, `user@host:port`, `user@host key`,
/// or `user@host:port key`.
pub fn parse_host_spec(host: &str) -> Result<HostSpec, ResourceError> {
    let bad = || ResourceError::BadHostSpec {
        host: host.to_string(),
    };

    let (username, rest) = host.split_once('@').ok_or_else(bad)?;
    if username.is_empty() || rest.is_empty() {
        return Err(bad());
    }

    let (addr, key_file) = match rest.split_once(' ') {
        Some((addr, key)) => (addr, Some(PathBuf::from(key.trim()))),
        None => (rest, None),
    };

    let (hostname, port) = match addr.split_once(':') {
        Some((hostname, port)) => (hostname, port.parse::<u16>().map_err(|_| bad())?),
        None => (addr, 22),
    };
    if hostname.is_empty() {
        return Err(bad());
    }

    Ok(HostSpec {
        username: username.to_string(),
        hostname: hostname.to_string(),
        port,
        key_file,
    })
}

impl HostSpec {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    fn ssh_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command.arg("-o").arg("BatchMode=yes");
        command.arg("-p").arg(self.port.to_string());
        if let Some(key) = &self.key_file {
            command.arg("-i").arg(key);
        }
        command.arg(self.destination());
        command
    }

    fn scp_command(&self) -> Command {
        let mut command = Command::new("scp");
        command.arg("-o").arg("BatchMode=yes");
        command.arg("-P").arg(self.port.to_string());
        if let Some(key) = &self.key_file {
            command.arg("-i").arg(key);
        }
        command
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// The shell line executed on the remote host for one job attempt.
fn build_remote_invocation(
    workdir: &str,
    script: &str,
    jid: i64,
    prescript: &str,
    postscript: &str,
    env: &BTreeMap<String, String>,
) -> String {
    let mut pre = prescript.trim().to_string();
    if !pre.is_empty() && !pre.ends_with(';') {
        pre.push(';');
    }
    let mut post = postscript.trim().to_string();
    if !post.is_empty() && !post.starts_with(';') {
        post.insert(0, ';');
    }
    let exports: String = env
        .iter()
        .map(|(k, v)| format!("{k}={} ", shell_quote(v)))
        .collect();
    format!(
        "{pre}cd {} && {exports}{script} jobs/{jid}.json{post}",
        shell_quote(workdir)
    )
}

/// Runs trials on remote machines reached over SSH, one per slot.
pub struct SshResourceManager {
    core: Arc<ManagerCore>,
    mapping: BTreeMap<i64, HostSpec>,
    /// Slots whose remote script was already checked this run.
    verified: Arc<DashSet<i64>>,
    prescript: String,
    postscript: String,
}

impl SshResourceManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        maximize: bool,
        args: &ResourceArgs,
    ) -> HsResult<Self> {
        if args.node_mapping.is_empty() {
            return Err(config_error!(
                "Missing node_mapping in resource_args for node resource"
            ));
        }
        let mut mapping = BTreeMap::new();
        for (rid, host) in &args.node_mapping {
            mapping.insert(*rid, parse_host_spec(host)?);
        }
        debug!(?mapping, "loaded node mapping");
        Ok(Self {
            core: ManagerCore::new(connector, maximize),
            mapping,
            verified: Arc::new(DashSet::new()),
            prescript: args.prescript.clone(),
            postscript: args.postscript.clone(),
        })
    }
}

/// Everything the worker thread needs, detached from the manager.
struct RemoteAttempt {
    host: HostSpec,
    workdir: String,
    script: String,
    jid: i64,
    local_config: PathBuf,
    local_log: PathBuf,
    invocation: String,
    needs_verify: bool,
}

fn run_setup(mut command: Command, what: &str) -> Result<(), String> {
    match command.output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(format!(
            "{what} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) => Err(format!("{what} failed: {e}")),
    }
}

fn run_remote(
    core: &Arc<ManagerCore>,
    attempt: &RemoteAttempt,
    ctx: &RunContext,
) -> JobOutcome {
    let remote_jobs_dir = format!("{}/jobs", attempt.workdir);

    let mut mkdir = attempt.host.ssh_command();
    mkdir.arg(format!("mkdir -p {}", shell_quote(&remote_jobs_dir)));
    if let Err(diag) = run_setup(mkdir, "remote jobs directory setup") {
        return JobOutcome::Failed(diag);
    }

    if attempt.needs_verify {
        let mut check = attempt.host.ssh_command();
        check.arg(format!(
            "cd {} && test -x {}",
            shell_quote(&attempt.workdir),
            shell_quote(&attempt.script)
        ));
        if let Err(diag) = run_setup(check, "remote script check") {
            return JobOutcome::Failed(format!(
                "{diag}; deploy an executable {} under {}",
                attempt.script, attempt.workdir
            ));
        }
    }

    let mut scp = attempt.host.scp_command();
    scp.arg(&attempt.local_config).arg(format!(
        "{}:{}/{}.json",
        attempt.host.destination(),
        remote_jobs_dir,
        attempt.jid
    ));
    if let Err(diag) = run_setup(scp, "job config upload") {
        return JobOutcome::Failed(diag);
    }

    let mut command = attempt.host.ssh_command();
    command.arg(&attempt.invocation);
    worker::execute_streaming(
        core,
        attempt.jid,
        command,
        Some(attempt.local_log.clone()),
        ctx.track_intermediate,
        Some(ctx.deadline()),
    )
}

impl ResourceManager for SshResourceManager {
    fn core(&self) -> &Arc<ManagerCore> {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Node
    }

    fn run(&self, job: &Job, rid: i64, ctx: &RunContext) -> HsResult<()> {
        let host = self
            .mapping
            .get(&rid)
            .ok_or(ResourceError::MissingMapping { rid })?
            .clone();
        debug!(jid = job.jid, rid, host = %host.destination(), "job started on node");

        fs::create_dir_all(job.jobs_dir())?;
        job.config.save(&job.config_path())?;

        let workdir = job.workdir.display().to_string();
        let attempt = RemoteAttempt {
            invocation: build_remote_invocation(
                &workdir,
                &job.script,
                job.jid,
                &self.prescript,
                &self.postscript,
                &ctx.env,
            ),
            host,
            workdir,
            script: job.script_file().to_string(),
            jid: job.jid,
            local_config: job.config_path(),
            local_log: job.log_path(),
            needs_verify: !self.verified.contains(&rid),
        };

        let core = Arc::clone(&self.core);
        let verified = Arc::clone(&self.verified);
        let ctx = ctx.clone();
        let guard = WorkerGuard::new(&core);
        std::thread::Builder::new()
            .name(format!("hs-ssh-{}", job.jid))
            .spawn(move || {
                let _guard = guard;
                let outcome = run_remote(&core, &attempt, &ctx);
                if !matches!(outcome, JobOutcome::Failed(_)) {
                    verified.insert(rid);
                }
                if let JobOutcome::Failed(diag) = &outcome {
                    warn!(jid = attempt.jid, "remote job failed: {diag}");
                }
                let _ = core.sender().send(CompletionEvent {
                    jid: attempt.jid,
                    outcome,
                });
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_store::MemoryConnector;

    #[test]
    fn parses_minimal_host() {
        let spec = parse_host_spec("ubuntu@10.0.0.5").unwrap();
        assert_eq!(spec.username, "ubuntu");
        assert_eq!(spec.hostname, "10.0.0.5");
        assert_eq!(spec.port, 22);
        assert_eq!(spec.key_file, None);
    }

    #[test]
    fn parses_port_and_key() {
        let spec = parse_host_spec("u@host:2222 /home/u/.ssh/id_rsa").unwrap();
        assert_eq!(spec.port, 2222);
        assert_eq!(spec.key_file, Some(PathBuf::from("/home/u/.ssh/id_rsa")));
        assert_eq!(spec.destination(), "u@host");
    }

    #[test]
    fn rejects_specs_without_user() {
        for bad in ["hostonly", "@host", "user@", "user@host:notaport"] {
            assert!(parse_host_spec(bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn remote_invocation_includes_pre_and_post() {
        let mut env = BTreeMap::new();
        env.insert("EPOCHS".to_string(), "5".to_string());
        let line = build_remote_invocation(
            "/data/sweep",
            "./train.sh",
            42,
            "source venv/bin/activate",
            "rm -f /tmp/scratch",
            &env,
        );
        assert_eq!(
            line,
            "source venv/bin/activate;cd '/data/sweep' && EPOCHS='5' ./train.sh jobs/42.json;rm -f /tmp/scratch"
        );
    }

    #[test]
    fn remote_invocation_minimal() {
        let line =
            build_remote_invocation("/data", "./train.sh", 7, "", "", &BTreeMap::new());
        assert_eq!(line, "cd '/data' && ./train.sh jobs/7.json");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn empty_node_mapping_is_a_config_error() {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
        assert!(SshResourceManager::new(connector, true, &ResourceArgs::default()).is_err());
    }

    #[test]
    fn bad_host_in_mapping_is_rejected() {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
        let mut args = ResourceArgs::default();
        args.node_mapping.insert(1, "no-user-here".to_string());
        assert!(SshResourceManager::new(connector, true, &args).is_err());
    }
}
