//! Shared subprocess execution for the CPU/GPU/SSH/AWS variants.
//!
//! A worker thread owns the child process, streams its stdout for result
//! markers, and is shadowed by a watchdog that kills the child when the
//! job is flagged for early stopping or overruns its deadline.  Every
//! path produces exactly one [`JobOutcome`].

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use hs_types::{parse_final_line, parse_interm_line};

use crate::{JobOutcome, ManagerCore};

const WATCHDOG_POLL: Duration = Duration::from_millis(50);

/// Why the watchdog killed a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Stopped,
    TimedOut,
}

/// Keeps the manager's in-flight counter honest: incremented when the
/// dispatch is accepted, decremented when the worker thread unwinds.
pub(crate) struct WorkerGuard {
    inflight: Arc<AtomicUsize>,
}

impl WorkerGuard {
    pub(crate) fn new(core: &ManagerCore) -> Self {
        let inflight = core.inflight_handle();
        inflight.fetch_add(1, Ordering::SeqCst);
        Self { inflight }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn watchdog(
    child: Arc<Mutex<Child>>,
    done: Arc<AtomicBool>,
    kill_reason: Arc<Mutex<Option<KillReason>>>,
    core: Arc<ManagerCore>,
    jid: i64,
    deadline: Option<Duration>,
) {
    let started = Instant::now();
    loop {
        if done.load(Ordering::SeqCst) {
            return;
        }
        let reason = if core.is_stopped(jid) {
            KillReason::Stopped
        } else if deadline.is_some_and(|d| started.elapsed() >= d) {
            KillReason::TimedOut
        } else {
            std::thread::sleep(WATCHDOG_POLL);
            continue;
        };

        let mut child = child.lock();
        // Already exited on its own: nothing to kill.
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        debug!(jid, ?reason, "killing job process");
        *kill_reason.lock() = Some(reason);
        if let Err(e) = child.kill() {
            warn!(jid, "failed to kill job process: {e}");
        }
        return;
    }
}

/// Run `command`, stream its stdout for markers, and classify the end.
///
/// Stdout lines are appended to `log_path` together with stderr;
/// intermediate markers go to the store when `track` is set.  `deadline`
/// of `None` lets the child run as long as it likes.
pub(crate) fn execute_streaming(
    core: &Arc<ManagerCore>,
    jid: i64,
    mut command: Command,
    log_path: Option<PathBuf>,
    track: bool,
    deadline: Option<Duration>,
) -> JobOutcome {
    command.stdout(Stdio::piped());
    command.stdin(Stdio::null());

    let mut log = log_path.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| warn!(jid, path = %path.display(), "cannot open job log: {e}"))
            .ok()
    });
    match log.as_ref().map(File::try_clone) {
        Some(Ok(stderr_log)) => {
            command.stderr(stderr_log);
        }
        _ => {
            command.stderr(Stdio::null());
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return JobOutcome::Failed(format!("failed to start job process: {e}")),
    };
    let stdout = child.stdout.take();
    let child = Arc::new(Mutex::new(child));
    let done = Arc::new(AtomicBool::new(false));
    let kill_reason = Arc::new(Mutex::new(None));

    let guard_handle = {
        let child = Arc::clone(&child);
        let done = Arc::clone(&done);
        let kill_reason = Arc::clone(&kill_reason);
        let core = Arc::clone(core);
        std::thread::spawn(move || watchdog(child, done, kill_reason, core, jid, deadline))
    };

    let mut final_scores: Option<Vec<f64>> = None;
    let mut last_interm: Option<f64> = None;
    if let Some(stdout) = stdout {
        let reader = BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            if let Some(log) = log.as_mut() {
                let _ = writeln!(log, "{line}");
            }
            if let Some(score) = parse_interm_line(&line) {
                last_interm = Some(score);
                if track {
                    core.record_intermediate(jid, score);
                }
            } else if final_scores.is_none() {
                final_scores = parse_final_line(&line);
            }
        }
    }

    let status = child.lock().wait();
    done.store(true, Ordering::SeqCst);
    let _ = guard_handle.join();

    let kill_reason_taken = kill_reason.lock().take();
    match kill_reason_taken {
        Some(KillReason::Stopped) => JobOutcome::EarlyStopped(last_interm),
        Some(KillReason::TimedOut) => JobOutcome::Failed(format!(
            "no completion within {}s, reconciled as failed",
            deadline.unwrap_or_default().as_secs()
        )),
        None => match status {
            Ok(status) if status.success() => match final_scores {
                Some(scores) => JobOutcome::Finished(scores[0]),
                None => JobOutcome::Failed("no result marker in script output".to_string()),
            },
            Ok(status) => JobOutcome::Failed(format!("script exited with {status}")),
            Err(e) => JobOutcome::Failed(format!("failed to reap job process: {e}")),
        },
    }
}

/// Dispatch a prepared command onto a worker thread; the completion
/// event is sent exactly once when it ends.
pub(crate) fn dispatch(
    core: &Arc<ManagerCore>,
    jid: i64,
    command: Command,
    log_path: Option<PathBuf>,
    track: bool,
    deadline: Option<Duration>,
) -> std::io::Result<()> {
    let guard = WorkerGuard::new(core);
    let core = Arc::clone(core);
    std::thread::Builder::new()
        .name(format!("hs-job-{jid}"))
        .spawn(move || {
            let _guard = guard;
            let outcome = execute_streaming(&core, jid, command, log_path, track, deadline);
            debug!(jid, ?outcome, "job worker done");
            let _ = core.sender().send(crate::CompletionEvent { jid, outcome });
        })?;
    Ok(())
}
