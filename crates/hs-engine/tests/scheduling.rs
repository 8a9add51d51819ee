//! End-to-end scheduling scenarios: real shell scripts on real slots,
//! driven through the full Experiment loop.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hs_engine::{spawn_status_watcher, Experiment};
use hs_store::{Connector, MemoryConnector, SqliteConnector};
use hs_types::{
    ExperimentConfig, ExperimentStatus, HsError, ResourceKind, SearchSpace, Target,
};

fn write_script(dir: &Path, body: &str) {
    let path = dir.join("train.sh");
    let mut file = File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// A trial script whose score is its own `x1` parameter.
const SCORE_IS_X1: &str = r##"x=$(sed -n 's/.*"x1": *\(-\{0,1\}[0-9.]*\).*/\1/p' "$1")
echo "#hypersweep:$x""##;

fn memory_store_with_slots(n: usize) -> Arc<dyn Connector> {
    let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
    hs_store::seed_resources(&connector, ResourceKind::Cpu, n).unwrap();
    connector
}

fn base_config(dir: &Path, proposer: &str) -> ExperimentConfig {
    ExperimentConfig::new("sweep", "./train.sh", ResourceKind::Cpu, proposer)
        .with_workingdir(dir.display().to_string())
        .with_target(Target::Max)
}

#[test]
fn sequence_sweep_finds_the_best_point() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), SCORE_IS_X1);
    let connector = memory_store_with_slots(2);

    let config = base_config(dir.path(), "sequence")
        .with_n_parallel(2)
        .with_parameters(SearchSpace::new().add_int("x1", 0, 10));
    let mut experiment = Experiment::new(config, Arc::clone(&connector)).unwrap();

    let summary = experiment.run().unwrap();
    assert_eq!(summary.status, ExperimentStatus::Finished);
    let best = summary.best.expect("a best result");
    assert_eq!(best.score, 10.0);

    // Nothing left pending, and the connector was closed by finish().
    assert!(experiment.pending_ids().is_empty());
    assert!(connector.is_closed());
}

#[test]
fn retry_law_failing_job_runs_n_plus_one_attempts() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "echo run >> attempts.log\nexit 1");
    let connector = memory_store_with_slots(2);

    let config = base_config(dir.path(), "sequence")
        .with_parameters(SearchSpace::new().add_int("x1", 0, 0))
        .with_retries(2)
        .with_ignore_fail(true);
    let mut experiment = Experiment::new(config, connector).unwrap();

    let summary = experiment.run().unwrap();
    // Proposer absorbed the failure; the experiment itself completed.
    assert_eq!(summary.status, ExperimentStatus::Finished);
    assert_eq!(summary.best, None);

    // retries=2 → exactly 3 attempts in total.
    let attempts = fs::read_to_string(dir.path().join("attempts.log")).unwrap();
    assert_eq!(attempts.lines().count(), 3);
}

#[test]
fn flaky_point_fails_once_without_retries() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        r##"x=$(sed -n 's/.*"x1": *\(-\{0,1\}[0-9.]*\).*/\1/p' "$1")
if [ "$x" = "5" ]; then
    echo run >> failures.log
    exit 1
fi
echo "#hypersweep:$x""##,
    );
    let connector = memory_store_with_slots(2);

    let config = base_config(dir.path(), "sequence")
        .with_n_parallel(2)
        .with_parameters(SearchSpace::new().add_int("x1", 0, 10))
        .with_ignore_fail(true);
    let mut experiment = Experiment::new(config, connector).unwrap();

    let summary = experiment.run().unwrap();
    assert_eq!(summary.status, ExperimentStatus::Finished);
    // The flaky point was attempted exactly once (retries=0)...
    let failures = fs::read_to_string(dir.path().join("failures.log")).unwrap();
    assert_eq!(failures.lines().count(), 1);
    // ...and the rest of the grid still produced the best point.
    assert_eq!(summary.best.unwrap().score, 10.0);
}

#[test]
fn failing_job_without_fail_safe_stops_the_experiment() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "exit 1");
    let connector = memory_store_with_slots(1);

    let config = base_config(dir.path(), "sequence")
        .with_parameters(SearchSpace::new().add_int("x1", 0, 3));
    let mut experiment = Experiment::new(config, connector).unwrap();

    let summary = experiment.run().unwrap();
    assert_eq!(summary.status, ExperimentStatus::Failed);
}

#[test]
fn finish_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), SCORE_IS_X1);
    let connector = memory_store_with_slots(1);

    let config = base_config(dir.path(), "sequence")
        .with_parameters(SearchSpace::new().add_int("x1", 0, 2));
    let mut experiment = Experiment::new(config, connector).unwrap();

    let first = experiment.run().unwrap();
    let second = experiment.finish().unwrap();
    let third = experiment.finish().unwrap();
    assert_eq!(first, second);
    assert_eq!(second, third);
}

#[test]
fn random_proposer_runs_to_its_sample_budget() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), SCORE_IS_X1);

    let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
    hs_store::seed_resources(&connector, ResourceKind::Cpu, 2).unwrap();

    let mut config = base_config(dir.path(), "random")
        .with_n_parallel(2)
        .with_parameters(SearchSpace::new().add_int("x1", 1, 9))
        .with_n_samples(5);
    config.random_seed = Some(11);
    let mut experiment = Experiment::new(config, Arc::clone(&connector)).unwrap();

    let summary = experiment.run().unwrap();
    assert_eq!(summary.status, ExperimentStatus::Finished);
    let best = summary.best.unwrap();
    assert!((1.0..=9.0).contains(&best.score));
}

#[test]
fn hyperband_runs_all_brackets_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    // Score by the rung budget so promotions are well-ordered.
    write_script(
        dir.path(),
        r##"b=$(sed -n 's/.*"n_iterations": *\([0-9]*\).*/\1/p' "$1")
echo "#hypersweep:$b""##,
    );
    let connector = memory_store_with_slots(2);

    let mut config = base_config(dir.path(), "hyperband")
        .with_n_parallel(2)
        .with_parameters(SearchSpace::new().add_float("lr", 0.001, 0.1));
    config.max_iter = Some(4);
    config.eta = Some(2.0);
    let mut experiment = Experiment::new(config, connector).unwrap();

    let summary = experiment.run().unwrap();
    assert_eq!(summary.status, ExperimentStatus::Finished);
    // The deepest rung runs at the full budget.
    assert_eq!(summary.best.unwrap().score, 4.0);
}

#[test]
fn suspend_and_resume_reconstructs_pending_jobs() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        r##"sleep 2
x=$(sed -n 's/.*"x1": *\(-\{0,1\}[0-9.]*\).*/\1/p' "$1")
echo "#hypersweep:$x""##,
    );
    let db_path = dir.path().join("sweep.db");

    let connector: Arc<dyn Connector> = Arc::new(SqliteConnector::open(&db_path).unwrap());
    hs_store::seed_resources(&connector, ResourceKind::Cpu, 2).unwrap();

    let config = base_config(dir.path(), "sequence")
        .with_n_parallel(2)
        .with_parameters(SearchSpace::new().add_int("x1", 0, 3));

    let mut experiment = Experiment::new(config.clone(), Arc::clone(&connector)).unwrap();
    let eid = experiment.eid();
    let stop = experiment.stop_handle();

    let runner = std::thread::spawn(move || experiment.run());
    // Let the first two jobs start, then pull the plug.
    std::thread::sleep(Duration::from_millis(700));
    stop.store(true, Ordering::SeqCst);
    match runner.join().unwrap() {
        Err(HsError::Suspended) => {}
        other => panic!("expected Suspended, got {other:?}"),
    }

    // The store still lists the in-flight jobs as running.
    let reopened: Arc<dyn Connector> = Arc::new(SqliteConnector::open(&db_path).unwrap());
    let still_running = reopened.get_running_job(eid).unwrap();
    assert!(!still_running.is_empty());

    // Resume reconstructs pending_jobs to exactly that list.
    let mut resumed = Experiment::resume(config, Arc::clone(&reopened), eid).unwrap();
    assert_eq!(resumed.pending_ids(), still_running);

    // The resumed run cancels those jobs and finishes the sweep.
    let summary = resumed.run().unwrap();
    assert_eq!(summary.status, ExperimentStatus::Finished);
    assert_eq!(summary.best.unwrap().score, 3.0);

    let verify: Arc<dyn Connector> = Arc::new(SqliteConnector::open(&db_path).unwrap());
    assert!(verify.get_running_job(eid).unwrap().is_empty());
}

#[test]
fn external_stop_request_triggers_suspension() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "sleep 5\necho '#hypersweep:1'");
    let connector = memory_store_with_slots(1);

    let config = base_config(dir.path(), "sequence")
        .with_parameters(SearchSpace::new().add_int("x1", 0, 5));
    let mut experiment = Experiment::new(config, Arc::clone(&connector)).unwrap();
    let eid = experiment.eid();
    let stop = experiment.stop_handle();

    let _watcher = spawn_status_watcher(
        Arc::clone(&connector),
        eid,
        Arc::clone(&stop),
        Duration::from_millis(50),
    );

    let runner = std::thread::spawn(move || experiment.run());
    std::thread::sleep(Duration::from_millis(300));
    connector.request_stop(eid).unwrap();

    match runner.join().unwrap() {
        Err(HsError::Suspended) => {}
        other => panic!("expected Suspended, got {other:?}"),
    }
}

#[test]
fn single_slot_never_runs_two_jobs_at_once() {
    let dir = tempfile::tempdir().unwrap();
    // Each run proves exclusivity by failing if a lock file already exists.
    write_script(
        dir.path(),
        r##"if [ -e lock ]; then echo "#hypersweep:-1"; exit 0; fi
touch lock
sleep 0.2
rm -f lock
x=$(sed -n 's/.*"x1": *\(-\{0,1\}[0-9.]*\).*/\1/p' "$1")
echo "#hypersweep:$x""##,
    );
    let connector = memory_store_with_slots(1);

    let config = base_config(dir.path(), "sequence")
        .with_n_parallel(1)
        .with_target(Target::Min)
        .with_parameters(SearchSpace::new().add_int("x1", 1, 3));
    let mut experiment = Experiment::new(config, connector).unwrap();

    let summary = experiment.run().unwrap();
    assert_eq!(summary.status, ExperimentStatus::Finished);
    // Minimizing: any overlap would have produced a -1 score.
    assert_eq!(summary.best.unwrap().score, 1.0);
}
