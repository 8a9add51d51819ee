//! SQLite-backed connector.
//!
//! One database file holds every experiment of a user; the schema is
//! created on open.  `rusqlite::Connection` is not `Sync`, so the
//! connection lives behind a mutex; all queries here are short
//! single-row statements.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use hs_types::{
    BestResult, ExperimentStatus, JobConfig, JobStatus, ResourceKind, StoreError, StoreResult,
};

use crate::connector::Connector;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS experiment (
    eid        INTEGER PRIMARY KEY AUTOINCREMENT,
    username   TEXT NOT NULL,
    config     TEXT NOT NULL,
    status     TEXT NOT NULL,
    start_time INTEGER,
    end_time   INTEGER
);
CREATE TABLE IF NOT EXISTS resource (
    rid    INTEGER PRIMARY KEY AUTOINCREMENT,
    name   TEXT NOT NULL,
    type   TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'free'
);
CREATE TABLE IF NOT EXISTS job (
    jid        INTEGER PRIMARY KEY AUTOINCREMENT,
    eid        INTEGER NOT NULL REFERENCES experiment(eid),
    rid        INTEGER REFERENCES resource(rid),
    config     TEXT NOT NULL,
    score      REAL,
    status     TEXT NOT NULL,
    start_time INTEGER,
    end_time   INTEGER
);
CREATE TABLE IF NOT EXISTS job_attempt (
    aid        INTEGER PRIMARY KEY AUTOINCREMENT,
    jid        INTEGER NOT NULL REFERENCES job(jid),
    rid        INTEGER,
    num        INTEGER NOT NULL,
    start_time INTEGER,
    end_time   INTEGER
);
CREATE TABLE IF NOT EXISTS intermediate_result (
    irid        INTEGER PRIMARY KEY AUTOINCREMENT,
    jid         INTEGER NOT NULL REFERENCES job(jid),
    seq         INTEGER NOT NULL,
    score       REAL NOT NULL,
    recorded_at INTEGER
);
CREATE TABLE IF NOT EXISTS error_log (
    lid       INTEGER PRIMARY KEY AUTOINCREMENT,
    eid       INTEGER,
    message   TEXT NOT NULL,
    logged_at INTEGER
);
";

fn store_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query {
        message: e.to_string(),
    }
}

/// Connector persisting to a SQLite database file.
pub struct SqliteConnector {
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteConnector {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        debug!(path = %path.as_ref().display(), "opened experiment database");
        Ok(Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    /// Open an in-process database, handy for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    fn guard(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }
}

impl Connector for SqliteConnector {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn add_resource(&self, rtype: ResourceKind, name: &str) -> StoreResult<i64> {
        self.guard()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO resource (name, type, status) VALUES (?1, ?2, 'free')",
            params![name, rtype.as_str()],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn get_available_resource(
        &self,
        username: &str,
        rtype: ResourceKind,
        blacklist: &[i64],
    ) -> StoreResult<Vec<i64>> {
        self.guard()?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT rid FROM resource WHERE type = ?1 AND status = 'free' ORDER BY rid")
            .map_err(store_err)?;
        let rids: Vec<i64> = stmt
            .query_map(params![rtype.as_str()], |row| row.get(0))
            .map_err(store_err)?
            .filter_map(|r| r.ok())
            .filter(|rid| !blacklist.contains(rid))
            .collect();
        debug!(user = username, %rtype, ?rids, "available resources");
        Ok(rids)
    }

    fn take_available_resource(&self, rid: i64) -> StoreResult<bool> {
        self.guard()?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE resource SET status = 'busy' WHERE rid = ?1 AND status = 'free'",
                params![rid],
            )
            .map_err(store_err)?;
        Ok(changed == 1)
    }

    fn free_used_resource(&self, rid: i64) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        let changed = conn
            .execute("UPDATE resource SET status = 'free' WHERE rid = ?1", params![rid])
            .map_err(store_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "resource".to_string(),
                id: rid,
            });
        }
        Ok(())
    }

    fn free_all_resources(&self) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        conn.execute("UPDATE resource SET status = 'free'", [])
            .map_err(store_err)?;
        Ok(())
    }

    fn create_experiment(&self, username: &str, config_json: &str) -> StoreResult<i64> {
        self.guard()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO experiment (username, config, status) VALUES (?1, ?2, ?3)",
            params![username, config_json, ExperimentStatus::Created.as_str()],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn start_experiment(&self, username: &str, config_json: &str) -> StoreResult<i64> {
        self.guard()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO experiment (username, config, status, start_time) VALUES (?1, ?2, ?3, ?4)",
            params![
                username,
                config_json,
                ExperimentStatus::Running.as_str(),
                Self::now()
            ],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn start_experiment_by_eid(&self, eid: i64) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE experiment SET status = ?1, start_time = ?2 WHERE eid = ?3",
                params![ExperimentStatus::Running.as_str(), Self::now(), eid],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "experiment".to_string(),
                id: eid,
            });
        }
        Ok(())
    }

    fn end_experiment(&self, eid: i64, status: ExperimentStatus) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE experiment SET status = ?1, end_time = ?2 WHERE eid = ?3",
                params![status.as_str(), Self::now(), eid],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "experiment".to_string(),
                id: eid,
            });
        }
        Ok(())
    }

    fn experiment_status(&self, eid: i64) -> StoreResult<ExperimentStatus> {
        self.guard()?;
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM experiment WHERE eid = ?1",
                params![eid],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        status
            .and_then(|s| ExperimentStatus::parse(&s))
            .ok_or(StoreError::NotFound {
                entity: "experiment".to_string(),
                id: eid,
            })
    }

    fn request_stop(&self, eid: i64) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE experiment SET status = ?1 WHERE eid = ?2 AND status = ?3",
            params![
                ExperimentStatus::RequestStop.as_str(),
                eid,
                ExperimentStatus::Running.as_str()
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn get_best_result(&self, eid: i64, maximize: bool) -> StoreResult<Option<BestResult>> {
        self.guard()?;
        let conn = self.conn.lock();
        let order = if maximize { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT jid, score FROM job WHERE eid = ?1 AND score IS NOT NULL \
             ORDER BY score {order} LIMIT 1"
        );
        conn.query_row(&sql, params![eid], |row| {
            Ok(BestResult {
                jid: row.get(0)?,
                score: row.get(1)?,
            })
        })
        .optional()
        .map_err(store_err)
    }

    fn log_error_message(&self, eid: i64, msg: &str) -> StoreResult<()> {
        self.guard()?;
        error!(eid, "{msg}");
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO error_log (eid, message, logged_at) VALUES (?1, ?2, ?3)",
            params![eid, msg, Self::now()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn job_started(&self, eid: i64, rid: i64, config: &JobConfig) -> StoreResult<i64> {
        self.guard()?;
        let config_json = serde_json::to_string(config).map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO job (eid, rid, config, status, start_time) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![eid, rid, config_json, JobStatus::Running.as_str(), Self::now()],
        )
        .map_err(store_err)?;
        let jid = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO job_attempt (jid, rid, num, start_time) VALUES (?1, ?2, 1, ?3)",
            params![jid, rid, Self::now()],
        )
        .map_err(store_err)?;
        Ok(jid)
    }

    fn job_failed_attempt(&self, jid: i64) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE job_attempt SET end_time = ?1 \
             WHERE aid = (SELECT MAX(aid) FROM job_attempt WHERE jid = ?2)",
            params![Self::now(), jid],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn job_retry(&self, rid: i64, jid: i64) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        let attempt: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(num), 0) + 1 FROM job_attempt WHERE jid = ?1",
                params![jid],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        conn.execute(
            "INSERT INTO job_attempt (jid, rid, num, start_time) VALUES (?1, ?2, ?3, ?4)",
            params![jid, rid, attempt, Self::now()],
        )
        .map_err(store_err)?;
        conn.execute("UPDATE job SET rid = ?1 WHERE jid = ?2", params![rid, jid])
            .map_err(store_err)?;
        Ok(())
    }

    fn job_finished(
        &self,
        eid: i64,
        jid: i64,
        score: Option<f64>,
        status: JobStatus,
    ) -> StoreResult<()> {
        self.guard()?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE job SET score = ?1, status = ?2, end_time = ?3 \
                 WHERE jid = ?4 AND eid = ?5",
                params![score, status.as_str(), Self::now(), jid, eid],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "job".to_string(),
                id: jid,
            });
        }
        Ok(())
    }

    fn get_running_job(&self, eid: i64) -> StoreResult<Vec<i64>> {
        self.guard()?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT jid FROM job WHERE eid = ?1 AND status = ?2 ORDER BY jid")
            .map_err(store_err)?;
        let jids = stmt
            .query_map(params![eid, JobStatus::Running.as_str()], |row| row.get(0))
            .map_err(store_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(jids)
    }

    fn job_config(&self, jid: i64) -> StoreResult<JobConfig> {
        self.guard()?;
        let conn = self.conn.lock();
        let config_json: Option<String> = conn
            .query_row(
                "SELECT config FROM job WHERE jid = ?1",
                params![jid],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        let config_json = config_json.ok_or(StoreError::NotFound {
            entity: "job".to_string(),
            id: jid,
        })?;
        serde_json::from_str(&config_json).map_err(|e| StoreError::Query {
            message: e.to_string(),
        })
    }

    fn save_intermediate_result(&self, jid: i64, score: f64) -> StoreResult<i64> {
        self.guard()?;
        let conn = self.conn.lock();
        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM intermediate_result WHERE jid = ?1",
                params![jid],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        conn.execute(
            "INSERT INTO intermediate_result (jid, seq, score, recorded_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![jid, seq, score, Self::now()],
        )
        .map_err(store_err)?;
        Ok(seq)
    }

    fn get_intermediate_results_job(&self, jid: i64) -> StoreResult<Vec<f64>> {
        self.guard()?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT score FROM intermediate_result WHERE jid = ?1 ORDER BY seq")
            .map_err(store_err)?;
        let scores = stmt
            .query_map(params![jid], |row| row.get(0))
            .map_err(store_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(scores)
    }

    fn get_intermediate_results_jobs(
        &self,
        jids: &[i64],
    ) -> StoreResult<HashMap<i64, Vec<f64>>> {
        let mut out = HashMap::new();
        for &jid in jids {
            let scores = self.get_intermediate_results_job(jid)?;
            if !scores.is_empty() {
                out.insert(jid, scores);
            }
        }
        Ok(out)
    }

    fn get_intermediate_results_experiment(
        &self,
        eid: i64,
        status: JobStatus,
    ) -> StoreResult<HashMap<i64, Vec<f64>>> {
        self.guard()?;
        let jids: Vec<i64> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT jid FROM job WHERE eid = ?1 AND status = ?2")
                .map_err(store_err)?;
            let jids = stmt
                .query_map(params![eid, status.as_str()], |row| row.get(0))
                .map_err(store_err)?
                .filter_map(|r| r.ok())
                .collect();
            jids
        };
        self.get_intermediate_results_jobs(&jids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConnector::open(dir.path().join("sweep.db")).unwrap();
        let rid = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();
        assert!(rid > 0);
    }

    #[test]
    fn experiment_job_cycle() {
        let store = SqliteConnector::open_in_memory().unwrap();
        let eid = store.start_experiment("user", "{}").unwrap();
        assert_eq!(
            store.experiment_status(eid).unwrap(),
            ExperimentStatus::Running
        );

        let rid = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();
        assert!(store.take_available_resource(rid).unwrap());

        let mut config = JobConfig::new();
        config.set_tid(1);
        let jid = store.job_started(eid, rid, &config).unwrap();
        assert_eq!(store.get_running_job(eid).unwrap(), vec![jid]);
        assert_eq!(store.job_config(jid).unwrap().tid(), Some(1));

        store
            .job_finished(eid, jid, Some(0.7), JobStatus::Finished)
            .unwrap();
        store.free_used_resource(rid).unwrap();
        assert!(store.get_running_job(eid).unwrap().is_empty());

        let best = store.get_best_result(eid, true).unwrap().unwrap();
        assert_eq!(best.jid, jid);
        assert!((best.score - 0.7).abs() < 1e-12);

        store.end_experiment(eid, ExperimentStatus::Finished).unwrap();
        assert_eq!(
            store.experiment_status(eid).unwrap(),
            ExperimentStatus::Finished
        );
    }

    #[test]
    fn take_is_atomic_per_row() {
        let store = SqliteConnector::open_in_memory().unwrap();
        let rid = store.add_resource(ResourceKind::Gpu, "gpu-0").unwrap();
        assert!(store.take_available_resource(rid).unwrap());
        assert!(!store.take_available_resource(rid).unwrap());
    }

    #[test]
    fn retry_attempts_recorded() {
        let store = SqliteConnector::open_in_memory().unwrap();
        let eid = store.start_experiment("user", "{}").unwrap();
        let r0 = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();
        let r1 = store.add_resource(ResourceKind::Cpu, "cpu-1").unwrap();

        let jid = store.job_started(eid, r0, &JobConfig::new()).unwrap();
        store.job_failed_attempt(jid).unwrap();
        store.job_retry(r1, jid).unwrap();

        // job still running, now on r1
        assert_eq!(store.get_running_job(eid).unwrap(), vec![jid]);
    }

    #[test]
    fn intermediate_results_per_experiment_status() {
        let store = SqliteConnector::open_in_memory().unwrap();
        let eid = store.start_experiment("user", "{}").unwrap();
        let rid = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();

        let running = store.job_started(eid, rid, &JobConfig::new()).unwrap();
        let done = store.job_started(eid, rid, &JobConfig::new()).unwrap();
        store.save_intermediate_result(running, 0.1).unwrap();
        store.save_intermediate_result(done, 0.5).unwrap();
        store
            .job_finished(eid, done, Some(0.6), JobStatus::Finished)
            .unwrap();

        let finished = store
            .get_intermediate_results_experiment(eid, JobStatus::Finished)
            .unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[&done], vec![0.5]);
    }

    #[test]
    fn closed_connector_rejects_calls() {
        let store = SqliteConnector::open_in_memory().unwrap();
        store.close();
        match store.start_experiment("user", "{}") {
            Err(StoreError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        assert_eq!(store.maybe_experiment_status(1), None);
    }
}
