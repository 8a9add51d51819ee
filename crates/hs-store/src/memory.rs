//! In-memory connector for tests and passive runs without a database file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use hs_types::{
    BestResult, ExperimentStatus, JobConfig, JobStatus, ResourceKind, StoreError, StoreResult,
};

use crate::connector::Connector;

#[derive(Debug)]
struct ExperimentRec {
    #[allow(dead_code)]
    username: String,
    #[allow(dead_code)]
    config: String,
    status: ExperimentStatus,
}

#[derive(Debug)]
struct ResourceRec {
    #[allow(dead_code)]
    name: String,
    rtype: ResourceKind,
    free: bool,
}

#[derive(Debug)]
struct JobRec {
    eid: i64,
    rid: i64,
    config: JobConfig,
    score: Option<f64>,
    status: JobStatus,
    attempts: u32,
}

#[derive(Debug, Default)]
struct MemState {
    next_eid: i64,
    next_rid: i64,
    next_jid: i64,
    experiments: HashMap<i64, ExperimentRec>,
    resources: HashMap<i64, ResourceRec>,
    jobs: HashMap<i64, JobRec>,
    interm: HashMap<i64, Vec<f64>>,
    errors: Vec<(i64, String)>,
}

/// Connector keeping every record in process memory.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    state: Mutex<MemState>,
    closed: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Error messages recorded so far, for test assertions.
    pub fn error_messages(&self) -> Vec<String> {
        self.state
            .lock()
            .errors
            .iter()
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl Connector for MemoryConnector {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn add_resource(&self, rtype: ResourceKind, name: &str) -> StoreResult<i64> {
        self.guard()?;
        let mut state = self.state.lock();
        state.next_rid += 1;
        let rid = state.next_rid;
        state.resources.insert(
            rid,
            ResourceRec {
                name: name.to_string(),
                rtype,
                free: true,
            },
        );
        Ok(rid)
    }

    fn get_available_resource(
        &self,
        username: &str,
        rtype: ResourceKind,
        blacklist: &[i64],
    ) -> StoreResult<Vec<i64>> {
        self.guard()?;
        let state = self.state.lock();
        let mut rids: Vec<i64> = state
            .resources
            .iter()
            .filter(|(rid, rec)| rec.free && rec.rtype == rtype && !blacklist.contains(rid))
            .map(|(rid, _)| *rid)
            .collect();
        rids.sort_unstable();
        debug!(user = username, %rtype, ?rids, "available resources");
        Ok(rids)
    }

    fn take_available_resource(&self, rid: i64) -> StoreResult<bool> {
        self.guard()?;
        let mut state = self.state.lock();
        match state.resources.get_mut(&rid) {
            Some(rec) if rec.free => {
                rec.free = false;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "resource".to_string(),
                id: rid,
            }),
        }
    }

    fn free_used_resource(&self, rid: i64) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.lock();
        match state.resources.get_mut(&rid) {
            Some(rec) => {
                rec.free = true;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "resource".to_string(),
                id: rid,
            }),
        }
    }

    fn free_all_resources(&self) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.lock();
        for rec in state.resources.values_mut() {
            rec.free = true;
        }
        Ok(())
    }

    fn create_experiment(&self, username: &str, config_json: &str) -> StoreResult<i64> {
        self.guard()?;
        let mut state = self.state.lock();
        state.next_eid += 1;
        let eid = state.next_eid;
        state.experiments.insert(
            eid,
            ExperimentRec {
                username: username.to_string(),
                config: config_json.to_string(),
                status: ExperimentStatus::Created,
            },
        );
        Ok(eid)
    }

    fn start_experiment(&self, username: &str, config_json: &str) -> StoreResult<i64> {
        let eid = self.create_experiment(username, config_json)?;
        self.start_experiment_by_eid(eid)?;
        Ok(eid)
    }

    fn start_experiment_by_eid(&self, eid: i64) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.lock();
        let rec = state
            .experiments
            .get_mut(&eid)
            .ok_or(StoreError::NotFound {
                entity: "experiment".to_string(),
                id: eid,
            })?;
        rec.status = ExperimentStatus::Running;
        Ok(())
    }

    fn end_experiment(&self, eid: i64, status: ExperimentStatus) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.lock();
        let rec = state
            .experiments
            .get_mut(&eid)
            .ok_or(StoreError::NotFound {
                entity: "experiment".to_string(),
                id: eid,
            })?;
        rec.status = status;
        Ok(())
    }

    fn experiment_status(&self, eid: i64) -> StoreResult<ExperimentStatus> {
        self.guard()?;
        let state = self.state.lock();
        state
            .experiments
            .get(&eid)
            .map(|rec| rec.status)
            .ok_or(StoreError::NotFound {
                entity: "experiment".to_string(),
                id: eid,
            })
    }

    fn request_stop(&self, eid: i64) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.lock();
        let rec = state
            .experiments
            .get_mut(&eid)
            .ok_or(StoreError::NotFound {
                entity: "experiment".to_string(),
                id: eid,
            })?;
        if rec.status == ExperimentStatus::Running {
            rec.status = ExperimentStatus::RequestStop;
        }
        Ok(())
    }

    fn get_best_result(&self, eid: i64, maximize: bool) -> StoreResult<Option<BestResult>> {
        self.guard()?;
        let state = self.state.lock();
        let best = state
            .jobs
            .iter()
            .filter(|(_, job)| job.eid == eid)
            .filter_map(|(jid, job)| job.score.map(|score| (*jid, score)))
            .max_by(|a, b| {
                let ordering = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                if maximize {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        Ok(best.map(|(jid, score)| BestResult { jid, score }))
    }

    fn log_error_message(&self, eid: i64, msg: &str) -> StoreResult<()> {
        self.guard()?;
        error!(eid, "{msg}");
        self.state.lock().errors.push((eid, msg.to_string()));
        Ok(())
    }

    fn job_started(&self, eid: i64, rid: i64, config: &JobConfig) -> StoreResult<i64> {
        self.guard()?;
        let mut state = self.state.lock();
        state.next_jid += 1;
        let jid = state.next_jid;
        state.jobs.insert(
            jid,
            JobRec {
                eid,
                rid,
                config: config.clone(),
                score: None,
                status: JobStatus::Running,
                attempts: 1,
            },
        );
        Ok(jid)
    }

    fn job_failed_attempt(&self, jid: i64) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.lock();
        state
            .jobs
            .get_mut(&jid)
            .map(|_| ())
            .ok_or(StoreError::NotFound {
                entity: "job".to_string(),
                id: jid,
            })
    }

    fn job_retry(&self, rid: i64, jid: i64) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&jid).ok_or(StoreError::NotFound {
            entity: "job".to_string(),
            id: jid,
        })?;
        job.rid = rid;
        job.attempts += 1;
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
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&jid).ok_or(StoreError::NotFound {
            entity: "job".to_string(),
            id: jid,
        })?;
        debug_assert_eq!(job.eid, eid);
        job.score = score;
        job.status = status;
        Ok(())
    }

    fn get_running_job(&self, eid: i64) -> StoreResult<Vec<i64>> {
        self.guard()?;
        let state = self.state.lock();
        let mut jids: Vec<i64> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.eid == eid && job.status == JobStatus::Running)
            .map(|(jid, _)| *jid)
            .collect();
        jids.sort_unstable();
        Ok(jids)
    }

    fn job_config(&self, jid: i64) -> StoreResult<JobConfig> {
        self.guard()?;
        let state = self.state.lock();
        state
            .jobs
            .get(&jid)
            .map(|job| job.config.clone())
            .ok_or(StoreError::NotFound {
                entity: "job".to_string(),
                id: jid,
            })
    }

    fn save_intermediate_result(&self, jid: i64, score: f64) -> StoreResult<i64> {
        self.guard()?;
        let mut state = self.state.lock();
        let series = state.interm.entry(jid).or_default();
        series.push(score);
        Ok(series.len() as i64)
    }

    fn get_intermediate_results_job(&self, jid: i64) -> StoreResult<Vec<f64>> {
        self.guard()?;
        Ok(self.state.lock().interm.get(&jid).cloned().unwrap_or_default())
    }

    fn get_intermediate_results_jobs(
        &self,
        jids: &[i64],
    ) -> StoreResult<HashMap<i64, Vec<f64>>> {
        self.guard()?;
        let state = self.state.lock();
        Ok(jids
            .iter()
            .filter_map(|jid| state.interm.get(jid).map(|v| (*jid, v.clone())))
            .collect())
    }

    fn get_intermediate_results_experiment(
        &self,
        eid: i64,
        status: JobStatus,
    ) -> StoreResult<HashMap<i64, Vec<f64>>> {
        self.guard()?;
        let state = self.state.lock();
        Ok(state
            .jobs
            .iter()
            .filter(|(_, job)| job.eid == eid && job.status == status)
            .filter_map(|(jid, _)| state.interm.get(jid).map(|v| (*jid, v.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn resource_claim_cycle() {
        let store = MemoryConnector::new();
        let rid = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();

        let free = store
            .get_available_resource("user", ResourceKind::Cpu, &[])
            .unwrap();
        assert_eq!(free, vec![rid]);

        assert!(store.take_available_resource(rid).unwrap());
        assert!(!store.take_available_resource(rid).unwrap()); // already busy
        assert!(store
            .get_available_resource("user", ResourceKind::Cpu, &[])
            .unwrap()
            .is_empty());

        store.free_used_resource(rid).unwrap();
        assert!(store.take_available_resource(rid).unwrap());
    }

    #[test]
    fn blacklist_filters_resources() {
        let store = MemoryConnector::new();
        let a = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();
        let b = store.add_resource(ResourceKind::Cpu, "cpu-1").unwrap();

        let free = store
            .get_available_resource("user", ResourceKind::Cpu, &[a])
            .unwrap();
        assert_eq!(free, vec![b]);
    }

    #[test]
    fn concurrent_take_admits_exactly_one_winner() {
        let store = Arc::new(MemoryConnector::new());
        let rid = store.add_resource(ResourceKind::Gpu, "gpu-0").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.take_available_resource(rid).unwrap())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|taken| *taken)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn best_result_respects_direction() {
        let store = MemoryConnector::new();
        let eid = store.start_experiment("user", "{}").unwrap();
        let rid = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();

        let a = store.job_started(eid, rid, &JobConfig::new()).unwrap();
        let b = store.job_started(eid, rid, &JobConfig::new()).unwrap();
        store
            .job_finished(eid, a, Some(0.3), JobStatus::Finished)
            .unwrap();
        store
            .job_finished(eid, b, Some(0.9), JobStatus::Finished)
            .unwrap();

        let best = store.get_best_result(eid, true).unwrap().unwrap();
        assert_eq!(best.jid, b);
        let worst = store.get_best_result(eid, false).unwrap().unwrap();
        assert_eq!(worst.jid, a);
    }

    #[test]
    fn running_jobs_listed_until_finished() {
        let store = MemoryConnector::new();
        let eid = store.start_experiment("user", "{}").unwrap();
        let rid = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();

        let a = store.job_started(eid, rid, &JobConfig::new()).unwrap();
        let b = store.job_started(eid, rid, &JobConfig::new()).unwrap();
        assert_eq!(store.get_running_job(eid).unwrap(), vec![a, b]);

        store
            .job_finished(eid, a, Some(1.0), JobStatus::Finished)
            .unwrap();
        assert_eq!(store.get_running_job(eid).unwrap(), vec![b]);
    }

    #[test]
    fn intermediate_results_sequence() {
        let store = MemoryConnector::new();
        let eid = store.start_experiment("user", "{}").unwrap();
        let rid = store.add_resource(ResourceKind::Cpu, "cpu-0").unwrap();
        let jid = store.job_started(eid, rid, &JobConfig::new()).unwrap();

        assert_eq!(store.save_intermediate_result(jid, 0.1).unwrap(), 1);
        assert_eq!(store.save_intermediate_result(jid, 0.2).unwrap(), 2);
        assert_eq!(
            store.get_intermediate_results_job(jid).unwrap(),
            vec![0.1, 0.2]
        );
    }

    #[test]
    fn closed_connector_rejects_calls() {
        let store = MemoryConnector::new();
        store.close();
        assert!(store.is_closed());
        match store.add_resource(ResourceKind::Cpu, "cpu-0") {
            Err(StoreError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn request_stop_only_running_experiments() {
        let store = MemoryConnector::new();
        let eid = store.create_experiment("user", "{}").unwrap();
        store.request_stop(eid).unwrap();
        assert_eq!(
            store.experiment_status(eid).unwrap(),
            ExperimentStatus::Created
        );

        store.start_experiment_by_eid(eid).unwrap();
        store.request_stop(eid).unwrap();
        assert_eq!(
            store.experiment_status(eid).unwrap(),
            ExperimentStatus::RequestStop
        );
    }
}
