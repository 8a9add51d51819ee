//! Watches the store for external stop requests.
//!
//! An operator (or another process) can flip a running experiment to
//! `REQUEST_STOP` through the store; this thread notices and raises the
//! experiment's stop flag, which triggers the same clean suspension as a
//! local interrupt.  The thread winds down once the connector closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use hs_store::Connector;
use hs_types::ExperimentStatus;

pub const DEFAULT_WATCH_PERIOD: Duration = Duration::from_secs(5);

/// Spawn the stop-request watcher for experiment `eid`.
pub fn spawn_status_watcher(
    connector: Arc<dyn Connector>,
    eid: i64,
    stop_flag: Arc<AtomicBool>,
    period: Duration,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("hs-status-watcher".to_string())
        .spawn(move || loop {
            if connector.is_closed() || stop_flag.load(Ordering::SeqCst) {
                debug!(eid, "closing down status watcher");
                return;
            }
            if connector.maybe_experiment_status(eid) == Some(ExperimentStatus::RequestStop) {
                info!(eid, "external stop request received");
                stop_flag.store(true, Ordering::SeqCst);
                return;
            }
            std::thread::sleep(period);
        })
        .expect("failed to spawn status watcher")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_store::MemoryConnector;

    #[test]
    fn raises_flag_on_request_stop() {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
        let eid = connector.start_experiment("user", "{}").unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        let handle = spawn_status_watcher(
            Arc::clone(&connector),
            eid,
            Arc::clone(&flag),
            Duration::from_millis(20),
        );
        connector.request_stop(eid).unwrap();
        handle.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn exits_when_connector_closes() {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
        let eid = connector.start_experiment("user", "{}").unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        let handle = spawn_status_watcher(
            Arc::clone(&connector),
            eid,
            Arc::clone(&flag),
            Duration::from_millis(20),
        );
        connector.close();
        handle.join().unwrap();
        assert!(!flag.load(Ordering::SeqCst));
    }
}
