//! # hs-store
//!
//! Persistent experiment tracking for HyperSweep: the [`Connector`] trait
//! consumed by the scheduling engine, a SQLite implementation for real
//! runs, and an in-memory implementation for tests and passive setups.

mod connector;
mod memory;
mod sqlite;

pub use connector::Connector;
pub use memory::MemoryConnector;
pub use sqlite::SqliteConnector;

use std::sync::Arc;

use hs_types::{ResourceKind, StoreResult};

/// Seed a fresh store with `count` slots of one resource type, named
/// `<type>-<index>`.  Returns the new resource ids.
pub fn seed_resources(
    connector: &Arc<dyn Connector>,
    rtype: ResourceKind,
    count: usize,
) -> StoreResult<Vec<i64>> {
    let mut rids = Vec::with_capacity(count);
    for i in 0..count {
        rids.push(connector.add_resource(rtype, &format!("{rtype}-{i}"))?);
    }
    Ok(rids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_creates_named_slots() {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new());
        let rids = seed_resources(&connector, ResourceKind::Cpu, 3).unwrap();
        assert_eq!(rids.len(), 3);
        let free = connector
            .get_available_resource("user", ResourceKind::Cpu, &[])
            .unwrap();
        assert_eq!(free, rids);
    }
}
