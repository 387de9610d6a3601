//! The network roster (component of C5's policy lookup): a string-keyed,
//! read-only table of `NetworkEntry` loaded once at startup from the
//! relational store, per spec.md §7 "Network roster".
//!
//! Grounded on the teacher's preference for owned, immutable snapshot state
//! (`Zones`/`RecordType` lookups in the deleted `zones.rs`) generalized to
//! `original_source/HashTable.cpp` + `Database.cpp::BuildNetworkTable`'s
//! semantics: a string-keyed table, populated once, read concurrently by
//! every filter-pool worker with no further synchronization.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{MySql, Pool};
use tracing::debug;

use crate::error::DnsProxyError;

/// An immutable roster record: `original_source/HashTable.cpp`'s
/// `NetworkEntry : HashObject` keyed by `net_address` (dotted-quad form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    pub object_id: u64,
    pub owner_id: u64,
    pub net_address: String,
}

/// The roster, loaded once and shared read-only across every task via
/// `Arc`. Lookup is an exact string match on the client's dotted-quad
/// source address, per spec.md §4.4 step 2 — there is no CIDR/longest-prefix
/// matching in this system.
#[derive(Debug, Default)]
pub struct NetworkTable {
    entries: HashMap<String, NetworkEntry>,
}

impl NetworkTable {
    pub fn lookup(&self, net_address: &str) -> Option<&NetworkEntry> {
        self.entries.get(net_address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn insert(&mut self, entry: NetworkEntry) {
        self.entries.insert(entry.net_address.clone(), entry);
    }
}

/// Runs the network-roster query (spec.md §7, query 1) and builds the
/// table. Called once at startup before any listener is bound.
pub async fn build_network_table(pool: &Pool<MySql>) -> Result<Arc<NetworkTable>, DnsProxyError> {
    debug!("building network identification table");

    let rows: Vec<(Option<i64>, Option<i64>, Option<String>)> =
        sqlx::query_as("SELECT object_id, owner_id, net_address FROM user_network")
            .fetch_all(pool)
            .await?;

    let mut entries = HashMap::with_capacity(rows.len());
    for (object_id, owner_id, net_address) in rows {
        let (Some(object_id), Some(owner_id), Some(net_address)) = (object_id, owner_id, net_address)
        else {
            continue;
        };
        entries.insert(
            net_address.clone(),
            NetworkEntry {
                object_id: object_id as u64,
                owner_id: owner_id as u64,
                net_address,
            },
        );
    }

    debug!(entries = entries.len(), "network table built");
    Ok(Arc::new(NetworkTable { entries }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_exact_dotted_quad() {
        let mut table = NetworkTable::default();
        table.insert(NetworkEntry {
            object_id: 7,
            owner_id: 3,
            net_address: "192.168.1.1".to_string(),
        });
        assert!(table.lookup("192.168.1.1").is_some());
        assert!(table.lookup("192.168.1.2").is_none());
    }
}
