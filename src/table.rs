//! The outstanding-query table (component C2): translates between the
//! client's 16-bit query ID and a `(grid, slot)` pair so the proxy can have
//! more than 65536 in-flight queries without aliasing the DNS ID space.
//!
//! Modeled as a single actor task owning the table outright (the same
//! `Command` + `oneshot` pattern the teacher uses for its zone datastore in
//! `datastore.rs`), which gives the single-writer insert invariant from
//! spec.md §4.2 for free: only this task ever touches `grid_cursor`/
//! `slot_cursor`, and every remover goes through the same mailbox so two
//! removers can never race on one cell.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::enums::{RecordClass, RecordType, Transport};

/// Where a reply for this query must be sent back.
#[derive(Clone)]
pub enum ReturnHandle {
    /// The listener socket the datagram arrived on.
    Udp(Arc<UdpSocket>),
    /// A channel into the TCP session task that owns the accepted
    /// connection's write half; sending the length-prefixed reply bytes
    /// here is the async equivalent of "a non-blocking send on an
    /// already-open socket" from spec.md §4.3.
    Tcp(mpsc::UnboundedSender<Vec<u8>>),
}

/// One in-flight query, per spec.md §3.
#[derive(Clone)]
pub struct OutstandingQuery {
    pub origin: SocketAddr,
    pub transport: Transport,
    pub return_handle: ReturnHandle,
    pub grid: u16,
    pub slot: u16,
    /// The exact bytes received from the client. Immutable after insert.
    pub raw_query: Vec<u8>,
    pub q_id: u16,
    pub recursion_desired: bool,
    pub q_name: String,
    /// Decoded labels backing `q_name`, kept so a synthetic block reply can
    /// reuse the same name-compression writer the upstream codec uses.
    pub q_name_labels: Vec<Vec<u8>>,
    pub q_type: RecordType,
    pub q_class: RecordClass,
    /// Set once an answer (upstream or synthetic) is ready to send.
    pub raw_reply: Option<Vec<u8>>,
}

fn cell_index(grid: u16, slot: u16, push_count: u16) -> usize {
    debug_assert!(grid < push_count);
    (grid as usize) * 65536 + (slot as usize)
}

enum Command {
    Insert {
        entry: OutstandingQuery,
        resp: oneshot::Sender<(u16, u16)>,
    },
    Remove {
        grid: u16,
        slot: u16,
    },
    Retrieve {
        grid: u16,
        slot: u16,
        resp: oneshot::Sender<Option<OutstandingQuery>>,
    },
    AttachReply {
        grid: u16,
        slot: u16,
        raw_reply: Vec<u8>,
        resp: oneshot::Sender<bool>,
    },
    Stats {
        resp: oneshot::Sender<TableStats>,
    },
}

/// A point-in-time snapshot of table health, logged periodically.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub live_entries: u64,
    pub dirty_count: u64,
}

/// A cheaply-cloneable handle to the table actor; every component that
/// needs to insert/remove/retrieve holds one of these rather than the
/// table itself.
#[derive(Clone)]
pub struct TableHandle {
    tx: mpsc::UnboundedSender<Command>,
    dirty_count: Arc<AtomicU64>,
}

impl TableHandle {
    /// Assigns `(grid, slot)` to `entry` and stores it, per spec.md §4.2
    /// "Insert". Returns the assigned indices.
    pub async fn insert(&self, entry: OutstandingQuery) -> (u16, u16) {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::Insert { entry, resp }).is_err() {
            return (0, 0);
        }
        rx.await.unwrap_or((0, 0))
    }

    /// Destroys the entry at `(grid, slot)`; a no-op if already empty.
    pub fn remove(&self, grid: u16, slot: u16) {
        let _ = self.tx.send(Command::Remove { grid, slot });
    }

    /// Returns a clone of the entry at `(grid, slot)`, or `None` if the
    /// cell is empty (the benign wraparound-eviction race from spec.md
    /// §4.2).
    pub async fn retrieve(&self, grid: u16, slot: u16) -> Option<OutstandingQuery> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::Retrieve { grid, slot, resp }).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Attaches `raw_reply` to the entry at `(grid, slot)` if it is still
    /// present. Returns whether the entry was found.
    pub async fn attach_reply(&self, grid: u16, slot: u16, raw_reply: Vec<u8>) -> bool {
        let (resp, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::AttachReply {
                grid,
                slot,
                raw_reply,
                resp,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn stats(&self) -> TableStats {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::Stats { resp }).is_err() {
            return TableStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// The "dirty wraparound" counter from spec.md §4.2, readable without a
    /// round trip through the actor mailbox since callers may want it in a
    /// hot path (logging).
    pub fn dirty_count(&self) -> u64 {
        self.dirty_count.load(Ordering::Relaxed)
    }
}

/// Spawns the table actor and returns a handle to it.
pub fn spawn(push_count: u16) -> TableHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let dirty_count = Arc::new(AtomicU64::new(0));
    let dirty_for_actor = dirty_count.clone();
    tokio::spawn(run(rx, push_count, dirty_for_actor));
    TableHandle { tx, dirty_count }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, push_count: u16, dirty_count: Arc<AtomicU64>) {
    let mut cells: Vec<Option<OutstandingQuery>> = vec![None; push_count as usize * 65536];
    let mut grid_cursor: u16 = 0;
    let mut slot_cursor: u16 = 0;
    let mut live: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Insert { mut entry, resp } => {
                let grid = grid_cursor;
                let slot = slot_cursor;
                let idx = cell_index(grid, slot, push_count);

                if cells[idx].is_some() {
                    dirty_count.fetch_add(1, Ordering::Relaxed);
                    debug!(grid, slot, "wraparound collision, evicting prior entry");
                } else {
                    live += 1;
                }

                entry.grid = grid;
                entry.slot = slot;
                trace!(grid, slot, qname = %entry.q_name, "inserted outstanding query");
                cells[idx] = Some(entry);

                slot_cursor = slot_cursor.wrapping_add(1);
                if slot_cursor == 0 {
                    grid_cursor = (grid_cursor + 1) % push_count.max(1);
                }

                let _ = resp.send((grid, slot));
            }
            Command::Remove { grid, slot } => {
                let idx = cell_index(grid, slot, push_count);
                if cells[idx].take().is_some() {
                    live = live.saturating_sub(1);
                }
            }
            Command::Retrieve { grid, slot, resp } => {
                let idx = cell_index(grid, slot, push_count);
                let _ = resp.send(cells[idx].clone());
            }
            Command::AttachReply {
                grid,
                slot,
                raw_reply,
                resp,
            } => {
                let idx = cell_index(grid, slot, push_count);
                let attached = if let Some(entry) = cells[idx].as_mut() {
                    entry.raw_reply = Some(raw_reply);
                    true
                } else {
                    false
                };
                let _ = resp.send(attached);
            }
            Command::Stats { resp } => {
                let _ = resp.send(TableStats {
                    live_entries: live,
                    dirty_count: dirty_count.load(Ordering::Relaxed),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{RecordClass, RecordType, Transport};
    use std::net::SocketAddr;

    fn test_entry(push_count: u16) -> OutstandingQuery {
        let (tx, _rx) = mpsc::unbounded_channel();
        let _ = push_count;
        OutstandingQuery {
            origin: "10.0.0.5:40001".parse::<SocketAddr>().unwrap(),
            transport: Transport::Udp,
            return_handle: ReturnHandle::Tcp(tx),
            grid: 0,
            slot: 0,
            raw_query: vec![0; 20],
            q_id: 0x1234,
            recursion_desired: true,
            q_name: "www.example.com.".to_string(),
            q_name_labels: vec![b"www".to_vec(), b"example".to_vec(), b"com".to_vec()],
            q_type: RecordType::A,
            q_class: RecordClass::Internet,
            raw_reply: None,
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_indices() {
        let table = spawn(2);
        let (g0, s0) = table.insert(test_entry(2)).await;
        let (g1, s1) = table.insert(test_entry(2)).await;
        assert_eq!((g0, s0), (0, 0));
        assert_eq!((g1, s1), (0, 1));
    }

    #[tokio::test]
    async fn retrieve_after_remove_is_none() {
        let table = spawn(1);
        let (grid, slot) = table.insert(test_entry(1)).await;
        assert!(table.retrieve(grid, slot).await.is_some());
        table.remove(grid, slot);
        assert!(table.retrieve(grid, slot).await.is_none());
    }

    #[tokio::test]
    async fn remove_on_empty_cell_is_a_no_op() {
        let table = spawn(1);
        table.remove(5, 5);
        assert!(table.retrieve(5, 5).await.is_none());
    }

    #[tokio::test]
    async fn wraparound_collision_increments_dirty_count() {
        let table = spawn(1);
        for _ in 0..=u16::MAX {
            table.insert(test_entry(1)).await;
        }
        assert_eq!(table.dirty_count(), 0);
        // One more insert wraps slot_cursor back to an occupied cell (0,0).
        table.insert(test_entry(1)).await;
        assert_eq!(table.dirty_count(), 1);
    }

    #[tokio::test]
    async fn attach_reply_on_missing_entry_returns_false() {
        let table = spawn(1);
        assert!(!table.attach_reply(0, 0, vec![1, 2, 3]).await);
    }

    #[tokio::test]
    async fn grid_advances_only_after_slot_wraps() {
        let table = spawn(2);
        let mut last_grid = 0;
        for _ in 0..=u16::MAX {
            let (grid, _slot) = table.insert(test_entry(2)).await;
            last_grid = grid;
        }
        assert_eq!(last_grid, 0);
        let (grid, slot) = table.insert(test_entry(2)).await;
        assert_eq!((grid, slot), (1, 0));
    }
}
