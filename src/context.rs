//! The shared bundle every task needs, replacing the original's `g_*`
//! globals (`g_table`, `g_network`, `g_database`, `cfg_*`) with one value
//! constructed once in `main` and cloned cheaply into every task, per
//! spec.md §9's "no global singletons" design note.

use std::sync::Arc;

use sqlx::{MySql, Pool};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigFile;
use crate::network::NetworkTable;
use crate::table::TableHandle;

/// A `(grid, slot)` pair identifying an outstanding query, pushed onto a
/// filter pool's work queue. Mirrors `original_source/dnsproxy.h`'s
/// `ProxyMessage`.
pub type WorkItem = (u16, u16);

pub struct Context {
    pub config: Arc<ConfigFile>,
    pub table: TableHandle,
    pub network: Arc<NetworkTable>,
    pub pool: Pool<MySql>,
    pub query_tx: mpsc::Sender<WorkItem>,
    pub reply_tx: mpsc::Sender<WorkItem>,
    pub shutdown: CancellationToken,
}
