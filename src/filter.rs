//! Component C5, the two filter pools, grounded on
//! `original_source/QueryFilter.cpp`/`ReplyFilter.cpp` and the shared
//! `ThreadPool`/`MessageQueue` base from `dnsproxy.h`.
//!
//! A pool is a fixed work queue (`mpsc`) shared by a growable set of tokio
//! tasks instead of OS threads; `ThreadSaturation`'s "ask the main thread to
//! spin up a worker" becomes spawning the extra task directly, since tokio
//! tasks are cheap enough that the original's indirection through a
//! supervisor message queue buys nothing here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::client;
use crate::context::{Context, WorkItem};
use crate::dns;
use crate::enums::Transport;
use crate::policy::{self, PolicyDecision};
use crate::table::OutstandingQuery;
use crate::upstream;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

/// Runs the query pool until its channel closes or shutdown fires.
/// Mirrors `QueryFilter::ThreadCallback`.
pub async fn run_query_pool(ctx: Arc<Context>, push_sockets: Arc<Vec<Arc<UdpSocket>>>, rx: mpsc::Receiver<WorkItem>) {
    let config = ctx.config.query_filter.clone();
    let shared_rx: SharedReceiver = Arc::new(Mutex::new(rx));
    let busy = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(config.start_threads));

    let mut handles = Vec::with_capacity(config.start_threads);
    for _ in 0..config.start_threads {
        handles.push(tokio::spawn(query_worker(
            ctx.clone(),
            push_sockets.clone(),
            shared_rx.clone(),
            busy.clone(),
            total.clone(),
            config.limit_threads,
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Runs the reply pool until its channel closes or shutdown fires.
/// Mirrors `ReplyFilter::ThreadCallback`.
pub async fn run_reply_pool(ctx: Arc<Context>, rx: mpsc::Receiver<WorkItem>) {
    let config = ctx.config.reply_filter.clone();
    let shared_rx: SharedReceiver = Arc::new(Mutex::new(rx));
    let busy = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(config.start_threads));

    let mut handles = Vec::with_capacity(config.start_threads);
    for _ in 0..config.start_threads {
        handles.push(tokio::spawn(reply_worker(
            ctx.clone(),
            shared_rx.clone(),
            busy.clone(),
            total.clone(),
            config.limit_threads,
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn next_item(ctx: &Context, rx: &SharedReceiver) -> Option<WorkItem> {
    let mut guard = rx.lock().await;
    tokio::select! {
        _ = ctx.shutdown.cancelled() => None,
        item = guard.recv() => item,
    }
}

/// Bumps `busy`; if every existing worker is now busy and the pool hasn't
/// hit its configured ceiling, spawns one more. Mirrors
/// `ThreadPool::ThreadSaturation`'s "ask for a new thread" signal.
fn note_busy_and_maybe_grow<F, Fut>(busy: &Arc<AtomicUsize>, total: &Arc<AtomicUsize>, limit: usize, spawn_more: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let now_busy = busy.fetch_add(1, Ordering::SeqCst) + 1;
    let current_total = total.load(Ordering::SeqCst);
    if now_busy >= current_total && current_total < limit {
        total.fetch_add(1, Ordering::SeqCst);
        info!(workers = current_total + 1, "filter pool grew to {} workers", current_total + 1);
        tokio::spawn(spawn_more());
    }
}

fn query_worker(
    ctx: Arc<Context>,
    push_sockets: Arc<Vec<Arc<UdpSocket>>>,
    rx: SharedReceiver,
    busy: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
    limit: usize,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            let Some((grid, slot)) = next_item(&ctx, &rx).await else {
                return;
            };

            note_busy_and_maybe_grow(&busy, &total, limit, {
                let ctx = ctx.clone();
                let push_sockets = push_sockets.clone();
                let rx = rx.clone();
                let busy = busy.clone();
                let total = total.clone();
                move || query_worker(ctx, push_sockets, rx, busy, total, limit)
            });

            process_query(&ctx, &push_sockets, grid, slot).await;
            busy.fetch_sub(1, Ordering::SeqCst);
        }
    })
}

fn reply_worker(
    ctx: Arc<Context>,
    rx: SharedReceiver,
    busy: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
    limit: usize,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            let Some((grid, slot)) = next_item(&ctx, &rx).await else {
                return;
            };

            note_busy_and_maybe_grow(&busy, &total, limit, {
                let ctx = ctx.clone();
                let rx = rx.clone();
                let busy = busy.clone();
                let total = total.clone();
                move || reply_worker(ctx, rx, busy, total, limit)
            });

            process_reply(&ctx, grid, slot).await;
            busy.fetch_sub(1, Ordering::SeqCst);
        }
    })
}

fn origin_v4_string(origin: SocketAddr) -> Option<String> {
    match origin {
        SocketAddr::V4(v4) => Some(v4.ip().to_string()),
        SocketAddr::V6(_) => None,
    }
}

pub(crate) async fn process_query(ctx: &Arc<Context>, push_sockets: &Arc<Vec<Arc<UdpSocket>>>, grid: u16, slot: u16) {
    debug!(grid, slot, "query filter processing index");

    let Some(entry) = ctx.table.retrieve(grid, slot).await else {
        return;
    };

    let Some(origin_addr) = origin_v4_string(entry.origin) else {
        warn!(grid, slot, "non-IPv4 client origin, blocking");
        block_and_remove(ctx, grid, slot, &entry).await;
        return;
    };

    let Some(network) = ctx.network.lookup(&origin_addr).cloned() else {
        warn!(origin = %origin_addr, "received query from unknown network");
        block_and_remove(ctx, grid, slot, &entry).await;
        return;
    };

    match policy::evaluate(&ctx.pool, &network, &entry.q_name).await {
        Ok(PolicyDecision::Forward) => forward(ctx, push_sockets, entry).await,
        Ok(PolicyDecision::Block) => block_and_remove(ctx, grid, slot, &entry).await,
        Err(err) => {
            error!(?err, "fatal policy store error, shutting down");
            ctx.shutdown.cancel();
            ctx.table.remove(grid, slot);
        }
    }
}

pub(crate) async fn forward(ctx: &Arc<Context>, push_sockets: &Arc<Vec<Arc<UdpSocket>>>, entry: OutstandingQuery) {
    let result = match entry.transport {
        Transport::Udp => upstream::forward_udp_query(ctx, push_sockets, &entry).await,
        Transport::Tcp => upstream::forward_tcp_query(ctx.clone(), entry).await,
    };
    if let Err(err) = result {
        warn!(?err, "failed forwarding query upstream");
    }
}

pub(crate) async fn block_and_remove(ctx: &Arc<Context>, grid: u16, slot: u16, entry: &OutstandingQuery) {
    transmit_block_target(ctx, entry).await;
    ctx.table.remove(grid, slot);
}

/// Builds and sends the synthetic block answer, mirroring
/// `QueryFilter::TransmitBlockTarget`.
pub(crate) async fn transmit_block_target(ctx: &Arc<Context>, entry: &OutstandingQuery) {
    let synthetic_query = crate::dns::ParsedQuery {
        header: crate::dns::Header {
            id: entry.q_id,
            qr: false,
            opcode: 0,
            authoritative: false,
            truncated: false,
            recursion_desired: entry.recursion_desired,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: 0,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        },
        qname: entry.q_name.clone(),
        qname_labels: entry.q_name_labels.clone(),
        qtype: entry.q_type,
        qclass: entry.q_class,
    };

    let reply = match dns::build_block_reply(&synthetic_query, ctx.config.blocking.server_addr) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(?err, "failed building block reply");
            return;
        }
    };

    let mut with_reply = entry.clone();
    with_reply.raw_reply = Some(reply);
    if let Err(err) = client::forward_reply(&with_reply).await {
        warn!(?err, "failed delivering block reply to client");
    }
}

pub(crate) async fn process_reply(ctx: &Arc<Context>, grid: u16, slot: u16) {
    debug!(grid, slot, "reply filter processing index");

    let Some(entry) = ctx.table.retrieve(grid, slot).await else {
        return;
    };

    if let Err(err) = client::forward_reply(&entry).await {
        warn!(?err, grid, slot, "failed delivering reply to client");
    }

    ctx.table.remove(grid, slot);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grows_once_every_worker_is_busy_and_under_limit() {
        let busy = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(2));
        let grew = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let grew = grew.clone();
            note_busy_and_maybe_grow(&busy, &total, 4, move || {
                grew.fetch_add(1, Ordering::SeqCst);
                async {}
            });
        }

        assert_eq!(total.load(Ordering::SeqCst), 3);
        assert_eq!(grew.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_grows_past_the_configured_limit() {
        let busy = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(2));

        for _ in 0..5 {
            note_busy_and_maybe_grow(&busy, &total, 2, || async {});
        }

        assert_eq!(total.load(Ordering::SeqCst), 2);
    }
}
