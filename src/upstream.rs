//! Component C4, the upstream-facing I/O core, grounded on
//! `original_source/ServerNetwork.cpp`. `cfg_PushLocalCount` UDP sockets
//! become a `Vec<Arc<UdpSocket>>` bank indexed by `grid`; `ForwardTCPQuery`'s
//! one-shot outbound connection becomes a spawned task with a
//! `tokio::time::timeout` read instead of an epoll-tracked session.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::dns::MAX_PACKET_SIZE;
use crate::error::DnsProxyError;
use crate::table::OutstandingQuery;

/// Binds the bank of local UDP sockets this proxy forwards queries from,
/// one per `grid` index, per `ServerNetwork::SocketStartup`.
pub async fn bind_push_sockets(ctx: &Context) -> Result<Vec<Arc<UdpSocket>>, DnsProxyError> {
    let forward = &ctx.config.forward;
    let mut sockets = Vec::with_capacity(forward.local_count as usize);

    for i in 0..forward.local_count {
        let bind_addr = SocketAddr::new(IpAddr::V4(forward.local_addr), forward.local_port + i);
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!(%bind_addr, grid = i, "upstream UDP socket bound");
        sockets.push(Arc::new(socket));
    }

    Ok(sockets)
}

/// Runs one receive loop per push socket until `ctx.shutdown` fires.
pub async fn run(ctx: Arc<Context>, push_sockets: Vec<Arc<UdpSocket>>) -> Result<(), DnsProxyError> {
    let mut tasks = JoinSet::new();
    for (grid, socket) in push_sockets.into_iter().enumerate() {
        let task_ctx = ctx.clone();
        tasks.spawn(async move { udp_receive_loop(task_ctx, grid as u16, socket).await });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(?err, "upstream receive task panicked");
        }
    }

    Ok(())
}

async fn udp_receive_loop(ctx: Arc<Context>, grid: u16, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let size = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            res = socket.recv(&mut buf) => match res {
                Ok(v) => v,
                Err(err) => {
                    warn!(grid, ?err, "recv failed on upstream UDP socket");
                    continue;
                }
            },
        };

        if size < 2 {
            continue;
        }

        let slot = u16::from_be_bytes([buf[0], buf[1]]);
        debug!(grid, slot, "upstream received index");

        if ctx.config.logging.server_binary_enabled() {
            debug!(grid, slot, "SERVER UDP:\n{}", crate::logging::hexdump(&buf[..size]));
        }

        attach_and_dispatch(&ctx, grid, slot, buf[..size].to_vec()).await;
    }
}

async fn attach_and_dispatch(ctx: &Arc<Context>, grid: u16, slot: u16, raw_reply: Vec<u8>) {
    if raw_reply.len() < reply_floor(ctx, grid, slot).await {
        warn!(grid, slot, "truncated query response received");
        return;
    }

    if !ctx.table.attach_reply(grid, slot, raw_reply).await {
        return;
    }
    if ctx.reply_tx.send((grid, slot)).await.is_err() {
        warn!(grid, slot, "reply filter pool is gone, dropping work item");
    }
}

/// The minimum acceptable reply size is the size of the query we sent,
/// per `ServerNetwork::ProcessUDPReply`'s `size < local->rawqsize` check.
async fn reply_floor(ctx: &Context, grid: u16, slot: u16) -> usize {
    ctx.table
        .retrieve(grid, slot)
        .await
        .map(|entry| entry.raw_query.len())
        .unwrap_or(0)
}

/// Forwards a query over UDP from `push_sockets[entry.grid]`, per
/// `ServerNetwork::ForwardUDPQuery`: rewrite the ID to `slot`, then send to
/// the configured resolver.
pub async fn forward_udp_query(
    ctx: &Context,
    push_sockets: &[Arc<UdpSocket>],
    entry: &OutstandingQuery,
) -> Result<(), DnsProxyError> {
    let Some(socket) = push_sockets.get(entry.grid as usize) else {
        return Err(DnsProxyError::StartupError(format!(
            "no push socket bound for grid {}",
            entry.grid
        )));
    };

    let mut rewritten = entry.raw_query.clone();
    if rewritten.len() >= 2 {
        rewritten[0..2].copy_from_slice(&entry.slot.to_be_bytes());
    }

    let target = SocketAddr::new(IpAddr::V4(ctx.config.forward.server_addr), ctx.config.forward.server_port);
    debug!(grid = entry.grid, slot = entry.slot, "upstream UDP forwarding index");
    socket.send_to(&rewritten, target).await?;
    Ok(())
}

/// Forwards a query over a one-shot outbound TCP connection, per
/// `ServerNetwork::ForwardTCPQuery`, and spawns a task to await the reply.
pub async fn forward_tcp_query(ctx: Arc<Context>, entry: OutstandingQuery) -> Result<(), DnsProxyError> {
    let local_addr = SocketAddr::new(IpAddr::V4(ctx.config.forward.local_addr), 0);
    let socket = TcpSocket::new_v4()?;
    socket.bind(local_addr)?;

    let target = SocketAddr::new(IpAddr::V4(ctx.config.forward.server_addr), ctx.config.forward.server_port);
    let stream = socket.connect(target).await?;

    let mut rewritten = entry.raw_query.clone();
    if rewritten.len() >= 2 {
        rewritten[0..2].copy_from_slice(&entry.slot.to_be_bytes());
    }

    debug!(grid = entry.grid, slot = entry.slot, "upstream TCP forwarding index");
    tokio::spawn(tcp_forward_and_wait(ctx, stream, entry, rewritten));
    Ok(())
}

async fn tcp_forward_and_wait(ctx: Arc<Context>, mut stream: TcpStream, entry: OutstandingQuery, rewritten: Vec<u8>) {
    let idle_timeout = Duration::from_secs(ctx.config.tcp.session_timeout);

    let mut framed = Vec::with_capacity(rewritten.len() + 2);
    framed.extend_from_slice(&(rewritten.len() as u16).to_be_bytes());
    framed.extend_from_slice(&rewritten);

    if let Err(err) = stream.write_all(&framed).await {
        warn!(?err, grid = entry.grid, slot = entry.slot, "failed writing upstream TCP query");
        return;
    }

    let mut prefix = [0u8; 2];
    if timeout(idle_timeout, stream.read_exact(&mut prefix)).await.is_err() {
        warn!(grid = entry.grid, slot = entry.slot, "upstream TCP reply timed out");
        return;
    }
    let len = u16::from_be_bytes(prefix) as usize;

    let mut body = vec![0u8; len];
    if timeout(idle_timeout, stream.read_exact(&mut body)).await.is_err() {
        warn!(grid = entry.grid, slot = entry.slot, "upstream TCP reply body timed out");
        return;
    }

    if ctx.config.logging.server_binary_enabled() {
        debug!(grid = entry.grid, slot = entry.slot, "SERVER TCP:\n{}", crate::logging::hexdump(&body));
    }

    attach_and_dispatch(&ctx, entry.grid, entry.slot, body).await;
}
