//! Component C3, the client-facing I/O core, grounded on
//! `original_source/ClientNetwork.cpp`. The `epoll_wait` dispatch loop
//! becomes a `tokio::select!`/spawned-task tree; the index-linked TCP
//! session list and its one-second sweep become one task per accepted
//! connection guarded by `tokio::time::timeout`, the same pattern the
//! teacher uses in `servers.rs::tcp_conn_handler`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::dns::{self, ParsedQuery};
use crate::enums::Transport;
use crate::error::DnsProxyError;
use crate::interfaces;
use crate::table::{OutstandingQuery, ReturnHandle};

const MIN_QUERY_SIZE: usize = 17;

/// Enumerates interfaces, binds a UDP socket and TCP listener on each, and
/// runs until `ctx.shutdown` fires. Mirrors
/// `ClientNetwork::ThreadWorker`/`SocketStartup`.
pub async fn run(ctx: Arc<Context>) -> Result<(), DnsProxyError> {
    let addrs = interfaces::enumerate_ipv4(&ctx.config.net_filter)?;
    if addrs.is_empty() {
        return Err(DnsProxyError::StartupError(
            "no eligible IPv4 interfaces to bind the client listeners on".to_string(),
        ));
    }

    let port = ctx.config.general.server_port;
    let mut tasks = JoinSet::new();

    for addr in addrs {
        let bind_addr = SocketAddr::new(IpAddr::V4(addr), port);

        let udp = UdpSocket::bind(bind_addr).await?;
        info!(%bind_addr, "client UDP listener bound");
        let udp_ctx = ctx.clone();
        tasks.spawn(async move { udp_loop(udp_ctx, Arc::new(udp)).await });

        let tcp = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "client TCP listener bound");
        let tcp_ctx = ctx.clone();
        tasks.spawn(async move { tcp_accept_loop(tcp_ctx, tcp).await });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(?err, "client listener task panicked");
        }
    }

    Ok(())
}

async fn udp_loop(ctx: Arc<Context>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; dns::MAX_PACKET_SIZE];
    loop {
        let (size, origin) = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(err) => {
                    warn!(?err, "recvfrom failed on client UDP socket");
                    continue;
                }
            },
        };

        if size < MIN_QUERY_SIZE {
            warn!(%origin, size, "incomplete UDP query received");
            continue;
        }

        let raw_query = buf[..size].to_vec();
        let parsed = match dns::parse_query(&raw_query) {
            Ok(p) => p,
            Err(err) => {
                warn!(%origin, ?err, "invalid UDP query received");
                continue;
            }
        };

        if ctx.config.logging.client_binary_enabled() {
            debug!(%origin, "CLIENT UDP:\n{}", crate::logging::hexdump(&raw_query));
        }

        insert_and_dispatch(&ctx, origin, Transport::Udp, ReturnHandle::Udp(socket.clone()), raw_query, parsed)
            .await;
    }
}

/// Accepts connections up to `ctx.config.tcp.session_limit` live sessions on
/// this listener. Mirrors `ClientNetwork::ProcessTCPAccept`'s
/// `if (tcpcount == cfg_SessionLimit) return(0);` — once at capacity the
/// loop stops polling `accept()` and waits for a session to close instead.
async fn tcp_accept_loop(ctx: Arc<Context>, listener: TcpListener) {
    let limit = ctx.config.tcp.session_limit as usize;
    let session_count = Arc::new(AtomicUsize::new(0));

    loop {
        if session_count.load(Ordering::SeqCst) >= limit {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
            }
        }

        let (stream, origin) = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(err) => {
                    warn!(?err, "accept failed on client TCP listener");
                    continue;
                }
            },
        };

        debug!(%origin, "client TCP connect");
        session_count.fetch_add(1, Ordering::SeqCst);
        let session_ctx = ctx.clone();
        let session_count = session_count.clone();
        tokio::spawn(async move {
            tcp_session(session_ctx, stream, origin).await;
            session_count.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// One accepted TCP connection: a two-phase length-prefixed read loop with
/// an idle timeout, and a writer fed by a channel so replies arriving from
/// the filter pipeline (on other tasks) can be written back without
/// fighting over the stream's write half. Mirrors
/// `ClientNetwork::ProcessTCPQuery`/`ForwardTCPReply`.
async fn tcp_session(ctx: Arc<Context>, stream: TcpStream, origin: SocketAddr) {
    let idle_timeout = Duration::from_secs(ctx.config.tcp.session_timeout);
    let (mut read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(err) = write_half.write_all(&reply).await {
                warn!(?err, "failed writing TCP reply to client");
                break;
            }
        }
    });

    loop {
        let prefix = match read_exact_timeout(&mut read_half, 2, idle_timeout).await {
            Some(buf) => u16::from_be_bytes([buf[0], buf[1]]) as usize,
            None => break,
        };

        let body = match read_exact_timeout(&mut read_half, prefix, idle_timeout).await {
            Some(buf) => buf,
            None => break,
        };

        if body.len() < MIN_QUERY_SIZE {
            warn!(%origin, size = body.len(), "incomplete TCP query received");
            break;
        }

        let parsed = match dns::parse_query(&body) {
            Ok(p) => p,
            Err(err) => {
                warn!(%origin, ?err, "invalid TCP query received");
                break;
            }
        };

        if ctx.config.logging.client_binary_enabled() {
            debug!(%origin, "CLIENT TCP:\n{}", crate::logging::hexdump(&body));
        }

        insert_and_dispatch(&ctx, origin, Transport::Tcp, ReturnHandle::Tcp(reply_tx.clone()), body, parsed).await;
    }

    drop(reply_tx);
    let _ = writer.await;
    debug!(%origin, "client TCP session closed");
}

async fn read_exact_timeout(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    len: usize,
    idle_timeout: Duration,
) -> Option<Vec<u8>> {
    if len == 0 {
        return Some(Vec::new());
    }
    let mut buf = vec![0u8; len];
    match timeout(idle_timeout, read_half.read_exact(&mut buf)).await {
        Ok(Ok(_)) => Some(buf),
        Ok(Err(_)) | Err(_) => None,
    }
}

async fn insert_and_dispatch(
    ctx: &Arc<Context>,
    origin: SocketAddr,
    transport: Transport,
    return_handle: ReturnHandle,
    raw_query: Vec<u8>,
    parsed: ParsedQuery,
) {
    let entry = OutstandingQuery {
        origin,
        transport,
        return_handle,
        grid: 0,
        slot: 0,
        raw_query,
        q_id: parsed.header.id,
        recursion_desired: parsed.header.recursion_desired,
        q_name: parsed.qname,
        q_name_labels: parsed.qname_labels,
        q_type: parsed.qtype,
        q_class: parsed.qclass,
        raw_reply: None,
    };

    let (grid, slot) = ctx.table.insert(entry).await;
    debug!(grid, slot, "client created index");
    if ctx.query_tx.send((grid, slot)).await.is_err() {
        warn!(grid, slot, "query filter pool is gone, dropping work item");
    }
}

/// Sends a reply back on the transport/socket it arrived on. Mirrors
/// `ClientNetwork::ForwardUDPReply`/`ForwardTCPReply`: overwrite the first
/// two bytes of the reply with the original client-facing query ID, then
/// write it out.
pub async fn forward_reply(entry: &OutstandingQuery) -> Result<(), DnsProxyError> {
    let Some(raw_reply) = entry.raw_reply.as_ref() else {
        return Err(DnsProxyError::MalformedQuery(
            "forward_reply called with no raw_reply attached".to_string(),
        ));
    };

    let mut reply = raw_reply.clone();
    if reply.len() >= 2 {
        reply[0..2].copy_from_slice(&entry.q_id.to_be_bytes());
    }

    match &entry.return_handle {
        ReturnHandle::Udp(socket) => {
            socket.send_to(&reply, entry.origin).await?;
        }
        ReturnHandle::Tcp(tx) => {
            let mut framed = Vec::with_capacity(reply.len() + 2);
            framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            framed.extend_from_slice(&reply);
            let _ = tx.send(framed);
        }
    }

    debug!(grid = entry.grid, slot = entry.slot, "client returned index");
    Ok(())
}
