//! Process entry point, grounded on `original_source/dnsproxy.cpp::main`:
//! load config, daemonize unless `-L`, install signal handlers, build every
//! component in order, run until shutdown fires, tear down in reverse order.

use std::process::ExitCode;
use std::sync::Arc;

use sqlx::mysql::MySqlPoolOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dnsfilterd::cli::Cli;
use dnsfilterd::config::ConfigFile;
use dnsfilterd::context::Context;
use dnsfilterd::error::DnsProxyError;
use dnsfilterd::{client, filter, logging, network, table, upstream};

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let mut config = match ConfigFile::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(err) => {
            eprintln!(";; error loading configuration: {err}");
            return ExitCode::from(2);
        }
    };
    cli.apply_overrides(&mut config);

    if !cli.console {
        println!(";; DNS Proxy Filter Server starting");
        match daemonize() {
            Ok(true) => return ExitCode::SUCCESS, // parent: child is away, we're done
            Ok(false) => {}                       // child: keep going
            Err(err) => {
                eprintln!(";; error {err} on fork daemon process");
                return ExitCode::from(2);
            }
        }
    }

    logging::init(cli.debug);
    if cli.console {
        info!("=== running on console, use CTRL+C to terminate ===");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!(";; error building async runtime: {err}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(?err, "fatal startup error");
            ExitCode::from(2)
        }
    }
}

/// Double-forks into the background, per the original's daemonization:
/// the parent prints a confirmation and returns, the child disconnects its
/// std streams from the console. Returns `Ok(true)` in the parent (caller
/// should exit immediately), `Ok(false)` in the child (caller continues).
fn daemonize() -> Result<bool, std::io::Error> {
    let pid = unsafe { libc::fork() };
    if pid > 0 {
        println!(";; Daemon {pid} started successfully\n");
        return Ok(true);
    }
    if pid < 0 {
        return Err(std::io::Error::last_os_error());
    }

    unsafe {
        libc::setsid();
        reopen_to_null(libc::STDIN_FILENO, libc::O_RDONLY)?;
        reopen_to_null(libc::STDOUT_FILENO, libc::O_WRONLY)?;
        reopen_to_null(libc::STDERR_FILENO, libc::O_WRONLY)?;
    }
    Ok(false)
}

unsafe fn reopen_to_null(fd: i32, flags: i32) -> Result<(), std::io::Error> {
    let dev_null = c"/dev/null".as_ptr();
    let null_fd = libc::open(dev_null, flags);
    if null_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if libc::dup2(null_fd, fd) < 0 {
        return Err(std::io::Error::last_os_error());
    }
    libc::close(null_fd);
    Ok(())
}

/// Installs handlers for the original's clean-shutdown signal set
/// (`SIGTERM`/`SIGQUIT`/`SIGINT`) and cancels `shutdown` when any arrives.
/// `SIGSEGV`/`SIGILL`/`SIGFPE` are left to Rust's default abort behavior
/// rather than caught, since there is no equivalent of the original's
/// `g_goodbye = 2` exit-code distinction worth reproducing here.
fn spawn_signal_handlers(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::terminate(), SignalKind::quit(), SignalKind::interrupt()] {
        let shutdown = shutdown.clone();
        let mut stream = match signal(kind) {
            Ok(s) => s,
            Err(err) => {
                error!(?err, "failed installing signal handler");
                continue;
            }
        };
        tokio::spawn(async move {
            stream.recv().await;
            info!("termination signal received, shutting down");
            shutdown.cancel();
        });
    }
}

async fn run(config: ConfigFile) -> Result<(), DnsProxyError> {
    info!(version = env!("CARGO_PKG_VERSION"), "STARTUP DNSProxy");
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect(&database_url(&config))
        .await
        .map_err(|e| DnsProxyError::StartupError(format!("connecting to policy database: {e}")))?;

    let network_table = network::build_network_table(&pool).await?;
    info!(networks = network_table.len(), "network table built");

    let table_handle = table::spawn(config.forward.local_count);

    let (query_tx, query_rx) = mpsc::channel(1024);
    let (reply_tx, reply_rx) = mpsc::channel(1024);

    let ctx = Arc::new(Context {
        config: config.clone(),
        table: table_handle,
        network: network_table,
        pool,
        query_tx,
        reply_tx,
        shutdown: shutdown.clone(),
    });

    let push_sockets = Arc::new(upstream::bind_push_sockets(&ctx).await?);

    tokio::spawn(log_table_stats(ctx.clone()));

    let query_pool = tokio::spawn(filter::run_query_pool(ctx.clone(), push_sockets.clone(), query_rx));
    let reply_pool = tokio::spawn(filter::run_reply_pool(ctx.clone(), reply_rx));
    let server_core = tokio::spawn(upstream::run(ctx.clone(), (*push_sockets).clone()));
    let client_core = tokio::spawn(client::run(ctx.clone()));

    shutdown.cancelled().await;
    info!("shutdown initiated, tearing down components");

    // Reverse construction order: client, server, reply pool, query pool.
    let _ = client_core.await;
    if let Err(err) = server_core.await.unwrap_or(Ok(())) {
        error!(?err, "upstream core exited with an error");
    }
    let _ = reply_pool.await;
    let _ = query_pool.await;

    drop(ctx);
    info!("GOODBYE DNSProxy");
    Ok(())
}

/// Logs `TableStats` once a minute so an operator can see wraparound
/// pressure build (the dirty counter) without a metrics pipeline.
async fn log_table_stats(ctx: Arc<Context>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            _ = tick.tick() => {
                let stats = ctx.table.stats().await;
                info!(live = stats.live_entries, dirty = stats.dirty_count, "table stats");
            }
        }
    }
}

fn database_url(config: &ConfigFile) -> String {
    format!(
        "mysql://{}:{}@{}:{}/{}",
        config.database.username, config.database.password, config.database.hostname, config.database.port, config.database.database
    )
}
