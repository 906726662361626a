//! The accept loop.
//!
//! Owns the listening socket, the termination signals and the two periodic
//! jobs: the 10-minute cache statistics dump and the 1-minute refresh that
//! re-reads the table sizes from the relational store, growing the resubmit
//! cache when teams or services were added.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::db::FlagSink;
use crate::net::worker::WorkerPool;
use crate::stats;

const LISTEN_BACKLOG: i32 = 5;
const STATS_DUMP_INTERVAL: Duration = Duration::from_secs(600);
const MODEL_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Persistence handle used by the refresh timer, separate from the workers'.
pub type MaintSink = Arc<Mutex<Box<dyn FlagSink + Send>>>;

/// Open the wildcard listener: `SO_REUSEADDR`, small backlog, non-blocking.
pub fn bind(port: u16) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("creating listener socket")?;
    socket
        .set_reuse_address(true)
        .context("setsockopt(SO_REUSEADDR)")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into()).context("bind")?;
    socket.listen(LISTEN_BACKLOG).context("listen")?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Run the accept loop until SIGINT or SIGTERM. Returns the pool so the
/// caller can join the workers.
pub async fn run(
    listener: TcpListener,
    mut pool: WorkerPool,
    ctx: Arc<ServerContext>,
    maint: Option<MaintSink>,
) -> Result<WorkerPool> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stats_timer = time::interval(STATS_DUMP_INTERVAL);
    stats_timer.tick().await;
    let mut refresh_timer = time::interval(MODEL_REFRESH_INTERVAL);
    refresh_timer.tick().await;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => pool.dispatch(stream, peer).await,
                Err(e) => warn!(error = %e, "accept error"),
            },
            _ = &mut ctrl_c => {
                info!("Terminating...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Terminating...");
                break;
            }
            _ = stats_timer.tick() => log_cache_stats(&ctx),
            _ = refresh_timer.tick() => {
                if let Some(maint) = &maint {
                    refresh_model_sizes(ctx.clone(), maint.clone()).await;
                }
            }
        }
    }

    Ok(pool)
}

/// Re-read the table sizes; on growth, publish them and re-create the cache.
/// Also reports descriptor pressure.
async fn refresh_model_sizes(ctx: Arc<ServerContext>, maint: MaintSink) {
    let result = tokio::task::spawn_blocking(move || {
        let (db_teams, db_services) = {
            let mut sink = maint.lock();
            (sink.max_team_id()?, sink.max_service_id()?)
        };

        let current_teams = ctx.max_team_id();
        let current_services = ctx.max_service_id();
        let teams = current_teams.max(db_teams.max(0) as u32 + 1);
        let services = current_services.max(db_services.max(0) as u32);
        if teams > current_teams || services > current_services {
            info!("Number of teams/services changed");
            ctx.install_model_sizes(teams, services);
        }

        debug!(
            fd_open = stats::open_fd_count(),
            fd_limit = stats::fd_limit(),
            "descriptor usage"
        );
        anyhow::Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "model size refresh failed"),
        Err(e) => warn!(error = %e, "model size refresh task failed"),
    }
}

/// Dump resubmit cache counters, as the 10-minute timer and shutdown do.
pub fn log_cache_stats(ctx: &ServerContext) {
    let hits = ctx.cache.hits();
    let misses = ctx.cache.misses();
    let fails = ctx.cache.fails();
    info!(hits, misses, fails, "flag cache statistics");

    let all = hits + misses + fails;
    if all > 0 {
        info!(
            "Resubmits: {:.1}%",
            (hits + fails) as f64 * 100.0 / all as f64
        );
    }
    if hits + fails > 0 {
        info!(
            "Cached resubmits: {:.1}%",
            hits as f64 * 100.0 / (hits + fails) as f64
        );
    }
}
