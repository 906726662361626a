use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use flagsrv::config;
use flagsrv::context::ServerContext;
use flagsrv::coord;
use flagsrv::db::{FlagSink, PgFlagStore, SinkFactory};
use flagsrv::net::acceptor::{self, MaintSink};
use flagsrv::net::worker::WorkerPool;

/// Flag submission server
#[derive(Parser, Debug)]
#[command(name = "flagsrv")]
#[command(about = "Attack/defense CTF flag submission server", long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(default_value_t = 31337)]
    port: u16,

    /// Number of worker threads
    #[arg(default_value_t = 1)]
    threads: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cfg = config::load()?;
    let ctx = Arc::new(ServerContext::new(&cfg));

    // Table sizes come from the relational store; keep headroom for teams and
    // services registered after startup (the refresh timer grows them too).
    let mut store = PgFlagStore::new(cfg.postgres.url());
    let max_teams = store.max_team_id().context("reading max team id")?.max(0) as u32;
    let max_services = store
        .max_service_id()
        .context("reading max service id")?
        .max(0) as u32;
    ctx.install_model_sizes((max_teams + 2).max(25), (max_services + 1).max(6));

    let listener = acceptor::bind(args.port).with_context(|| format!("binding port {}", args.port))?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    info!("Listening on port {}", args.port);

    let threads = args.threads.max(1);
    info!("Using {} worker threads", threads);
    let pg_url = cfg.postgres.url();
    let make_sink: SinkFactory =
        Arc::new(move || Box::new(PgFlagStore::new(pg_url.clone())) as Box<dyn FlagSink>);
    let pool = WorkerPool::spawn(threads, ctx.clone(), make_sink)?;

    let coordinator = tokio::spawn(coord::run(ctx.clone(), cfg.redis.clone()));

    let maint: MaintSink = Arc::new(Mutex::new(Box::new(store) as Box<dyn FlagSink + Send>));
    let pool = acceptor::run(listener, pool, ctx.clone(), Some(maint)).await?;

    coordinator.abort();
    pool.shutdown();
    acceptor::log_cache_stats(&ctx);
    Ok(())
}
