//! End-to-end integration tests over a real listener.
//!
//! Drives the acceptor, worker pool and connection state machine with mock
//! clients; persistence is an in-memory sink so the tests cover the full
//! submission paths without external stores.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use flagsrv::config::{PostgresConfig, RedisConfig, ServerConfig};
use flagsrv::context::{GameState, ServerContext};
use flagsrv::db::{FlagSink, SinkFactory};
use flagsrv::ipmap::{IpSpec, TeamNets};
use flagsrv::net::acceptor;
use flagsrv::net::worker::WorkerPool;
use flagsrv_proto::constants::{SERVICE_STATUS_PROBE, SERVICE_TEAM_PROBE};
use flagsrv_proto::flag::Flag;

/// In-memory stand-in for the relational store.
#[derive(Default)]
struct MemSink {
    rows: HashSet<(u16, u16, u16, u16, u16)>,
}

impl FlagSink for MemSink {
    fn insert_flag(&mut self, submitter: u16, flag: &Flag, _current_round: i32) -> i32 {
        let row = (submitter, flag.team_id, flag.service_id, flag.round, flag.payload);
        if self.rows.insert(row) {
            1
        } else {
            0
        }
    }

    fn max_team_id(&mut self) -> Result<i32> {
        Ok(30)
    }

    fn max_service_id(&mut self) -> Result<i32> {
        Ok(15)
    }
}

// loopback clients resolve to team 1 under this range
fn test_config() -> ServerConfig {
    ServerConfig {
        flag_prefix: "SAAR".to_string(),
        secret: [b'a'; 32],
        nop_team_id: 0,
        flag_rounds_valid: 10,
        nets: TeamNets {
            team_range: IpSpec::new([(1, 1, 127), (200, 50, 0), (1, 200, 0), (1, 1, 0)], 32),
            vpn_peers: IpSpec::new([(1, 1, 127), (200, 50, 52), (1, 200, 0), (1, 1, 0)], 32),
        },
        postgres: PostgresConfig::default(),
        redis: RedisConfig::default(),
    }
}

async fn spawn_server(state: GameState) -> Result<(SocketAddr, Arc<ServerContext>)> {
    let ctx = Arc::new(ServerContext::new(&test_config()));
    ctx.install_model_sizes(30, 15);
    ctx.set_game_state(state);
    ctx.set_current_round(1337);

    let make_sink: SinkFactory = Arc::new(|| Box::new(MemSink::default()) as Box<dyn FlagSink>);
    let pool = WorkerPool::spawn(2, ctx.clone(), make_sink)?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server_ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = acceptor::run(listener, pool, server_ctx, None).await;
    });

    // give the acceptor time to start
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok((addr, ctx))
}

/// Send `lines` over one connection and collect responses until the server
/// stops sending (or `expected` bytes arrived).
async fn exchange(addr: SocketAddr, lines: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(lines.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8(response)?)
}

#[tokio::test]
async fn malformed_lines_get_canned_answers() -> Result<()> {
    let (addr, _ctx) = spawn_server(GameState::Running).await?;

    assert_eq!(exchange(addr, "tooshort\n").await?, "[ERR] Wrong length\n");
    assert_eq!(
        exchange(addr, "XAAR{OQUHAAwAAAAlt3tF4y_TgZlNX2Yi4hw9}\n").await?,
        "[ERR] Invalid flag (wrong format)\n"
    );
    assert_eq!(
        exchange(addr, "SAAR{!QUHAAwAAAAlt3tF4y_TgZlNX2Yi4hw9}\n").await?,
        "[ERR] Invalid flag (format)\n"
    );
    Ok(())
}

#[tokio::test]
async fn responses_keep_line_order() -> Result<()> {
    let (addr, ctx) = spawn_server(GameState::Running).await?;

    let good = ctx.codec().encode(1337, 7, 12, 1);
    let batch = format!("tooshort\n{good}{good}");
    assert_eq!(
        exchange(addr, &batch).await?,
        "[ERR] Wrong length\n[OK]\n[ERR] Already submitted\n"
    );
    Ok(())
}

#[tokio::test]
async fn empty_lines_produce_empty_responses() -> Result<()> {
    let (addr, _ctx) = spawn_server(GameState::Running).await?;
    assert_eq!(exchange(addr, "\n\ntooshort\n").await?, "[ERR] Wrong length\n");
    Ok(())
}

#[tokio::test]
async fn submissions_are_refused_while_stopped() -> Result<()> {
    let (addr, ctx) = spawn_server(GameState::Stopped).await?;
    let good = ctx.codec().encode(1337, 7, 12, 0);
    assert_eq!(exchange(addr, &good).await?, "[OFFLINE] CTF not running\n");
    Ok(())
}

#[tokio::test]
async fn own_flags_are_recognized_by_source_address() -> Result<()> {
    let (addr, ctx) = spawn_server(GameState::Running).await?;
    // loopback resolves to team 1
    let own = ctx.codec().encode(1337, 1, 12, 0);
    assert_eq!(exchange(addr, &own).await?, "[ERR] This is your own flag\n");
    Ok(())
}

#[tokio::test]
async fn duplicates_are_rejected_across_connections() -> Result<()> {
    let (addr, ctx) = spawn_server(GameState::Running).await?;
    let good = ctx.codec().encode(1337, 7, 12, 2);
    assert_eq!(exchange(addr, &good).await?, "[OK]\n");
    // second connection may land on another worker; the shared cache still
    // catches the resubmit
    assert_eq!(exchange(addr, &good).await?, "[ERR] Already submitted\n");
    Ok(())
}

#[tokio::test]
async fn probes_answer_regardless_of_state() -> Result<()> {
    let (addr, ctx) = spawn_server(GameState::Stopped).await?;

    let team_probe = ctx.codec().encode(1, 0, SERVICE_TEAM_PROBE, 0);
    assert_eq!(exchange(addr, &team_probe).await?, "[OK] You are team 1\n");

    let status_probe = ctx.codec().encode(1, 0, SERVICE_STATUS_PROBE, 0);
    let response = exchange(addr, &status_probe).await?;
    assert!(
        response.starts_with("[OK] Status check passed. submitter=1 "),
        "unexpected response: {response}"
    );
    assert!(response.contains("online_status=1"));
    assert!(response.contains("tick=1337"));
    Ok(())
}

#[tokio::test]
async fn statistics_channel_answers_on_loopback() -> Result<()> {
    let (addr, ctx) = spawn_server(GameState::Running).await?;

    // generate one accepted flag so the reports have content
    let good = ctx.codec().encode(1337, 7, 12, 3);
    assert_eq!(exchange(addr, &good).await?, "[OK]\n");

    let cache = exchange(addr, "statistics cache\n").await?;
    let fields: Vec<&str> = cache.trim_end().split(',').collect();
    assert_eq!(fields.len(), 3, "unexpected cache report: {cache}");
    assert_eq!(cache, "0,1,0\n");

    let connections = exchange(addr, "statistics connections\n").await?;
    assert_eq!(connections.trim_end().split(',').count(), 4);

    let flags = exchange(addr, "statistics flags\n").await?;
    assert_eq!(flags, "team1,1,0,0,0,0,0\n");
    // counters were consumed by the readout
    let flags = exchange(addr, "statistics flags\n").await?;
    assert_eq!(flags, "");
    Ok(())
}

#[tokio::test]
async fn overlong_lines_lose_their_tail_only() -> Result<()> {
    let (addr, _ctx) = spawn_server(GameState::Running).await?;
    // 200 bytes, no inner newline: the first 80 become the line, the rest is
    // dropped; still exactly one response
    let long = format!("{}\n", "x".repeat(200));
    assert_eq!(exchange(addr, &long).await?, "[ERR] Wrong length\n");
    Ok(())
}
