//! Coordination client.
//!
//! Subscribes to the key/value store that drives the game: `timing:state`
//! switches the tri-state run mode, `timing:currentRound` advances the round
//! counter. Both are also fetched once per (re)connect so a restart picks up
//! the current values. Connection losses are retried every three seconds,
//! forever - submissions keep running meanwhile on whatever values were seen
//! last.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use tracing::{error, info, warn};

use crate::cache::FlagCache;
use crate::config::RedisConfig;
use crate::context::{GameState, ServerContext};

const STATE_KEY: &str = "timing:state";
const ROUND_KEY: &str = "timing:currentRound";
const CLIENT_NAME: &str = "submission_server";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Flag accounting snapshot for the per-round rate log.
#[derive(Default)]
struct RoundAccounting {
    scored: i64,
    resubmitted: i64,
}

impl RoundAccounting {
    /// Log how many flags the just-completed round brought in, derived from
    /// the cache counters (scored = misses - fails, resubmits = hits + fails).
    fn log_completed_round(&mut self, round: i32, cache: &FlagCache) {
        let scored = cache.misses() - cache.fails();
        let resubmitted = cache.hits() + cache.fails();
        if round > 0 {
            info!(
                "In round {}, {} flags were submitted ({} resubmits)",
                round,
                scored - self.scored,
                resubmitted - self.resubmitted
            );
        }
        self.scored = scored;
        self.resubmitted = resubmitted;
    }
}

/// Keep the context's round and state in sync with the coordination store.
/// Runs on the acceptor's runtime until the process exits.
pub async fn run(ctx: Arc<ServerContext>, cfg: RedisConfig) {
    let mut accounting = RoundAccounting::default();
    loop {
        match watch(&ctx, &cfg, &mut accounting).await {
            Ok(()) => warn!("Coordination connection closed"),
            Err(e) => warn!(error = %e, "Coordination connection failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn watch(
    ctx: &ServerContext,
    cfg: &RedisConfig,
    accounting: &mut RoundAccounting,
) -> Result<()> {
    let client = redis::Client::open(cfg.url())?;

    // AUTH and database selection are part of the connection URL
    let mut con = client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("CLIENT")
        .arg("SETNAME")
        .arg(CLIENT_NAME)
        .query_async(&mut con)
        .await?;

    let state: Option<String> = redis::cmd("GET").arg(STATE_KEY).query_async(&mut con).await?;
    match state.as_deref() {
        Some(state) => apply_state(ctx, state),
        None => info!("State key missing. Did the game already start?"),
    }
    let round: Option<String> = redis::cmd("GET").arg(ROUND_KEY).query_async(&mut con).await?;
    match round.as_deref() {
        Some(round) => apply_round(ctx, accounting, round),
        None => info!("Round key missing. Did the game already start?"),
    }

    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(STATE_KEY).await?;
    pubsub.subscribe(ROUND_KEY).await?;
    info!(host = %cfg.host, "Watching coordination store");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = msg.get_payload()?;
        match msg.get_channel_name() {
            STATE_KEY => apply_state(ctx, &payload),
            ROUND_KEY => apply_round(ctx, accounting, &payload),
            other => warn!(channel = other, "Unexpected subscription message"),
        }
    }
    Ok(())
}

fn apply_state(ctx: &ServerContext, value: &str) {
    match GameState::parse(value) {
        Some(state) => {
            if state != ctx.game_state() {
                ctx.set_game_state(state);
                info!("CTF state: {}", state);
            }
        }
        None => error!(value, "Invalid state"),
    }
}

fn apply_round(ctx: &ServerContext, accounting: &mut RoundAccounting, value: &str) {
    let new_round: i32 = value.trim().parse().unwrap_or(0);
    let old_round = ctx.current_round();
    if new_round != old_round {
        ctx.set_current_round(new_round);
        info!("Current round: {}", new_round);
        accounting.log_completed_round(old_round, &ctx.cache);
    }
}
