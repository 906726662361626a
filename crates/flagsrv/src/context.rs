//! Process-wide server state.
//!
//! Everything the validator needs is bundled here and shared as one `Arc`:
//! the codec and network ranges are immutable after startup, the round/state
//! words and table limits are atomics the coordination client and the refresh
//! timer update, and readers tolerate one-update staleness.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use tracing::info;

use flagsrv_proto::codec::FlagCodec;

use crate::cache::FlagCache;
use crate::config::ServerConfig;
use crate::ipmap::TeamNets;
use crate::stats::Statistics;
use crate::strpool::StringPool;

/// Sentinel for "submitter team not resolved yet".
pub const TEAM_UNRESOLVED: u16 = 0xFFFF;

/// Game run state as advertised by the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GameState {
    Stopped = 1,
    Suspended = 2,
    Running = 3,
}

impl GameState {
    fn from_u8(value: u8) -> GameState {
        match value {
            2 => GameState::Suspended,
            3 => GameState::Running,
            _ => GameState::Stopped,
        }
    }

    /// Parse the coordination store's wire strings.
    pub fn parse(value: &str) -> Option<GameState> {
        match value {
            "STOPPED" => Some(GameState::Stopped),
            "SUSPENDED" => Some(GameState::Suspended),
            "RUNNING" => Some(GameState::Running),
            _ => None,
        }
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GameState::Stopped => "Stopped",
            GameState::Suspended => "Suspended",
            GameState::Running => "Running",
        })
    }
}

pub struct ServerContext {
    codec: FlagCodec,
    nets: TeamNets,
    nop_team_id: u16,
    flag_rounds_valid: i32,
    current_round: AtomicI32,
    game_state: AtomicU8,
    max_team_id: AtomicU32,
    max_service_id: AtomicU32,
    pub cache: FlagCache,
    pub stats: Statistics,
    answers: StringPool,
}

impl ServerContext {
    pub fn new(cfg: &ServerConfig) -> Self {
        Self {
            codec: FlagCodec::new(&cfg.flag_prefix, cfg.secret),
            nets: cfg.nets.clone(),
            nop_team_id: cfg.nop_team_id,
            flag_rounds_valid: cfg.flag_rounds_valid,
            // -1 until the coordination store tells us otherwise, which
            // keeps the expiry check inactive
            current_round: AtomicI32::new(-1),
            game_state: AtomicU8::new(GameState::Stopped as u8),
            max_team_id: AtomicU32::new(0),
            max_service_id: AtomicU32::new(0),
            cache: FlagCache::new(),
            stats: Statistics::new(),
            answers: StringPool::default(),
        }
    }

    pub fn codec(&self) -> &FlagCodec {
        &self.codec
    }

    pub fn nets(&self) -> &TeamNets {
        &self.nets
    }

    /// 0 means no NOP team is configured.
    pub fn nop_team_id(&self) -> u16 {
        self.nop_team_id
    }

    pub fn flag_rounds_valid(&self) -> i32 {
        self.flag_rounds_valid
    }

    pub fn current_round(&self) -> i32 {
        self.current_round.load(Ordering::Relaxed)
    }

    pub fn set_current_round(&self, round: i32) {
        self.current_round.store(round, Ordering::Relaxed);
    }

    pub fn game_state(&self) -> GameState {
        GameState::from_u8(self.game_state.load(Ordering::Relaxed))
    }

    pub fn set_game_state(&self, state: GameState) {
        self.game_state.store(state as u8, Ordering::Relaxed);
    }

    /// Valid team ids are `[1..max_team_id]`.
    pub fn max_team_id(&self) -> u32 {
        self.max_team_id.load(Ordering::Acquire)
    }

    /// Valid service ids are `[1..max_service_id]` plus the diagnostic probes.
    pub fn max_service_id(&self) -> u32 {
        self.max_service_id.load(Ordering::Acquire)
    }

    /// Publish new table limits and re-create the resubmit cache for them.
    /// Called at startup and whenever the refresh timer sees growth; each
    /// call resets the cache content.
    pub fn install_model_sizes(&self, teams: u32, services: u32) {
        self.max_team_id.store(teams, Ordering::Release);
        self.max_service_id.store(services, Ordering::Release);
        self.cache.resize(teams, services);
        info!("Handling at most {} teams and {} services", teams, services);
    }

    pub fn intern_answer(&self, rendered: String) -> &'static str {
        self.answers.intern(rendered)
    }
}
