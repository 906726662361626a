//! The flag validation pipeline.
//!
//! Consumes one submission line and produces exactly one response string.
//! The check order is part of the external contract: length and envelope
//! first, then run state, submitter resolution, semantic bounds, MAC,
//! diagnostic probes, resubmit cache and finally persistence.

use std::net::IpAddr;

use tracing::warn;

use flagsrv_proto::codec::rtrim;
use flagsrv_proto::constants::{SERVICE_STATUS_PROBE, SERVICE_TEAM_PROBE};
use flagsrv_proto::error::FlagError;
use flagsrv_proto::flag::Flag;

use crate::context::{GameState, ServerContext, TEAM_UNRESOLVED};
use crate::db::FlagSink;
use crate::stats::FlagCategory;

/// Validate one line and return the response to send back.
///
/// `team_cache` carries the connection's resolved submitter team across
/// lines; pass `None` for one-shot lookups.
pub fn process_line(
    line: &[u8],
    peer: IpAddr,
    team_cache: Option<&mut u16>,
    ctx: &ServerContext,
    sink: &mut dyn FlagSink,
) -> &'static str {
    let line = rtrim(line);
    if line.is_empty() {
        return "";
    }

    let flag = match ctx.codec().decode(line) {
        Ok(flag) => flag,
        Err(FlagError::WrongLength(_)) => return "[ERR] Wrong length\n",
        Err(FlagError::BadEnvelope) => return "[ERR] Invalid flag (wrong format)\n",
        Err(FlagError::BadPayload) => return "[ERR] Invalid flag (format)\n",
    };

    if ctx.game_state() != GameState::Running && !flag.is_diagnostic() {
        return "[OFFLINE] CTF not running\n";
    }

    let mut submitter = match team_cache {
        Some(cached) => {
            if *cached == TEAM_UNRESOLVED {
                *cached = resolve_submitter(ctx, peer);
            }
            *cached
        }
        None => resolve_submitter(ctx, peer),
    };
    if submitter == 0 || submitter as u32 > ctx.max_team_id() {
        warn!(%peer, "Connection from invalid IP");
        if flag.is_diagnostic() {
            submitter = TEAM_UNRESOLVED;
        } else {
            return "[ERR] Invalid source IP\n";
        }
    }

    if !flag.is_diagnostic() {
        if flag.service_id as u32 > ctx.max_service_id() {
            ctx.stats.count_flag(submitter, FlagCategory::Invalid);
            return "[ERR] Invalid flag (service)\n";
        }
        if flag.team_id as u32 > ctx.max_team_id() {
            ctx.stats.count_flag(submitter, FlagCategory::Invalid);
            return "[ERR] Invalid flag (team)\n";
        }
        let nop = ctx.nop_team_id();
        if nop != 0 && flag.team_id == nop {
            ctx.stats.count_flag(submitter, FlagCategory::Nop);
            return "[ERR] Can't submit flag from NOP team\n";
        }
        if flag.is_test_issued() {
            ctx.stats.count_flag(submitter, FlagCategory::Invalid);
            return "[ERR] Invalid flag (issued for testing purposes)\n";
        }
        if submitter == flag.team_id {
            ctx.stats.count_flag(submitter, FlagCategory::Own);
            return "[ERR] This is your own flag\n";
        }
        if nop != 0 && submitter == nop {
            ctx.stats.count_flag(submitter, FlagCategory::Nop);
            return "[ERR] Can't submit flag as NOP team\n";
        }
        // round issued + validity window is the last round a flag scores in
        if flag.round as i32 + ctx.flag_rounds_valid() < ctx.current_round() {
            ctx.stats.count_flag(submitter, FlagCategory::Expired);
            return "[ERR] Expired\n";
        }
    }

    if !ctx.codec().verify(&flag) {
        ctx.stats.count_flag(submitter, FlagCategory::Invalid);
        return "[ERR] Invalid flag\n";
    }

    if flag.is_diagnostic() {
        return answer_probe(ctx, &flag, submitter);
    }

    if !ctx
        .cache
        .check(submitter, flag.team_id, flag.service_id, flag.round, flag.payload)
    {
        ctx.stats.count_flag(submitter, FlagCategory::Old);
        return "[ERR] Already submitted\n";
    }

    let inserted = sink.insert_flag(submitter, &flag, ctx.current_round());
    if inserted < 0 {
        return "[ERR] Internal error (database)\n";
    }
    if inserted == 0 {
        // the cache missed a duplicate the store knew about
        ctx.cache.record_failed();
        ctx.stats.count_flag(submitter, FlagCategory::Old);
        return "[ERR] Already submitted\n";
    }
    ctx.stats.count_flag(submitter, FlagCategory::New);
    "[OK]\n"
}

fn resolve_submitter(ctx: &ServerContext, peer: IpAddr) -> u16 {
    match ipv4_octets(peer) {
        Some(octets) => ctx.nets().team_id_from_ip(octets),
        None => 0,
    }
}

/// The peer's IPv4 address is the sole identity input; plain IPv6 peers
/// resolve to "unknown".
pub fn ipv4_octets(ip: IpAddr) -> Option<[u8; 4]> {
    match ip {
        IpAddr::V4(v4) => Some(v4.octets()),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(|v4| v4.octets()),
    }
}

fn answer_probe(ctx: &ServerContext, flag: &Flag, submitter: u16) -> &'static str {
    match flag.service_id {
        SERVICE_STATUS_PROBE => ctx.intern_answer(format!(
            "[OK] Status check passed. submitter={} max_team_id={} max_service_id={} \
             online_status={} tick={} nop_team_id={}\n",
            submitter,
            ctx.max_team_id(),
            ctx.max_service_id(),
            ctx.game_state() as u8,
            ctx.current_round(),
            ctx.nop_team_id()
        )),
        SERVICE_TEAM_PROBE => ctx.intern_answer(format!("[OK] You are team {}\n", submitter)),
        _ => "[ERR] Invalid flag (service)\n",
    }
}
