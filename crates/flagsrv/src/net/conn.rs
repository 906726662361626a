//! A single incoming connection.
//!
//! Each connection is pinned to one worker and lives entirely on that
//! worker's loop: bytes are scanned for newline-terminated lines, every line
//! runs through the validator (or the loopback-only statistics channel) and
//! the response joins a FIFO that is drained whenever the socket accepts
//! writes. Responses keep the order of their triggering lines.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

use crate::checker;
use crate::context::{ServerContext, TEAM_UNRESOLVED};
use crate::net::worker::SharedSink;
use crate::stats;

/// No valid submission line is longer than this; the tail of an overlong
/// line is silently dropped until the next newline.
pub const MAX_LINE_BYTES: usize = 80;

/// Read size per readiness event.
const READ_CHUNK: usize = 256;

/// Stop reading while this many responses are waiting (read back-pressure).
const WRITE_BACKLOG_LIMIT: usize = 32;

/// The idle timer fires at this interval; two firings without intervening
/// activity destroy the connection.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// A queued response: either a canned constant or an owned rendering
/// (statistics reports). A byte cursor in the connection tracks partial
/// writes of the queue head.
enum Response {
    Static(&'static str),
    Owned(String),
}

impl Response {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Response::Static(text) => text.as_bytes(),
            Response::Owned(text) => text.as_bytes(),
        }
    }
}

/// Serve one connection until its read side is closed and all responses are
/// out (or writing broke), or until the idle timer gives up on it.
pub async fn run(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>, sink: SharedSink) {
    let clients = ctx.stats.connection_opened();
    info!(%peer, clients, "New connection");

    let lines = handle(stream, peer, &ctx, &sink).await;

    let clients = ctx.stats.connection_closed();
    info!(%peer, lines, clients, "Connection closed");
}

async fn handle(mut stream: TcpStream, peer: SocketAddr, ctx: &ServerContext, sink: &SharedSink) -> u64 {
    let peer_ip = peer.ip();
    let loopback = is_loopback_v4(peer_ip);
    let (mut rd, mut wr) = stream.split();

    let mut chunk = [0u8; READ_CHUNK];
    let mut line = [0u8; MAX_LINE_BYTES];
    let mut line_len = 0usize;

    let mut queue: VecDeque<Response> = VecDeque::new();
    let mut cursor = 0usize;
    let mut out_buf = [0u8; 256];

    let mut read_closed = false;
    let mut write_broken = false;
    let mut saw_activity = true;
    let mut team_id = TEAM_UNRESOLVED;
    let mut lines = 0u64;

    let mut idle = time::interval(IDLE_CHECK_INTERVAL);
    idle.tick().await; // the first tick completes immediately

    loop {
        // drop finished and empty buffers from the queue head
        while queue
            .front()
            .is_some_and(|head| head.as_bytes().len() <= cursor)
        {
            queue.pop_front();
            cursor = 0;
        }

        if read_closed && (write_broken || queue.is_empty()) {
            break;
        }

        let want_read = !read_closed && !(!write_broken && queue.len() > WRITE_BACKLOG_LIMIT);

        // stage the next slice of the queue head for writing
        let out_len = match queue.front() {
            Some(head) if !write_broken => {
                let pending = &head.as_bytes()[cursor..];
                let n = pending.len().min(out_buf.len());
                out_buf[..n].copy_from_slice(&pending[..n]);
                n
            }
            _ => 0,
        };

        tokio::select! {
            read = rd.read(&mut chunk), if want_read => match read {
                Ok(0) => read_closed = true,
                Ok(n) => {
                    saw_activity = true;
                    for &byte in &chunk[..n] {
                        if byte == b'\n' {
                            dispatch_line(
                                &line[..line_len],
                                peer_ip,
                                loopback,
                                &mut team_id,
                                ctx,
                                sink,
                                write_broken,
                                &mut queue,
                            );
                            lines += 1;
                            line_len = 0;
                        } else if line_len < MAX_LINE_BYTES {
                            line[line_len] = byte;
                            line_len += 1;
                        }
                        // excess bytes up to the next newline are dropped
                    }
                }
                Err(e) => {
                    debug!(%peer, error = %e, "read error");
                    read_closed = true;
                }
            },
            written = wr.write(&out_buf[..out_len]), if out_len > 0 => match written {
                Ok(n) => {
                    saw_activity = true;
                    cursor += n;
                }
                Err(e) => {
                    debug!(%peer, error = %e, "write error");
                    queue.clear();
                    cursor = 0;
                    write_broken = true;
                }
            },
            _ = idle.tick() => {
                if !std::mem::take(&mut saw_activity) {
                    debug!(%peer, "closing connection due to inactivity");
                    break;
                }
            }
        }
    }

    lines
}

/// Route one complete line: the loopback statistics channel first, the
/// validator otherwise. With a broken writer the line still runs (counters
/// and persistence see it) but the response is dropped.
#[allow(clippy::too_many_arguments)]
fn dispatch_line(
    line: &[u8],
    peer_ip: IpAddr,
    loopback: bool,
    team_id: &mut u16,
    ctx: &ServerContext,
    sink: &SharedSink,
    write_broken: bool,
    queue: &mut VecDeque<Response>,
) {
    let mut push = |response: Response| {
        if !write_broken {
            queue.push_back(response);
        }
    };

    if loopback {
        match line {
            b"statistics connections" => {
                push(Response::Owned(ctx.stats.connection_report()));
                return;
            }
            b"statistics flags" => {
                for report_line in ctx.stats.flag_report() {
                    push(Response::Owned(report_line));
                }
                return;
            }
            b"statistics cache" => {
                push(Response::Owned(stats::cache_report(&ctx.cache)));
                return;
            }
            _ => {}
        }
    }

    let response = {
        let mut sink = sink.borrow_mut();
        checker::process_line(line, peer_ip, Some(team_id), ctx, &mut **sink)
    };
    push(Response::Static(response));
}

fn is_loopback_v4(ip: IpAddr) -> bool {
    match checker::ipv4_octets(ip) {
        Some(octets) => octets[0] == 127,
        None => false,
    }
}
