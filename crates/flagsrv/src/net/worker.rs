//! The worker pool.
//!
//! A worker is a thread running its own single-threaded reactor; accepted
//! sockets are handed to workers round-robin over per-worker channels and a
//! connection stays on its worker for its whole lifetime. Each worker owns
//! one persistence handle, shared by its connections only - handles never
//! cross threads. Closing the channels tells the workers to terminate;
//! `shutdown` joins them.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::context::ServerContext;
use crate::db::{FlagSink, SinkFactory};
use crate::net::conn;

/// The worker's persistence handle, shared by the connections on its loop.
pub type SharedSink = Rc<RefCell<Box<dyn FlagSink>>>;

/// Capacity of the per-worker handoff channel.
const HANDOFF_QUEUE_DEPTH: usize = 256;

enum WorkerMsg {
    Connection(std::net::TcpStream, SocketAddr),
}

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<WorkerMsg>>,
    handles: Vec<thread::JoinHandle<()>>,
    next: usize,
}

impl WorkerPool {
    /// Start `threads` workers. Each builds its own persistence sink from
    /// `make_sink` on its own thread.
    pub fn spawn(
        threads: usize,
        ctx: Arc<ServerContext>,
        make_sink: SinkFactory,
    ) -> anyhow::Result<Self> {
        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let (tx, rx) = mpsc::channel(HANDOFF_QUEUE_DEPTH);
            let ctx = ctx.clone();
            let make_sink = make_sink.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_main(index, rx, ctx, make_sink))?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            senders,
            handles,
            next: 0,
        })
    }

    /// Hand an accepted connection to the next worker (round-robin).
    pub async fn dispatch(&mut self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let index = self.next;
        self.next = (self.next + 1) % self.senders.len();

        let socket = match stream.into_std() {
            Ok(socket) => socket,
            Err(e) => {
                warn!(%peer, error = %e, "could not detach accepted socket");
                return;
            }
        };
        if self.senders[index]
            .send(WorkerMsg::Connection(socket, peer))
            .await
            .is_err()
        {
            warn!(worker = index, %peer, "worker is gone, dropping connection");
        }
    }

    /// Signal all workers to terminate and wait for them.
    pub fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_main(
    index: usize,
    mut rx: mpsc::Receiver<WorkerMsg>,
    ctx: Arc<ServerContext>,
    make_sink: SinkFactory,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = index, error = %e, "could not build worker runtime");
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async move {
        let sink: SharedSink = Rc::new(RefCell::new(make_sink()));
        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMsg::Connection(socket, peer) => {
                    match tokio::net::TcpStream::from_std(socket) {
                        Ok(stream) => {
                            tokio::task::spawn_local(conn::run(
                                stream,
                                peer,
                                ctx.clone(),
                                sink.clone(),
                            ));
                        }
                        Err(e) => warn!(%peer, error = %e, "could not register connection"),
                    }
                }
            }
        }
        debug!(worker = index, "terminating");
    });
    // in-flight connection tasks are dropped with the local set; pending
    // writes are allowed to be lost during shutdown
}
