//! # Kernel Server
//!
//! Reads framed requests from its channel, hands them to the request
//! handler, and writes framed replies back. Three flavours share this
//! shape and differ only in how handler execution is scheduled:
//!
//! - [`KernelFlavour::Single`] serves inline, one request at a time.
//! - [`KernelFlavour::Async`] spawns a fresh worker per request and
//!   returns to reading immediately.
//! - [`KernelFlavour::Multi`] feeds a bounded worker pool from a FIFO
//!   queue; idle workers reap themselves after a randomized 9 to 11 s
//!   timeout unless they are the last one alive, which persists to keep
//!   the pool warm.
//!
//! Handler execution always happens on blocking threads: payload code is
//! ordinary synchronous Rust that may itself block on nested kernel
//! requests.
//!
//! Shutdown paths in priority order: a termination event or payload
//! interrupt (exit with the signalled code), a terminated channel (clean
//! exit, code 0), any unexpected internal error (log and exit non-zero).
//! On exit the server deregisters itself from the process's server
//! table.

use crate::codec::Codec;
use crate::error::{StopTwinterpreter, TwinError};
use crate::ipyc::DuplexChannel;
use crate::kernel::handler::RequestHandler;
use crate::kernel::KernelFlavour;
use crate::protocol::{Directive, Frame, Reply, RequestId};
use crate::state::{self, TwinId};
use crossbeam::channel as cb;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};

/// Base idle timeout of pool workers; each wait adds up to 2 s jitter so
/// workers do not reap in lockstep.
const REAP_BASE: Duration = Duration::from_secs(9);
const REAP_JITTER_MS: u64 = 2000;

/// Sends framed replies through the server's single writer task. Held by
/// handler workers; safe to use from any blocking thread.
#[derive(Clone)]
pub struct ReplySender {
    codec: Codec,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl ReplySender {
    pub fn send(&self, request_id: RequestId, reply: Reply) -> Result<(), TwinError> {
        debug!(request_id, code = reply.code(), "sending reply");
        let frame = self.codec.dump_frame(&Frame::Reply {
            id: request_id,
            reply,
        })?;
        self.outbound
            .blocking_send(frame)
            .map_err(|_| TwinError::ChannelTerminated)
    }
}

/// Control handle to a running server; stops the serve loop from the
/// owning process side and exposes the handler for introspection.
#[derive(Clone)]
pub struct ServerHandle {
    terminate: Arc<watch::Sender<bool>>,
    handler: Arc<RequestHandler>,
}

impl ServerHandle {
    pub fn stop(&self) {
        let _ = self.terminate.send(true);
    }

    /// Handler serving this peer, with its keep-alive table.
    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }
}

/// Server half of a kernel pair.
pub struct KernelServer {
    peer_id: TwinId,
    flavour: KernelFlavour,
    codec: Codec,
    handler: Arc<RequestHandler>,
    reader: crate::ipyc::FramedReader,
    replies: ReplySender,
    handle: ServerHandle,
    terminate_rx: watch::Receiver<bool>,
}

impl KernelServer {
    /// Build a server over an open channel. The writer task starts
    /// immediately; the serve loop starts with [`KernelServer::run`].
    pub fn new(
        peer_id: &str,
        channel: DuplexChannel,
        flavour: KernelFlavour,
        codec: Codec,
    ) -> (Self, ServerHandle) {
        let (reader, mut writer) = channel.into_framed();
        let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
        state::runtime().spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = writer.write_frame(&frame).await {
                    warn!("server writer failed: {err}");
                    break;
                }
            }
        });

        let (terminate_tx, terminate_rx) = watch::channel(false);
        let handler = Arc::new(RequestHandler::new(peer_id, codec));
        let handle = ServerHandle {
            terminate: Arc::new(terminate_tx),
            handler: handler.clone(),
        };
        let server = Self {
            peer_id: peer_id.to_string(),
            flavour,
            codec,
            handler,
            reader,
            replies: ReplySender { codec, outbound },
            handle: handle.clone(),
            terminate_rx,
        };
        (server, handle)
    }

    /// Handler backing this server; exposed for introspection.
    pub fn handler(&self) -> Arc<RequestHandler> {
        self.handler.clone()
    }

    /// Run the kernel request server until shutdown. Returns the exit
    /// code indicating potential failure.
    pub async fn run(mut self) -> i32 {
        if let Err(err) = state::register_server(&self.peer_id, self.handle.clone()) {
            error!(peer = %self.peer_id, "cannot start kernel server: {err}");
            return 1;
        }
        info!(twin = %state::twin_id(), peer = %self.peer_id, flavour = %self.flavour, "kernel server up");

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<StopTwinterpreter>();
        let pool = match self.flavour {
            KernelFlavour::Multi => Some(Pool::new(
                self.handler.clone(),
                self.replies.clone(),
                fatal_tx.clone(),
            )),
            _ => None,
        };

        let exit_code = loop {
            tokio::select! {
                biased;

                changed = self.terminate_rx.changed() => {
                    if changed.is_err() || *self.terminate_rx.borrow() {
                        debug!(peer = %self.peer_id, "kernel server stopped locally");
                        break 0;
                    }
                }

                stop = fatal_rx.recv() => {
                    if let Some(stop) = stop {
                        warn!(peer = %self.peer_id, "kernel server stopping: {stop}");
                        break stop.exit_code;
                    }
                }

                frame = self.reader.read_frame() => {
                    let bytes = match frame {
                        Ok(bytes) => bytes,
                        Err(TwinError::ChannelTerminated) => {
                            debug!(peer = %self.peer_id, "kernel channel closed");
                            break 0;
                        }
                        Err(err) => {
                            error!(peer = %self.peer_id, "kernel internal exception: {err}");
                            break 2;
                        }
                    };
                    match self.codec.load_frame(&bytes) {
                        Ok(Frame::Request { id, directive }) => {
                            if let Some(code) = self
                                .dispatch(id, directive, pool.as_ref(), &fatal_tx)
                                .await
                            {
                                break code;
                            }
                        }
                        Ok(Frame::Event(event)) => {
                            info!(
                                peer = %self.peer_id,
                                message = %event.message,
                                "termination event consumed"
                            );
                            break event.exit_code;
                        }
                        Ok(Frame::Reply { id, .. }) => {
                            error!(peer = %self.peer_id, request_id = id, "reply frame on request channel");
                            break 2;
                        }
                        Err(err) => {
                            error!(peer = %self.peer_id, "kernel internal exception: {err}");
                            break 2;
                        }
                    }
                }
            }
        };

        info!(twin = %state::twin_id(), peer = %self.peer_id, exit_code, "kernel server shutdown");
        state::deregister_server(&self.peer_id);
        exit_code
    }

    /// Schedule one request according to the kernel flavour. Returns an
    /// exit code when serving must stop.
    async fn dispatch(
        &self,
        request_id: RequestId,
        directive: Directive,
        pool: Option<&Pool>,
        fatal_tx: &mpsc::UnboundedSender<StopTwinterpreter>,
    ) -> Option<i32> {
        match self.flavour {
            KernelFlavour::Single => {
                let handler = self.handler.clone();
                let replies = self.replies.clone();
                match spawn_blocking(move || handler.serve_request(request_id, directive, &replies))
                    .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(stop)) => Some(stop.exit_code),
                    Err(join) => {
                        error!(peer = %self.peer_id, "request worker panicked: {join}");
                        Some(2)
                    }
                }
            }
            KernelFlavour::Async => {
                let handler = self.handler.clone();
                let replies = self.replies.clone();
                let fatal_tx = fatal_tx.clone();
                let peer_id = self.peer_id.clone();
                state::runtime().spawn(async move {
                    match spawn_blocking(move || {
                        handler.serve_request(request_id, directive, &replies)
                    })
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(stop)) => {
                            let _ = fatal_tx.send(stop);
                        }
                        Err(join) => {
                            error!(peer = %peer_id, "request worker panicked: {join}");
                            let _ = fatal_tx.send(StopTwinterpreter::new("worker panic", 2));
                        }
                    }
                });
                None
            }
            KernelFlavour::Multi => {
                if let Some(pool) = pool {
                    pool.dispatch(request_id, directive);
                }
                None
            }
        }
    }
}

/// Bounded worker pool of the multi flavour. Requests queue in FIFO
/// order; a worker is added whenever the backlog outgrows the idle set,
/// up to the pool bound.
struct Pool {
    queue_tx: cb::Sender<(RequestId, Directive)>,
    queue_rx: cb::Receiver<(RequestId, Directive)>,
    idle: Arc<AtomicUsize>,
    workers: Arc<AtomicUsize>,
    max_workers: usize,
    handler: Arc<RequestHandler>,
    replies: ReplySender,
    fatal_tx: mpsc::UnboundedSender<StopTwinterpreter>,
}

impl Pool {
    fn new(
        handler: Arc<RequestHandler>,
        replies: ReplySender,
        fatal_tx: mpsc::UnboundedSender<StopTwinterpreter>,
    ) -> Self {
        let (queue_tx, queue_rx) = cb::unbounded();
        Self {
            queue_tx,
            queue_rx,
            idle: Arc::new(AtomicUsize::new(0)),
            workers: Arc::new(AtomicUsize::new(0)),
            max_workers: num_cpus::get().max(4),
            handler,
            replies,
            fatal_tx,
        }
    }

    fn dispatch(&self, request_id: RequestId, directive: Directive) {
        if self.queue_tx.send((request_id, directive)).is_err() {
            return;
        }
        let backlog = self.queue_tx.len();
        if backlog > self.idle.load(Ordering::Relaxed)
            && self.workers.load(Ordering::Relaxed) < self.max_workers
        {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&self) {
        self.workers.fetch_add(1, Ordering::Relaxed);
        let queue_rx = self.queue_rx.clone();
        let idle = self.idle.clone();
        let workers = self.workers.clone();
        let handler = self.handler.clone();
        let replies = self.replies.clone();
        let fatal_tx = self.fatal_tx.clone();
        std::thread::Builder::new()
            .name(format!("twinterp-pool-{}", handler.peer_id))
            .spawn(move || loop {
                idle.fetch_add(1, Ordering::Relaxed);
                let item = queue_rx.recv_timeout(reap_timeout());
                idle.fetch_sub(1, Ordering::Relaxed);
                match item {
                    Ok((request_id, directive)) => {
                        if let Err(stop) = handler.serve_request(request_id, directive, &replies) {
                            let _ = fatal_tx.send(stop);
                            workers.fetch_sub(1, Ordering::Relaxed);
                            break;
                        }
                    }
                    Err(cb::RecvTimeoutError::Timeout) => {
                        // Reap this worker unless it is the last one;
                        // the survivor keeps the pool warm.
                        if workers.fetch_sub(1, Ordering::Relaxed) == 1 {
                            workers.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        break;
                    }
                    Err(cb::RecvTimeoutError::Disconnected) => {
                        workers.fetch_sub(1, Ordering::Relaxed);
                        break;
                    }
                }
            })
            .expect("pool worker threads must spawn");
    }
}

fn reap_timeout() -> Duration {
    REAP_BASE + Duration::from_millis(rand::thread_rng().gen_range(0..REAP_JITTER_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_timeout_stays_in_band() {
        for _ in 0..64 {
            let timeout = reap_timeout();
            assert!(timeout >= Duration::from_secs(9));
            assert!(timeout < Duration::from_secs(11));
        }
    }
}
