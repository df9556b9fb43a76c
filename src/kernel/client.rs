//! # Kernel Client
//!
//! Owns one end of a kernel channel. `run_request` sends a directive and
//! blocks the calling thread until the matching reply arrives or the
//! channel terminates; `run_event` sends a tag-less control event and
//! returns immediately.
//!
//! ## Concurrency discipline
//!
//! Outbound framing is serialized through a single writer task (writes
//! must never interleave). The read side is single-reader: only the
//! reply pump touches the channel reader. Blocked callers wait on
//! per-request latches keyed by request id; on channel termination the
//! pump releases every outstanding latch with a terminated sentinel and
//! the client refuses further requests.
//!
//! The blocking verbs must be called from ordinary threads (user code,
//! request workers), never from inside the kernel runtime.

use crate::codec::Codec;
use crate::error::{Result, TwinError};
use crate::ipyc::DuplexChannel;
use crate::kernel::KernelFlavour;
use crate::protocol::{Frame, Reply, RequestId, TerminationEvent};
use crate::state::{self, TwinId};
use crossbeam::channel as cb;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// State shared between the client facade, the reply pump, and the
/// writer task.
struct ClientShared {
    peer_id: TwinId,
    pending: Mutex<HashMap<RequestId, cb::Sender<Option<Reply>>>>,
    terminated: AtomicBool,
}

impl ClientShared {
    /// Mark the channel dead and release every outstanding latch with
    /// the terminated sentinel.
    fn release_requests(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (request_id, latch) in drained {
            debug!(peer = %self.peer_id, request_id, "releasing outstanding request");
            let _ = latch.send(None);
        }
    }
}

/// Client half of a kernel pair.
pub struct KernelClient {
    pub peer_id: TwinId,
    codec: Codec,
    shared: Arc<ClientShared>,
    outbound: mpsc::Sender<Vec<u8>>,
    next_request: AtomicU64,
    /// Present for the single flavour: send and receive are strictly
    /// paired, one request on the wire at a time.
    sequential: Option<Mutex<()>>,
}

impl KernelClient {
    /// Boot the client over an open channel: spawns the writer task and
    /// the reply pump on the kernel runtime.
    pub fn start(
        peer_id: &str,
        channel: DuplexChannel,
        flavour: KernelFlavour,
        codec: Codec,
    ) -> Arc<Self> {
        let (mut reader, mut writer) = channel.into_framed();
        let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);

        let shared = Arc::new(ClientShared {
            peer_id: peer_id.to_string(),
            pending: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
        });

        // Writer task: the only task that touches the channel writer.
        let writer_shared = shared.clone();
        state::runtime().spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = writer.write_frame(&frame).await {
                    warn!(peer = %writer_shared.peer_id, "client writer failed: {err}");
                    writer_shared.release_requests();
                    break;
                }
            }
        });

        // Reply pump: the only task that touches the channel reader.
        let pump_shared = shared.clone();
        let pump_codec = codec;
        state::runtime().spawn(async move {
            loop {
                let bytes = match reader.read_frame().await {
                    Ok(bytes) => bytes,
                    Err(TwinError::ChannelTerminated) => {
                        debug!(peer = %pump_shared.peer_id, "client channel released");
                        break;
                    }
                    Err(err) => {
                        error!(peer = %pump_shared.peer_id, "client reader failed: {err}");
                        break;
                    }
                };
                match pump_codec.load_frame(&bytes) {
                    Ok(Frame::Reply { id, reply }) => {
                        let latch = pump_shared.pending.lock().remove(&id);
                        match latch {
                            Some(latch) => {
                                let _ = latch.send(Some(reply));
                            }
                            None => {
                                error!(
                                    peer = %pump_shared.peer_id,
                                    request_id = id,
                                    "reply matches no in-flight request"
                                );
                                break;
                            }
                        }
                    }
                    Ok(other) => {
                        error!(
                            peer = %pump_shared.peer_id,
                            "unexpected frame on reply channel: {other:?}"
                        );
                        break;
                    }
                    Err(err) => {
                        error!(peer = %pump_shared.peer_id, "undecodable reply frame: {err}");
                        break;
                    }
                }
            }
            pump_shared.release_requests();
            state::deregister_kernel(&pump_shared.peer_id);
        });

        Arc::new(Self {
            peer_id: peer_id.to_string(),
            codec,
            shared,
            outbound,
            next_request: AtomicU64::new(1),
            sequential: matches!(flavour, KernelFlavour::Single).then(|| Mutex::new(())),
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Send a directive and block until its reply arrives.
    pub fn run_request(&self, directive: crate::protocol::Directive) -> Result<Reply> {
        if self.is_terminated() {
            return Err(TwinError::ChannelTerminated);
        }
        let _pairing = self.sequential.as_ref().map(|lock| lock.lock());

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = self.codec.dump_frame(&Frame::Request {
            id: request_id,
            directive,
        })?;

        let (latch_tx, latch_rx) = cb::bounded(1);
        self.shared.pending.lock().insert(request_id, latch_tx);
        // The pump may have drained `pending` just before our insert;
        // re-checking after it closes that window.
        if self.is_terminated() {
            self.shared.pending.lock().remove(&request_id);
            return Err(TwinError::ChannelTerminated);
        }

        if self.outbound.blocking_send(frame).is_err() {
            self.shared.pending.lock().remove(&request_id);
            return Err(TwinError::ChannelTerminated);
        }

        match latch_rx.recv() {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => Err(TwinError::ChannelTerminated),
        }
    }

    /// Send a control event without awaiting any reply.
    pub fn run_event(&self, event: TerminationEvent) -> Result<()> {
        if self.is_terminated() {
            return Err(TwinError::ChannelTerminated);
        }
        let frame = self.codec.dump_frame(&Frame::Event(event))?;
        self.outbound
            .blocking_send(frame)
            .map_err(|_| TwinError::ChannelTerminated)
    }

    /// Tear the client down locally: fail outstanding and future
    /// requests and unhook the dispatcher.
    pub fn shutdown(&self) {
        self.shared.release_requests();
        state::deregister_kernel(&self.peer_id);
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.shared.release_requests();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Directive;
    use crate::protocol::WireValue;

    fn loopback_client(flavour: KernelFlavour) -> (Arc<KernelClient>, DuplexChannel) {
        let (near, far) = tokio::io::duplex(1 << 16);
        let (nr, nw) = tokio::io::split(near);
        let (fr, fw) = tokio::io::split(far);
        let client_channel = DuplexChannel {
            reader: Box::new(nr),
            writer: Box::new(nw),
        };
        let peer_channel = DuplexChannel {
            reader: Box::new(fr),
            writer: Box::new(fw),
        };
        let client = KernelClient::start("loop-peer", client_channel, flavour, Codec::default());
        (client, peer_channel)
    }

    #[test]
    fn termination_releases_blocked_callers() {
        let (client, peer_channel) = loopback_client(KernelFlavour::Async);

        let worker = {
            let client = client.clone();
            std::thread::spawn(move || {
                client.run_request(Directive::RefIncr {
                    subject: WireValue::Ref("X\tloop-peer\tm\tC".into()),
                })
            })
        };
        // Let the request get onto the wire, then slam the channel shut.
        std::thread::sleep(std::time::Duration::from_millis(100));
        drop(peer_channel);

        match worker.join().unwrap() {
            Err(TwinError::ChannelTerminated) => {}
            other => panic!("expected terminated channel, got {other:?}"),
        }
        assert!(client.is_terminated());
    }

    #[test]
    fn requests_after_termination_refuse_immediately() {
        let (client, peer_channel) = loopback_client(KernelFlavour::Async);
        drop(peer_channel);
        client.shutdown();
        match client.run_request(Directive::RefIncr {
            subject: WireValue::Ref("X\tloop-peer\tm\tC".into()),
        }) {
            Err(TwinError::ChannelTerminated) => {}
            other => panic!("expected terminated channel, got {other:?}"),
        }
    }

    #[test]
    fn request_ids_are_unique_among_in_flight() {
        let (client, _peer_channel) = loopback_client(KernelFlavour::Async);
        let a = client.next_request.fetch_add(1, Ordering::Relaxed);
        let b = client.next_request.fetch_add(1, Ordering::Relaxed);
        assert_ne!(a, b);
    }
}
