//! Call dispatch: seq-id correlation and handler serving.
//!
//! One `Dispatch` lives per logical connection and survives reconnects.
//! Outgoing invokes register a oneshot in the in-flight table keyed by a
//! monotonically increasing seq id; the matching reply (or a cancel, or
//! a connection reset) resolves it exactly once. Incoming invokes and
//! notifies are looked up in the method registry and served on their own
//! tasks, capped by a semaphore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{oneshot, Semaphore};

use crate::codec::MsgPackCodec;
use crate::error::{Result, WirecallError};
use crate::handler::{Bundle, MethodRegistry};
use crate::protocol::{frame, Envelope, Packetizer};
use crate::transport::Outbound;

/// Default cap on concurrently running handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// A registered invoke whose send has completed but whose reply is still
/// pending. Separating send from wait lets queued calls be flushed in
/// FIFO send order while their replies are awaited concurrently.
#[derive(Debug)]
pub struct PendingReply {
    seq_id: u64,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl PendingReply {
    /// The seq id assigned to this invoke.
    pub fn seq_id(&self) -> u64 {
        self.seq_id
    }

    /// Wait for the reply, a cancel, or a reset.
    pub async fn wait(self) -> Result<Bytes> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without resolving: dispatch went away
            Err(_) => Err(WirecallError::Cancelled("dispatch dropped".to_string())),
        }
    }
}

/// Per-connection message router.
pub struct Dispatch {
    outbound: Arc<Outbound>,
    registry: MethodRegistry,
    packetizer: Mutex<Packetizer>,
    in_flight: Mutex<HashMap<u64, oneshot::Sender<Result<Bytes>>>>,
    seq: AtomicU64,
    handler_slots: Arc<Semaphore>,
}

impl Dispatch {
    /// Create a dispatch bound to an outbound send slot.
    pub(crate) fn new(
        outbound: Arc<Outbound>,
        registry: MethodRegistry,
        max_payload: usize,
        max_concurrent_handlers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            registry,
            packetizer: Mutex::new(Packetizer::with_max_payload(max_payload)),
            in_flight: Mutex::new(HashMap::new()),
            // Seq ids start at 1
            seq: AtomicU64::new(1),
            handler_slots: Arc::new(Semaphore::new(max_concurrent_handlers)),
        })
    }

    /// Create a dispatch with no stream behind it. Sends fail with
    /// `NoActiveStream` until a wrapper is installed.
    pub(crate) fn detached(registry: MethodRegistry) -> Arc<Self> {
        Self::new(
            Arc::new(Outbound::new()),
            registry,
            crate::protocol::DEFAULT_MAX_PAYLOAD,
            DEFAULT_MAX_CONCURRENT_HANDLERS,
        )
    }

    /// The registry this dispatch serves from.
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub(crate) fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    /// Number of invokes awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    /// Call a remote method and decode its reply.
    pub async fn invoke<A, R>(self: &Arc<Self>, program: &str, method: &str, arg: &A) -> Result<R>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let arg = Bytes::from(MsgPackCodec::encode(arg)?);
        let reply = self.invoke_raw(program, method, arg).await?;
        MsgPackCodec::decode(&reply)
    }

    /// Call a remote method with pre-encoded argument bytes.
    pub async fn invoke_raw(
        self: &Arc<Self>,
        program: &str,
        method: &str,
        arg: Bytes,
    ) -> Result<Bytes> {
        let pending = self.start_invoke(program, method, arg).await?;
        pending.wait().await
    }

    /// Send an invoke and return a handle to await its reply later.
    pub async fn start_invoke(
        self: &Arc<Self>,
        program: &str,
        method: &str,
        arg: Bytes,
    ) -> Result<PendingReply> {
        let seq_id = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(seq_id, tx);

        let envelope = Envelope::Invoke {
            seq_id,
            method: MethodRegistry::qualified(program, method),
            arg,
        };

        if let Err(e) = self.send_envelope(&envelope).await {
            self.in_flight
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&seq_id);
            return Err(e);
        }

        Ok(PendingReply { seq_id, rx })
    }

    /// Send a fire-and-forget notification.
    pub async fn notify<A: serde::Serialize>(
        &self,
        program: &str,
        method: &str,
        arg: &A,
    ) -> Result<()> {
        let arg = Bytes::from(MsgPackCodec::encode(arg)?);
        self.notify_raw(program, method, arg).await
    }

    /// Send a notification with pre-encoded argument bytes.
    pub async fn notify_raw(&self, program: &str, method: &str, arg: Bytes) -> Result<()> {
        let envelope = Envelope::Notify {
            method: MethodRegistry::qualified(program, method),
            arg,
        };
        self.send_envelope(&envelope).await
    }

    /// Cancel a pending invoke. The waiter gets a cancelled error; a
    /// reply that later arrives for this seq id is discarded.
    pub fn cancel(&self, seq_id: u64) {
        let entry = self
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&seq_id);
        if let Some(tx) = entry {
            let _ = tx.send(Err(WirecallError::Cancelled("cancelled".to_string())));
        }
    }

    /// Resolve every pending invoke with a cancelled error and drop any
    /// partially buffered frame. Called on stream teardown.
    pub(crate) fn reset(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut table = self.in_flight.lock().expect("in-flight lock poisoned");
            table.drain().collect()
        };
        if !drained.is_empty() {
            tracing::warn!("Cancelling {} in-flight calls: {}", drained.len(), reason);
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(WirecallError::Cancelled(reason.to_string())));
        }
        self.packetizer
            .lock()
            .expect("packetizer lock poisoned")
            .reset();
    }

    /// Feed raw stream bytes; decodes and processes every completed
    /// envelope.
    ///
    /// # Errors
    ///
    /// Protocol errors (bad framing, malformed envelope) propagate so
    /// the read loop tears the connection down.
    pub(crate) async fn ingest(self: &Arc<Self>, chunk: Bytes) -> Result<()> {
        let frames = self
            .packetizer
            .lock()
            .expect("packetizer lock poisoned")
            .feed(chunk)?;

        for payload in frames {
            let envelope = Envelope::decode(&payload)?;
            self.process(envelope).await;
        }
        Ok(())
    }

    async fn process(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Reply {
                seq_id,
                error,
                result,
            } => {
                let outcome = match error {
                    Some(message) => Err(WirecallError::Remote(message)),
                    None => Ok(result),
                };
                self.complete(seq_id, outcome);
            }
            Envelope::Invoke {
                seq_id,
                method,
                arg,
            } => {
                self.serve(Some(seq_id), method, arg).await;
            }
            Envelope::Notify { method, arg } => {
                self.serve(None, method, arg).await;
            }
        }
    }

    fn complete(&self, seq_id: u64, outcome: Result<Bytes>) {
        let entry = self
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&seq_id);
        match entry {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            // Expected race: reply landed after a cancel or reset
            None => tracing::debug!("Reply for unknown seq id {} discarded", seq_id),
        }
    }

    async fn serve(self: &Arc<Self>, seq_id: Option<u64>, method: String, arg: Bytes) {
        let handler = match self.registry.get(&method) {
            Some(h) => h,
            None => {
                match seq_id {
                    Some(seq_id) => {
                        tracing::warn!("Invoke for unknown method: {}", method);
                        let message = WirecallError::UnknownMethod(method).to_string();
                        if let Err(e) = self
                            .send_reply(seq_id, Some(message), Bytes::from_static(&[0xc0]))
                            .await
                        {
                            tracing::error!("Failed to send unknown-method reply: {}", e);
                        }
                    }
                    None => tracing::warn!("Notify for unknown method dropped: {}", method),
                }
                return;
            }
        };

        // Awaiting a slot here backpressures the read loop when all
        // handler slots are busy
        let permit = self
            .handler_slots
            .clone()
            .acquire_owned()
            .await
            .expect("handler semaphore closed");

        let bundle = Bundle::new(self.clone(), seq_id, method, arg);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handler.call(bundle.clone()).await {
                if bundle.expects_reply() && !bundle.has_replied() {
                    if let Err(send_err) = bundle.reply_error(&e.to_string()).await {
                        tracing::error!("Failed to send handler error reply: {}", send_err);
                    }
                } else {
                    tracing::error!("Handler for {} failed: {}", bundle.method(), e);
                }
            }
        });
    }

    /// Send a reply envelope for a served invoke.
    pub(crate) async fn send_reply(
        &self,
        seq_id: u64,
        error: Option<String>,
        result: Bytes,
    ) -> Result<()> {
        let envelope = Envelope::Reply {
            seq_id,
            error,
            result,
        };
        self.send_envelope(&envelope).await
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.encode();
        self.outbound.send(&frame(&payload)).await
    }
}
