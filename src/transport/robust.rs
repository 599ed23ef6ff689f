//! Reconnecting transport with call queueing.
//!
//! Wraps a [`Transport`] and keeps the caller's view stable across
//! stream loss: a non-explicit disconnect starts a retry loop, and calls
//! made while disconnected wait in a bounded FIFO queue that is flushed,
//! in order, once a stream is back. An advisory watchdog logs calls that
//! run long; it never cancels them.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::{ConnState, Connector, Transport, TransportConfig};
use crate::codec::MsgPackCodec;
use crate::error::{Result, WirecallError};
use crate::handler::MethodRegistry;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default cap on calls queued while disconnected.
pub const DEFAULT_QUEUE_MAX: usize = 1000;

/// Robust layer tuning knobs.
#[derive(Debug, Clone)]
pub struct RobustConfig {
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Calls queued while disconnected beyond this fail immediately.
    pub queue_max: usize,
    /// Completed calls slower than this are logged at warn.
    pub warn_threshold: Option<Duration>,
    /// Calls outstanding past this are logged at error (and again,
    /// classified, on completion).
    pub error_threshold: Option<Duration>,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            queue_max: DEFAULT_QUEUE_MAX,
            warn_threshold: None,
            error_threshold: None,
        }
    }
}

/// Watchdog verdict for a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Warn,
    Error,
}

/// Classify a completed call's duration against the thresholds.
fn classify(
    elapsed: Duration,
    warn: Option<Duration>,
    error: Option<Duration>,
) -> Option<Severity> {
    if matches!(error, Some(t) if elapsed >= t) {
        return Some(Severity::Error);
    }
    if matches!(warn, Some(t) if elapsed >= t) {
        return Some(Severity::Warn);
    }
    None
}

struct QueuedCall {
    program: String,
    method: String,
    arg: Bytes,
    /// `None` for queued notifies.
    reply_tx: Option<oneshot::Sender<Result<Bytes>>>,
}

struct RobustInner {
    transport: Transport,
    config: RobustConfig,
    queue: Mutex<VecDeque<QueuedCall>>,
    reconnecting: AtomicBool,
}

/// A transport that survives stream loss.
#[derive(Clone)]
pub struct RobustTransport {
    inner: Arc<RobustInner>,
}

impl RobustTransport {
    /// Wrap a new client transport in the robust layer.
    pub fn new(
        connector: Box<dyn Connector>,
        registry: MethodRegistry,
        transport_config: TransportConfig,
        config: RobustConfig,
    ) -> Self {
        let transport = Transport::new(connector, registry, transport_config);
        let inner = Arc::new(RobustInner {
            transport,
            config,
            queue: Mutex::new(VecDeque::new()),
            reconnecting: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.set_on_disconnect(move || {
            if let Some(inner) = weak.upgrade() {
                tracing::warn!("Connection lost, scheduling reconnect");
                schedule_reconnect(&inner);
            }
        });

        Self { inner }
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Number of calls waiting for a stream.
    pub fn queued_count(&self) -> usize {
        self.inner.queue.lock().expect("queue lock poisoned").len()
    }

    /// Connect once. On failure the retry loop starts in the background
    /// and the error is returned; queued calls go out when a later
    /// attempt succeeds.
    pub async fn connect(&self) -> Result<()> {
        match self.inner.transport.connect().await {
            Ok(()) => {
                flush_queue(&self.inner).await;
                Ok(())
            }
            Err(e) => {
                if !matches!(e, WirecallError::Cancelled(_)) {
                    schedule_reconnect(&self.inner);
                }
                Err(e)
            }
        }
    }

    /// Call a remote method, queueing if disconnected.
    pub async fn call<A, R>(&self, program: &str, method: &str, arg: &A) -> Result<R>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let arg = Bytes::from(MsgPackCodec::encode(arg)?);
        let reply = self.call_raw(program, method, arg).await?;
        MsgPackCodec::decode(&reply)
    }

    /// Call with pre-encoded argument bytes, queueing if disconnected.
    pub async fn call_raw(&self, program: &str, method: &str, arg: Bytes) -> Result<Bytes> {
        match self.inner.transport.state() {
            ConnState::Closed => Err(WirecallError::Cancelled(
                "transport explicitly closed".to_string(),
            )),
            ConnState::Connected => {
                let label = MethodRegistry::qualified(program, method);
                let fut = self
                    .inner
                    .transport
                    .dispatch()
                    .invoke_raw(program, method, arg.clone());
                match timed_wait(fut, &self.inner.config, &label).await {
                    // The stream was torn down between the state read
                    // and the send; the disconnect cycle will flush
                    Err(WirecallError::NoActiveStream) => {
                        let rx = self.enqueue(program, method, arg, true)?;
                        await_queued_reply(rx).await
                    }
                    outcome => outcome,
                }
            }
            _ => {
                let rx = self.enqueue(program, method, arg, true)?;
                // A connect may have raced the queue insert; flush so the
                // call is not stranded until the next disconnect cycle
                if self.inner.transport.is_connected() {
                    flush_queue(&self.inner).await;
                }
                await_queued_reply(rx).await
            }
        }
    }

    /// Send a notification, queueing if disconnected.
    pub async fn notify<A: serde::Serialize>(
        &self,
        program: &str,
        method: &str,
        arg: &A,
    ) -> Result<()> {
        let arg = Bytes::from(MsgPackCodec::encode(arg)?);
        match self.inner.transport.state() {
            ConnState::Closed => Err(WirecallError::Cancelled(
                "transport explicitly closed".to_string(),
            )),
            ConnState::Connected => {
                match self
                    .inner
                    .transport
                    .dispatch()
                    .notify_raw(program, method, arg.clone())
                    .await
                {
                    Err(WirecallError::NoActiveStream) => {
                        self.enqueue(program, method, arg, false)?;
                        Ok(())
                    }
                    outcome => outcome,
                }
            }
            _ => {
                self.enqueue(program, method, arg, false)?;
                if self.inner.transport.is_connected() {
                    flush_queue(&self.inner).await;
                }
                Ok(())
            }
        }
    }

    /// Close the transport for good. The queue is drained with
    /// cancellation errors and reconnection stops.
    pub async fn close(&self) {
        self.inner.transport.close().await;

        let drained: Vec<_> = {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            queue.drain(..).collect()
        };
        for call in drained {
            if let Some(tx) = call.reply_tx {
                let _ = tx.send(Err(WirecallError::Cancelled(
                    "transport explicitly closed".to_string(),
                )));
            }
        }
    }

    fn enqueue(
        &self,
        program: &str,
        method: &str,
        arg: Bytes,
        wants_reply: bool,
    ) -> Result<Option<oneshot::Receiver<Result<Bytes>>>> {
        let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
        if queue.len() >= self.inner.config.queue_max {
            tracing::warn!(
                "Call queue full ({} entries), rejecting {}.{}",
                queue.len(),
                program,
                method
            );
            return Err(WirecallError::QueueOverflow);
        }

        let (reply_tx, rx) = if wants_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        queue.push_back(QueuedCall {
            program: program.to_string(),
            method: method.to_string(),
            arg,
            reply_tx,
        });
        tracing::debug!(
            "Queued call to {} ({} queued)",
            MethodRegistry::qualified(program, method),
            queue.len()
        );
        Ok(rx)
    }
}

/// Wait for a queued invoke's reply channel.
async fn await_queued_reply(
    rx: Option<oneshot::Receiver<Result<Bytes>>>,
) -> Result<Bytes> {
    match rx.expect("invoke enqueues a reply channel").await {
        Ok(outcome) => outcome,
        Err(_) => Err(WirecallError::Cancelled("queue dropped".to_string())),
    }
}

/// Run a reply future under the duration watchdog.
async fn timed_wait<F>(fut: F, config: &RobustConfig, label: &str) -> Result<Bytes>
where
    F: Future<Output = Result<Bytes>>,
{
    let start = Instant::now();
    tokio::pin!(fut);

    if let Some(threshold) = config.error_threshold {
        tokio::select! {
            outcome = &mut fut => {
                log_duration(start.elapsed(), config, label);
                return outcome;
            }
            _ = tokio::time::sleep(threshold) => {
                tracing::error!(
                    "Call to {} still outstanding after {:?}",
                    label,
                    threshold
                );
            }
        }
    }

    let outcome = fut.await;
    log_duration(start.elapsed(), config, label);
    outcome
}

fn log_duration(elapsed: Duration, config: &RobustConfig, label: &str) {
    match classify(elapsed, config.warn_threshold, config.error_threshold) {
        Some(Severity::Error) => {
            tracing::error!("Call to {} took {:?}", label, elapsed)
        }
        Some(Severity::Warn) => {
            tracing::warn!("Call to {} took {:?}", label, elapsed)
        }
        None => {}
    }
}

/// Kick off the background retry loop, once.
fn schedule_reconnect(inner: &Arc<RobustInner>) {
    if inner.transport.state() == ConnState::Closed {
        return;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    let weak = Arc::downgrade(inner);
    tokio::spawn(reconnect_loop(weak));
}

async fn reconnect_loop(weak: Weak<RobustInner>) {
    let mut attempt: u64 = 0;
    loop {
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if inner.transport.state() == ConnState::Closed {
            inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        attempt += 1;
        match inner.transport.connect().await {
            Ok(()) => {
                tracing::info!("Reconnected after {} attempt(s)", attempt);
                inner.reconnecting.store(false, Ordering::SeqCst);
                flush_queue(&inner).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
            }
        }

        let delay = inner.config.reconnect_delay;
        drop(inner);
        tokio::time::sleep(delay).await;
    }
}

/// Send every queued call, preserving FIFO send order. Replies are
/// awaited concurrently on their own tasks.
async fn flush_queue(inner: &Arc<RobustInner>) {
    let drained: Vec<_> = {
        let mut queue = inner.queue.lock().expect("queue lock poisoned");
        queue.drain(..).collect()
    };
    if drained.is_empty() {
        return;
    }
    tracing::info!("Flushing {} queued call(s)", drained.len());

    for call in drained {
        let dispatch = inner.transport.dispatch().clone();
        let label = MethodRegistry::qualified(&call.program, &call.method);

        match call.reply_tx {
            None => {
                if let Err(e) = dispatch
                    .notify_raw(&call.program, &call.method, call.arg)
                    .await
                {
                    tracing::warn!("Queued notify to {} failed: {}", label, e);
                }
            }
            Some(tx) => {
                match dispatch
                    .start_invoke(&call.program, &call.method, call.arg)
                    .await
                {
                    Ok(pending) => {
                        let config = inner.config.clone();
                        tokio::spawn(async move {
                            let outcome =
                                timed_wait(pending.wait(), &config, &label).await;
                            let _ = tx.send(outcome);
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            }
        }
    }
}
