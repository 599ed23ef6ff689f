//! Connection lifecycle: pluggable streams, the transport state machine,
//! and the reconnecting robust layer.
//!
//! A [`WireStream`] is the capability surface the runtime reads and
//! writes through; TCP is provided here and TLS/SSH layers can plug in
//! without the core knowing. A [`Transport`] owns one logical connection:
//! it installs a [`StreamWrapper`] per physical stream, runs a dedicated
//! read loop feeding the dispatch, and tears everything down exactly once
//! per stream. [`RobustTransport`] adds reconnection and call queueing on
//! top.

mod robust;
mod tcp;

#[cfg(test)]
pub(crate) mod testutil;

pub use robust::{RobustConfig, RobustTransport};
pub use tcp::{TcpConnector, TcpWireStream};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::dispatch::{Dispatch, DEFAULT_MAX_CONCURRENT_HANDLERS};
use crate::error::{HandshakeCategory, HandshakeError, Result, WirecallError};
use crate::handler::MethodRegistry;
use crate::protocol::DEFAULT_MAX_PAYLOAD;

/// Default read buffer size: 64KB.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// A bidirectional byte stream the runtime can drive.
///
/// Implementations must make `close` idempotent; the runtime may call it
/// from more than one teardown path.
#[async_trait]
pub trait WireStream: Send + Sync + 'static {
    /// Run the stream's handshake, if it has one. Called once, before
    /// any read or write. The default is a no-op.
    async fn start(&self) -> std::result::Result<(), HandshakeError> {
        Ok(())
    }

    /// Read up to `max` bytes. An empty result means EOF.
    async fn read(&self, max: usize) -> std::io::Result<Bytes>;

    /// Write all of `buf`.
    async fn write(&self, buf: &[u8]) -> std::io::Result<()>;

    /// Close the stream. `force` skips any graceful shutdown.
    async fn close(&self, force: bool);

    /// The peer's address, when the stream has one.
    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// Produces fresh streams for connect and reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new stream.
    async fn connect(&self) -> Result<Box<dyn WireStream>>;

    /// Label for logs ("127.0.0.1:4000" etc.).
    fn remote_label(&self) -> String;
}

/// One live physical stream plus its teardown bookkeeping.
///
/// The generation number is unique per installed stream, so a delayed
/// close from an old stream can be told apart from the current one.
pub(crate) struct StreamWrapper {
    stream: Box<dyn WireStream>,
    generation: u64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl StreamWrapper {
    pub(crate) fn new(stream: Box<dyn WireStream>, generation: u64) -> Self {
        Self {
            stream,
            generation,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the wrapper closed and wake its read loop. Idempotent.
    pub(crate) fn begin_close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }

    pub(crate) async fn shutdown_signal(&self) {
        self.shutdown.notified().await
    }

    pub(crate) async fn read(&self, max: usize) -> std::io::Result<Bytes> {
        self.stream.read(max).await
    }

    pub(crate) async fn write(&self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write(buf).await
    }

    pub(crate) async fn close_stream(&self, force: bool) {
        self.stream.close(force).await
    }

    pub(crate) fn remote_address(&self) -> Option<SocketAddr> {
        self.stream.remote_address()
    }
}

/// The send side of a connection: the currently installed wrapper plus a
/// lock serializing whole frames onto it.
pub(crate) struct Outbound {
    wrapper: Mutex<Option<Arc<StreamWrapper>>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Outbound {
    pub(crate) fn new() -> Self {
        Self {
            wrapper: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn install(&self, wrapper: Arc<StreamWrapper>) {
        *self.wrapper.lock().expect("outbound lock poisoned") = Some(wrapper);
    }

    pub(crate) fn current(&self) -> Option<Arc<StreamWrapper>> {
        self.wrapper.lock().expect("outbound lock poisoned").clone()
    }

    pub(crate) fn take(&self) -> Option<Arc<StreamWrapper>> {
        self.wrapper.lock().expect("outbound lock poisoned").take()
    }

    /// Remove `wrapper` if it is still the installed one. Returns true
    /// if it was removed; false means a newer stream took its place.
    pub(crate) fn take_if_current(&self, wrapper: &Arc<StreamWrapper>) -> bool {
        let mut slot = self.wrapper.lock().expect("outbound lock poisoned");
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, wrapper) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Write one complete frame. Frames from concurrent senders never
    /// interleave: the write lock is held for the whole buffer.
    pub(crate) async fn send(&self, buf: &[u8]) -> Result<()> {
        let wrapper = self.current().ok_or(WirecallError::NoActiveStream)?;
        if wrapper.is_closed() {
            return Err(WirecallError::NoActiveStream);
        }

        let _guard = self.write_lock.lock().await;
        wrapper.write(buf).await?;
        Ok(())
    }
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No stream; a connect (or reconnect) may establish one.
    Disconnected,
    /// A connect is in progress.
    Connecting,
    /// A stream is installed and its read loop is running.
    Connected,
    /// Explicitly closed; stays closed.
    Closed,
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest accepted frame payload.
    pub max_payload: usize,
    /// Bytes requested per stream read.
    pub read_buffer_size: usize,
    /// Cap on concurrently running handlers.
    pub max_concurrent_handlers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

struct TransportInner {
    dispatch: Arc<Dispatch>,
    config: TransportConfig,
    connector: Option<Box<dyn Connector>>,
    state: Mutex<ConnState>,
    generation: AtomicU64,
    explicit_close: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    handshake_errors: Mutex<HashMap<HandshakeCategory, String>>,
    on_disconnect: Mutex<Option<Hook>>,
    on_closed: Mutex<Option<Hook>>,
}

/// One logical connection: state machine, read loop, send path.
///
/// `Transport` is a cheap clone over shared state. Dropping every clone
/// ends the read loop at its next wakeup; the loop itself holds only a
/// weak reference back.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Create a client transport. No stream exists until `connect`.
    pub fn new(
        connector: Box<dyn Connector>,
        registry: MethodRegistry,
        config: TransportConfig,
    ) -> Self {
        Self::build(Some(connector), registry, config)
    }

    fn build(
        connector: Option<Box<dyn Connector>>,
        registry: MethodRegistry,
        config: TransportConfig,
    ) -> Self {
        let dispatch = Dispatch::new(
            Arc::new(Outbound::new()),
            registry,
            config.max_payload,
            config.max_concurrent_handlers,
        );
        Self {
            inner: Arc::new(TransportInner {
                dispatch,
                config,
                connector,
                state: Mutex::new(ConnState::Disconnected),
                generation: AtomicU64::new(0),
                explicit_close: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
                handshake_errors: Mutex::new(HashMap::new()),
                on_disconnect: Mutex::new(None),
                on_closed: Mutex::new(None),
            }),
        }
    }

    /// Wrap an already established stream (listener side). Runs the
    /// stream's handshake and installs it, but does not spawn the read
    /// loop; call [`Transport::start`] once hooks are in place.
    pub async fn accepted(
        stream: Box<dyn WireStream>,
        registry: MethodRegistry,
        config: TransportConfig,
    ) -> Result<Self> {
        let transport = Self::build(None, registry, config);
        if let Err(hs) = stream.start().await {
            transport.record_handshake_error(&hs);
            stream.close(true).await;
            return Err(hs.into());
        }
        transport.install_stream(stream);
        Ok(transport)
    }

    /// Spawn the read loop for the currently installed stream.
    pub fn start(&self) {
        match self.inner.dispatch.outbound().current() {
            Some(wrapper) => self.spawn_read_loop(wrapper),
            None => tracing::warn!("start called with no installed stream"),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    /// True while a stream is installed.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The dispatch behind this transport.
    pub fn dispatch(&self) -> &Arc<Dispatch> {
        &self.inner.dispatch
    }

    /// The peer address of the current stream, if any.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner
            .dispatch
            .outbound()
            .current()
            .and_then(|w| w.remote_address())
    }

    /// The recorded handshake failure for a category, if one occurred.
    pub fn handshake_error(&self, category: HandshakeCategory) -> Option<String> {
        self.inner
            .handshake_errors
            .lock()
            .expect("handshake lock poisoned")
            .get(&category)
            .cloned()
    }

    /// Hook fired on a non-explicit disconnect (the robust layer's
    /// reconnect trigger).
    pub fn set_on_disconnect<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        *self
            .inner
            .on_disconnect
            .lock()
            .expect("hook lock poisoned") = Some(Box::new(hook));
    }

    /// Hook fired once per torn-down stream, explicit or not.
    pub fn set_on_closed<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        *self.inner.on_closed.lock().expect("hook lock poisoned") = Some(Box::new(hook));
    }

    /// Establish a stream via the connector.
    ///
    /// Idempotent while connected. Fails fast after an explicit close.
    /// On handshake failure the error is also recorded under its
    /// category for later inspection.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.explicit_close.load(Ordering::SeqCst) {
            return Err(WirecallError::Cancelled(
                "transport explicitly closed".to_string(),
            ));
        }

        let _guard = self.inner.connect_lock.lock().await;

        // An explicit close may have won the lock first
        if self.inner.explicit_close.load(Ordering::SeqCst) {
            return Err(WirecallError::Cancelled(
                "transport explicitly closed".to_string(),
            ));
        }
        if self.state() == ConnState::Connected {
            return Ok(());
        }
        let connector = self.inner.connector.as_ref().ok_or_else(|| {
            WirecallError::Protocol("transport has no connector".to_string())
        })?;
        self.set_state(ConnState::Connecting);

        let stream = match connector.connect().await {
            Ok(s) => s,
            Err(e) => {
                self.set_state(ConnState::Disconnected);
                return Err(e);
            }
        };

        if let Err(hs) = stream.start().await {
            self.record_handshake_error(&hs);
            self.set_state(ConnState::Disconnected);
            stream.close(true).await;
            return Err(hs.into());
        }

        // A concurrent explicit close may have landed while we were
        // dialing; installing now would resurrect a closed transport
        if self.inner.explicit_close.load(Ordering::SeqCst) {
            stream.close(true).await;
            self.set_state(ConnState::Closed);
            return Err(WirecallError::Cancelled(
                "transport explicitly closed".to_string(),
            ));
        }

        let wrapper = self.install_stream(stream);
        tracing::info!(
            "Connected to {} (generation {})",
            connector.remote_label(),
            wrapper.generation()
        );
        self.spawn_read_loop(wrapper);
        Ok(())
    }

    /// Explicitly close the transport. Pending calls are cancelled, the
    /// stream is shut down, and further connects are refused.
    pub async fn close(&self) {
        if self.inner.explicit_close.swap(true, Ordering::SeqCst) {
            return;
        }
        // A dial in progress holds this lock; waiting for it means no
        // stream can be installed after the teardown below
        let _guard = self.inner.connect_lock.lock().await;
        self.set_state(ConnState::Closed);

        if let Some(wrapper) = self.inner.dispatch.outbound().take() {
            wrapper.begin_close();
            wrapper.close_stream(false).await;
        }

        self.inner.dispatch.reset("transport explicitly closed");
        self.fire_on_closed();
    }

    /// Call a remote method and decode the reply.
    pub async fn call<A, R>(&self, program: &str, method: &str, arg: &A) -> Result<R>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.inner.dispatch.invoke(program, method, arg).await
    }

    /// Send a fire-and-forget notification.
    pub async fn notify<A: serde::Serialize>(
        &self,
        program: &str,
        method: &str,
        arg: &A,
    ) -> Result<()> {
        self.inner.dispatch.notify(program, method, arg).await
    }

    fn set_state(&self, state: ConnState) {
        *self.inner.state.lock().expect("state lock poisoned") = state;
    }

    fn record_handshake_error(&self, hs: &HandshakeError) {
        self.inner
            .handshake_errors
            .lock()
            .expect("handshake lock poisoned")
            .insert(hs.category, hs.message.clone());
    }

    fn install_stream(&self, stream: Box<dyn WireStream>) -> Arc<StreamWrapper> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let wrapper = Arc::new(StreamWrapper::new(stream, generation));
        self.inner.dispatch.outbound().install(wrapper.clone());
        self.set_state(ConnState::Connected);
        wrapper
    }

    fn spawn_read_loop(&self, wrapper: Arc<StreamWrapper>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(read_loop(weak, wrapper));
    }

    fn fire_on_closed(&self) {
        let hooks = self.inner.on_closed.lock().expect("hook lock poisoned");
        if let Some(hook) = hooks.as_ref() {
            hook();
        }
    }
}

/// Dedicated per-stream read task.
///
/// Holds only a weak reference to the transport, so the loop never keeps
/// its owner alive; when every `Transport` clone is gone the loop exits
/// at its next wakeup.
async fn read_loop(weak: Weak<TransportInner>, wrapper: Arc<StreamWrapper>) {
    loop {
        if wrapper.is_closed() {
            break;
        }
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        let max = inner.config.read_buffer_size;

        let read = tokio::select! {
            r = wrapper.read(max) => r,
            _ = wrapper.shutdown_signal() => break,
        };

        match read {
            Ok(chunk) if chunk.is_empty() => {
                tracing::info!(
                    "Stream closed by peer (generation {})",
                    wrapper.generation()
                );
                break;
            }
            Ok(chunk) => {
                if let Err(e) = inner.dispatch.ingest(chunk).await {
                    tracing::error!("Read loop error: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Read error: {}", e);
                break;
            }
        }
    }

    wrapper.begin_close();
    wrapper.close_stream(false).await;

    if let Some(inner) = weak.upgrade() {
        handle_close(&inner, &wrapper);
    }
}

/// Teardown after a read loop exits. Stale wrappers (a newer stream has
/// already been installed, or an explicit close already cleaned up) are
/// ignored.
fn handle_close(inner: &Arc<TransportInner>, wrapper: &Arc<StreamWrapper>) {
    if !inner.dispatch.outbound().take_if_current(wrapper) {
        tracing::debug!(
            "Ignoring close of stale stream (generation {})",
            wrapper.generation()
        );
        return;
    }

    let explicit = inner.explicit_close.load(Ordering::SeqCst);
    {
        let mut state = inner.state.lock().expect("state lock poisoned");
        *state = if explicit {
            ConnState::Closed
        } else {
            ConnState::Disconnected
        };
    }

    inner.dispatch.reset("connection reset");

    if !explicit {
        let hook = inner.on_disconnect.lock().expect("hook lock poisoned");
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }
    let hook = inner.on_closed.lock().expect("hook lock poisoned");
    if let Some(hook) = hook.as_ref() {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::DuplexConnector;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_and_call_over_duplex() {
        let server_registry = MethodRegistry::new();
        server_registry.add("P.1", "foo", |arg: i32, bundle| async move {
            bundle.reply(&(arg + 2)).await
        });

        let (connector, mut accept_rx) = DuplexConnector::new();
        let transport = Transport::new(
            Box::new(connector),
            MethodRegistry::new(),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnState::Connected);

        let server_stream = accept_rx.recv().await.unwrap();
        let server = Transport::accepted(
            server_stream,
            server_registry,
            TransportConfig::default(),
        )
        .await
        .unwrap();
        server.start();

        let result: i32 = transport.call("P.1", "foo", &4i32).await.unwrap();
        assert_eq!(result, 6);

        transport.close().await;
        assert_eq!(transport.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_connected() {
        let (connector, mut accept_rx) = DuplexConnector::new();
        let transport = Transport::new(
            Box::new(connector),
            MethodRegistry::new(),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();
        let _server_stream = accept_rx.recv().await.unwrap();

        // Second connect is a no-op, no new stream is requested
        transport.connect().await.unwrap();
        assert!(accept_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_after_explicit_close_fails() {
        let (connector, _accept_rx) = DuplexConnector::new();
        let transport = Transport::new(
            Box::new(connector),
            MethodRegistry::new(),
            TransportConfig::default(),
        );
        transport.close().await;

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, WirecallError::Cancelled(_)));
        assert_eq!(transport.state(), ConnState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_and_connect_stays_closed() {
        // Whichever of the two wins, a closed transport must not end up
        // with a live stream
        for _ in 0..20 {
            let (connector, _accept_rx) = DuplexConnector::new();
            let transport = Transport::new(
                Box::new(connector),
                MethodRegistry::new(),
                TransportConfig::default(),
            );

            let t1 = transport.clone();
            let connecting = tokio::spawn(async move { t1.connect().await });
            let t2 = transport.clone();
            let closing = tokio::spawn(async move { t2.close().await });

            let _ = connecting.await.unwrap();
            closing.await.unwrap();

            assert_eq!(transport.state(), ConnState::Closed);
            assert!(!transport.is_connected());
            let err = transport.connect().await.unwrap_err();
            assert!(matches!(err, WirecallError::Cancelled(_)));
        }
    }

    #[tokio::test]
    async fn test_close_cancels_pending_calls() {
        let (connector, mut accept_rx) = DuplexConnector::new();
        let transport = Transport::new(
            Box::new(connector),
            MethodRegistry::new(),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();
        // Peer never answers
        let _server_stream = accept_rx.recv().await.unwrap();

        let t = transport.clone();
        let pending =
            tokio::spawn(async move { t.call::<i32, i32>("P", "hang", &1).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, WirecallError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_peer_eof_resets_in_flight_and_fires_disconnect_hook() {
        let (connector, mut accept_rx) = DuplexConnector::new();
        let transport = Transport::new(
            Box::new(connector),
            MethodRegistry::new(),
            TransportConfig::default(),
        );

        let (hook_tx, mut hook_rx) = tokio::sync::mpsc::unbounded_channel();
        transport.set_on_disconnect(move || {
            let _ = hook_tx.send(());
        });

        transport.connect().await.unwrap();
        let server_stream = accept_rx.recv().await.unwrap();

        let t = transport.clone();
        let pending =
            tokio::spawn(async move { t.call::<i32, i32>("P", "hang", &1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Peer drops its end: EOF on our side
        server_stream.close(true).await;
        drop(server_stream);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, WirecallError::Cancelled(_)));

        tokio::time::timeout(Duration::from_secs(1), hook_rx.recv())
            .await
            .expect("disconnect hook not fired")
            .unwrap();
        assert_eq!(transport.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_failure_is_recorded_by_category() {
        let (connector, _accept_rx) =
            DuplexConnector::failing_handshake(HandshakeCategory::Negotiation, "bad version");
        let transport = Transport::new(
            Box::new(connector),
            MethodRegistry::new(),
            TransportConfig::default(),
        );

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, WirecallError::Handshake(_)));
        assert_eq!(transport.state(), ConnState::Disconnected);
        assert_eq!(
            transport.handshake_error(HandshakeCategory::Negotiation),
            Some("bad version".to_string())
        );
        assert!(transport
            .handshake_error(HandshakeCategory::HostAuth)
            .is_none());
    }
}
