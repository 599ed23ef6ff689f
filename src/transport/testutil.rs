//! In-memory streams for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};

use super::{Connector, Outbound, StreamWrapper, WireStream};
use crate::error::{HandshakeCategory, HandshakeError, Result};

/// Sink that records everything written to it. Reads pend forever.
pub(crate) struct CaptureStream {
    data: Mutex<Vec<u8>>,
    notify: Notify,
}

impl CaptureStream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// All bytes written so far.
    pub(crate) fn written(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.lock().unwrap())
    }

    /// Wait until at least one write has landed.
    pub(crate) async fn wait_for_write(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.data.lock().unwrap().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

struct CaptureHandle(Arc<CaptureStream>);

#[async_trait]
impl WireStream for CaptureHandle {
    async fn read(&self, _max: usize) -> std::io::Result<Bytes> {
        std::future::pending().await
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<()> {
        self.0.data.lock().unwrap().extend_from_slice(buf);
        self.0.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self, _force: bool) {}
}

/// Install a capture sink as the outbound stream. Returns the capture
/// handle for inspecting sent frames.
pub(crate) fn install_capture(outbound: &Arc<Outbound>) -> Arc<CaptureStream> {
    let capture = CaptureStream::new();
    let wrapper = Arc::new(StreamWrapper::new(
        Box::new(CaptureHandle(capture.clone())),
        1,
    ));
    outbound.install(wrapper);
    capture
}

/// A `WireStream` over one end of a `tokio::io::duplex` pipe.
pub(crate) struct DuplexWireStream {
    read: tokio::sync::Mutex<Option<ReadHalf<DuplexStream>>>,
    write: tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>,
    handshake_fail: Option<(HandshakeCategory, String)>,
}

impl DuplexWireStream {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self::with_handshake(stream, None)
    }

    fn with_handshake(
        stream: DuplexStream,
        handshake_fail: Option<(HandshakeCategory, String)>,
    ) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read: tokio::sync::Mutex::new(Some(read)),
            write: tokio::sync::Mutex::new(Some(write)),
            handshake_fail,
        }
    }
}

#[async_trait]
impl WireStream for DuplexWireStream {
    async fn start(&self) -> std::result::Result<(), HandshakeError> {
        match &self.handshake_fail {
            Some((category, message)) => Err(HandshakeError::new(*category, message.clone())),
            None => Ok(()),
        }
    }

    async fn read(&self, max: usize) -> std::io::Result<Bytes> {
        let mut guard = self.read.lock().await;
        let half = match guard.as_mut() {
            Some(half) => half,
            None => return Ok(Bytes::new()),
        };
        let mut buf = BytesMut::with_capacity(max);
        let n = half.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        Ok(buf.freeze())
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut guard = self.write.lock().await;
        match guard.as_mut() {
            Some(half) => {
                half.write_all(buf).await?;
                half.flush().await
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream closed",
            )),
        }
    }

    async fn close(&self, _force: bool) {
        // Dropping both halves signals EOF to the peer
        self.read.lock().await.take();
        self.write.lock().await.take();
    }
}

/// Connector over in-process duplex pipes. Every `connect` hands the
/// server end of a fresh pipe to the accept channel.
pub(crate) struct DuplexConnector {
    accept_tx: mpsc::UnboundedSender<Box<dyn WireStream>>,
    handshake_fail: Option<(HandshakeCategory, String)>,
}

impl DuplexConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Box<dyn WireStream>>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                handshake_fail: None,
            },
            accept_rx,
        )
    }

    /// A connector whose client-side streams fail their handshake.
    pub(crate) fn failing_handshake(
        category: HandshakeCategory,
        message: &str,
    ) -> (Self, mpsc::UnboundedReceiver<Box<dyn WireStream>>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                handshake_fail: Some((category, message.to_string())),
            },
            accept_rx,
        )
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<Box<dyn WireStream>> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _ = self.accept_tx.send(Box::new(DuplexWireStream::new(server)));
        Ok(Box::new(DuplexWireStream::with_handshake(
            client,
            self.handshake_fail.clone(),
        )))
    }

    fn remote_label(&self) -> String {
        "duplex".to_string()
    }
}
