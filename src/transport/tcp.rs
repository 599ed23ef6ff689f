//! Plain TCP streams and the connector that dials them.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{Connector, WireStream};
use crate::error::Result;

/// A [`WireStream`] over a connected TCP socket.
///
/// Halves are split so reads and writes never contend; `close` takes
/// both halves out, making it idempotent.
pub struct TcpWireStream {
    read: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    write: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    peer: Option<SocketAddr>,
}

impl TcpWireStream {
    /// Wrap a connected socket. Disables Nagle; small RPC frames should
    /// not wait for coalescing.
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            read: tokio::sync::Mutex::new(Some(read)),
            write: tokio::sync::Mutex::new(Some(write)),
            peer,
        }
    }
}

#[async_trait]
impl WireStream for TcpWireStream {
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

    async fn close(&self, force: bool) {
        let write = self.write.lock().await.take();
        if let Some(mut half) = write {
            if !force {
                let _ = half.shutdown().await;
            }
        }
        self.read.lock().await.take();
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Dials a fixed address, producing a fresh [`TcpWireStream`] per
/// connect.
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    /// Create a connector for `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn WireStream>> {
        let stream = TcpStream::connect(self.addr).await?;
        Ok(Box::new(TcpWireStream::new(stream)))
    }

    fn remote_label(&self) -> String {
        self.addr.to_string()
    }
}
