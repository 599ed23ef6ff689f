//! # wirecall
//!
//! Bidirectional MessagePack-RPC runtime over pluggable byte streams.
//!
//! Either side of a connection can expose methods and call the peer's.
//! Frames are length-prefixed MsgPack envelopes; calls correlate replies
//! by seq id, so many can be in flight at once. The transport layer
//! survives stream loss: the robust variant reconnects and queues calls
//! made while offline, and a pipeliner bounds the concurrency of large
//! call batches.
//!
//! ## Example
//!
//! ```ignore
//! use wirecall::{Listener, MethodRegistry, TcpConnector, Transport, TransportConfig};
//!
//! // Server
//! let registry = MethodRegistry::new();
//! registry.add("P.1", "foo", |arg: i32, bundle| async move {
//!     bundle.reply(&(arg + 2)).await
//! });
//! let listener = Listener::bind(addr, registry, TransportConfig::default()).await?;
//! tokio::spawn(async move { listener.serve().await });
//!
//! // Client
//! let transport = Transport::new(
//!     Box::new(TcpConnector::new(addr)),
//!     MethodRegistry::new(),
//!     TransportConfig::default(),
//! );
//! transport.connect().await?;
//! let y: i32 = transport.call("P.1", "foo", &4i32).await?;
//! ```

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod pipeliner;
pub mod protocol;
pub mod transport;

mod client;
mod listener;

pub use client::Client;
pub use dispatch::{Dispatch, PendingReply};
pub use error::{HandshakeCategory, HandshakeError, Result, WirecallError};
pub use handler::{Bundle, MethodRegistry};
pub use listener::Listener;
pub use pipeliner::Pipeliner;
pub use transport::{
    ConnState, Connector, RobustConfig, RobustTransport, TcpConnector, TcpWireStream, Transport,
    TransportConfig, WireStream,
};
