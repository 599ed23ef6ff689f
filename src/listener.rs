//! TCP listener producing one accepted transport per connection.
//!
//! All accepted connections share the listener's method registry, so a
//! handler registered once serves every client. Live children are
//! tracked in a map keyed by a monotone connection id; a child removes
//! itself when its transport closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;

use crate::error::Result;
use crate::handler::MethodRegistry;
use crate::transport::{TcpWireStream, Transport, TransportConfig};

/// Accepts TCP connections and serves them from a shared registry.
pub struct Listener {
    listener: TcpListener,
    registry: MethodRegistry,
    config: TransportConfig,
    children: Arc<Mutex<HashMap<u64, Transport>>>,
    next_child_id: AtomicU64,
}

impl Listener {
    /// Bind to `addr`. Port 0 picks an ephemeral port; see
    /// [`Listener::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        registry: MethodRegistry,
        config: TransportConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
            next_child_id: AtomicU64::new(1),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of currently live accepted connections.
    pub fn connection_count(&self) -> usize {
        self.children.lock().expect("children lock poisoned").len()
    }

    /// Accept loop. Runs until the accept call fails; typically spawned.
    pub async fn serve(&self) -> Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            tracing::info!("Accepted connection from {}", peer);

            let stream = Box::new(TcpWireStream::new(socket));
            let transport = match Transport::accepted(
                stream,
                self.registry.clone(),
                self.config.clone(),
            )
            .await
            {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("Rejected connection from {}: {}", peer, e);
                    continue;
                }
            };

            let id = self.next_child_id.fetch_add(1, Ordering::SeqCst);
            self.children
                .lock()
                .expect("children lock poisoned")
                .insert(id, transport.clone());

            // Child removes itself on teardown; the hook is installed
            // before the read loop starts so no close can be missed
            let children = Arc::downgrade(&self.children);
            transport.set_on_closed(move || {
                if let Some(children) = children.upgrade() {
                    children.lock().expect("children lock poisoned").remove(&id);
                }
            });
            transport.start();
        }
    }

    /// Close every live accepted connection.
    pub async fn close_all(&self) {
        let children: Vec<Transport> = {
            let map = self.children.lock().expect("children lock poisoned");
            map.values().cloned().collect()
        };
        for child in children {
            child.close().await;
        }
    }
}
