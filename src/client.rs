//! Program-bound convenience wrapper over a transport.
//!
//! Binds a program namespace once so call sites pass bare method names.
//!
//! # Example
//!
//! ```ignore
//! use wirecall::{Client, Transport};
//!
//! let client = Client::new(transport, "P.1");
//! let y: i32 = client.call("foo", &4i32).await?;
//! ```

use crate::error::Result;
use crate::transport::Transport;

/// A handle scoped to one remote program.
#[derive(Clone)]
pub struct Client {
    transport: Transport,
    program: String,
}

impl Client {
    /// Bind `program` on the given transport.
    pub fn new(transport: Transport, program: impl Into<String>) -> Self {
        Self {
            transport,
            program: program.into(),
        }
    }

    /// The bound program namespace.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Call `method` in the bound program.
    pub async fn call<A, R>(&self, method: &str, arg: &A) -> Result<R>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.transport.call(&self.program, method, arg).await
    }

    /// Notify `method` in the bound program.
    pub async fn notify<A: serde::Serialize>(&self, method: &str, arg: &A) -> Result<()> {
        self.transport.notify(&self.program, method, arg).await
    }
}
