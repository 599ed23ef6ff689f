//! Request handlers and their registry.
//!
//! A handler serves one named method. It receives a [`Bundle`] carrying
//! the raw argument bytes plus the reply channel, and runs on its own
//! task. Typed closures are wrapped by [`TypedHandler`], which decodes
//! the argument before calling through.

mod bundle;
mod registry;

pub use bundle::Bundle;
pub use registry::MethodRegistry;

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;

use crate::error::Result;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for method handlers.
///
/// A handler that returns `Err` without having replied gets an automatic
/// error reply carrying the error's message.
pub trait Handler: Send + Sync + 'static {
    /// Handle one incoming invoke or notify.
    fn call(&self, bundle: Bundle) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the argument before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, Bundle) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, Bundle) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, Bundle) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, bundle: Bundle) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match bundle.arg() {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed, bundle);
        Box::pin(fut)
    }
}
