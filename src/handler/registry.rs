//! Registry mapping qualified method names to handlers.
//!
//! Methods are registered explicitly under a program namespace; the
//! lookup key is the dot-joined `"program.method"` string the wire
//! carries. The registry is shared: a server hands the same registry to
//! every accepted connection, and handlers may be added or removed while
//! connections are live.
//!
//! # Example
//!
//! ```
//! use wirecall::handler::MethodRegistry;
//!
//! let registry = MethodRegistry::new();
//! registry.add("P.1", "foo", |arg: i32, bundle| async move {
//!     bundle.reply(&(arg + 2)).await
//! });
//! assert!(registry.get("P.1.foo").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;

use super::{Bundle, Handler, HandlerResult, TypedHandler};

/// Shared, concurrently updatable method table.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the wire lookup key for a program/method pair.
    ///
    /// An empty program yields the bare method name.
    pub fn qualified(program: &str, method: &str) -> String {
        if program.is_empty() {
            method.to_string()
        } else {
            format!("{}.{}", program, method)
        }
    }

    /// Register a typed handler closure under `program.method`.
    ///
    /// Replaces any handler previously registered under the same name.
    pub fn add<F, T, Fut>(&self, program: &str, method: &str, handler: F)
    where
        F: Fn(T, Bundle) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(program, method, Arc::new(TypedHandler::new(handler)));
    }

    /// Register a pre-built handler under `program.method`.
    pub fn add_handler(&self, program: &str, method: &str, handler: Arc<dyn Handler>) {
        let key = Self::qualified(program, method);
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(key, handler);
    }

    /// Remove a handler. Returns true if one was registered.
    pub fn remove(&self, program: &str, method: &str) -> bool {
        let key = Self::qualified(program, method);
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(&key)
            .is_some()
    }

    /// Look up a handler by its qualified wire name.
    pub fn get(&self, qualified: &str) -> Option<Arc<dyn Handler>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(qualified)
            .cloned()
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name() {
        assert_eq!(MethodRegistry::qualified("P.1", "foo"), "P.1.foo");
        assert_eq!(MethodRegistry::qualified("", "foo"), "foo");
    }

    #[test]
    fn test_add_and_get() {
        let registry = MethodRegistry::new();
        registry.add("P.1", "foo", |_: i32, _bundle| async { Ok(()) });

        assert!(registry.get("P.1.foo").is_some());
        assert!(registry.get("P.1.bar").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_program_registers_bare_method() {
        let registry = MethodRegistry::new();
        registry.add("", "status", |_: (), _bundle| async { Ok(()) });

        assert!(registry.get("status").is_some());
    }

    #[test]
    fn test_remove() {
        let registry = MethodRegistry::new();
        registry.add("P.1", "foo", |_: (), _bundle| async { Ok(()) });

        assert!(registry.remove("P.1", "foo"));
        assert!(!registry.remove("P.1", "foo"));
        assert!(registry.get("P.1.foo").is_none());
    }

    #[test]
    fn test_clones_share_table() {
        let registry = MethodRegistry::new();
        let other = registry.clone();

        registry.add("P.1", "foo", |_: (), _bundle| async { Ok(()) });
        assert!(other.get("P.1.foo").is_some());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = MethodRegistry::new();
        registry.add("P.1", "foo", |_: i32, _bundle| async { Ok(()) });
        registry.add("P.1", "foo", |_: String, _bundle| async { Ok(()) });
        assert_eq!(registry.len(), 1);
    }
}
