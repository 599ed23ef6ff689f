//! Per-request context passed to handlers.
//!
//! A [`Bundle`] carries the decoded envelope metadata, the raw argument
//! bytes, and the way back: `reply`/`reply_error` route through the
//! dispatch that served the request. Replies are exactly-once; a second
//! reply is logged and dropped, and replying to a notify is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::MsgPackCodec;
use crate::dispatch::Dispatch;
use crate::error::Result;

struct BundleInner {
    dispatch: Arc<Dispatch>,
    seq_id: Option<u64>,
    method: String,
    replied: AtomicBool,
}

/// Context passed to method handlers.
///
/// `Bundle` is `Clone` and can be moved across tasks; all clones share
/// the one reply slot.
#[derive(Clone)]
pub struct Bundle {
    inner: Arc<BundleInner>,
    arg: Bytes,
}

impl Bundle {
    pub(crate) fn new(
        dispatch: Arc<Dispatch>,
        seq_id: Option<u64>,
        method: String,
        arg: Bytes,
    ) -> Self {
        Self {
            inner: Arc::new(BundleInner {
                dispatch,
                seq_id,
                method,
                replied: AtomicBool::new(false),
            }),
            arg,
        }
    }

    /// The qualified method name this request was addressed to.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// The caller's seq id, if this is an invoke.
    pub fn seq_id(&self) -> Option<u64> {
        self.inner.seq_id
    }

    /// True for invokes, false for notifies.
    pub fn expects_reply(&self) -> bool {
        self.inner.seq_id.is_some()
    }

    /// Decode the argument to a typed value.
    pub fn arg<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.arg)
    }

    /// The raw MsgPack argument bytes.
    pub fn arg_bytes(&self) -> &Bytes {
        &self.arg
    }

    /// Send a successful reply.
    pub async fn reply<T: serde::Serialize>(&self, result: &T) -> Result<()> {
        let bytes = Bytes::from(MsgPackCodec::encode(result)?);
        self.send_reply(None, bytes).await
    }

    /// Send a successful reply with pre-encoded MsgPack bytes.
    pub async fn reply_raw(&self, result: Bytes) -> Result<()> {
        self.send_reply(None, result).await
    }

    /// Send an error reply. The result slot is nil on the wire.
    pub async fn reply_error(&self, message: &str) -> Result<()> {
        self.send_reply(Some(message.to_string()), Bytes::from_static(&[0xc0]))
            .await
    }

    async fn send_reply(&self, error: Option<String>, result: Bytes) -> Result<()> {
        let seq_id = match self.inner.seq_id {
            Some(id) => id,
            None => {
                tracing::debug!("Reply to notify {} dropped", self.inner.method);
                return Ok(());
            }
        };

        if self.inner.replied.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                "Duplicate reply to {} (seq {}) dropped",
                self.inner.method,
                seq_id
            );
            return Ok(());
        }

        self.inner.dispatch.send_reply(seq_id, error, result).await
    }

    /// True once a reply has been sent (or attempted).
    pub(crate) fn has_replied(&self) -> bool {
        self.inner.replied.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatch;
    use crate::handler::MethodRegistry;

    fn detached_bundle(seq_id: Option<u64>) -> Bundle {
        let dispatch = Dispatch::detached(MethodRegistry::new());
        let arg = Bytes::from(MsgPackCodec::encode(&5i32).unwrap());
        Bundle::new(dispatch, seq_id, "P.1.foo".to_string(), arg)
    }

    #[test]
    fn test_metadata_accessors() {
        let bundle = detached_bundle(Some(7));
        assert_eq!(bundle.method(), "P.1.foo");
        assert_eq!(bundle.seq_id(), Some(7));
        assert!(bundle.expects_reply());

        let notify = detached_bundle(None);
        assert!(!notify.expects_reply());
    }

    #[test]
    fn test_typed_arg_decoding() {
        let bundle = detached_bundle(Some(1));
        let value: i32 = bundle.arg().unwrap();
        assert_eq!(value, 5);

        let wrong: Result<String> = bundle.arg();
        assert!(wrong.is_err());
    }

    #[tokio::test]
    async fn test_reply_to_notify_is_noop() {
        let bundle = detached_bundle(None);
        assert!(bundle.reply(&1i32).await.is_ok());
        assert!(!bundle.has_replied());
    }

    #[tokio::test]
    async fn test_second_reply_is_dropped() {
        let bundle = detached_bundle(Some(3));

        // No stream behind the detached dispatch, so the first attempt
        // fails on send, but it still claims the reply slot
        assert!(bundle.reply(&1i32).await.is_err());
        assert!(bundle.has_replied());

        // Clones share the slot
        assert!(bundle.clone().reply(&2i32).await.is_ok());
    }
}
