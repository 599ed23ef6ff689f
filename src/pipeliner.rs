//! Width-bounded concurrent runner with indexed results.
//!
//! A pipeliner runs caller-supplied futures at most `width` at a time.
//! Results are keyed by submission index, so callers can fire a batch of
//! calls, `flush`, and read each outcome back by the order it was
//! pushed. Typical use is bounding in-flight RPC calls:
//!
//! ```ignore
//! let pipeliner = Pipeliner::new(10);
//! for i in 0..100 {
//!     let t = transport.clone();
//!     pipeliner.push(async move { t.call::<_, i32>("P", "work", &i).await })?;
//! }
//! let results = pipeliner.flush().await;
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{Result, WirecallError};
use crate::handler::BoxFuture;

struct PipeState<T> {
    queue: VecDeque<(usize, BoxFuture<'static, T>)>,
    running: usize,
    next_index: usize,
    results: HashMap<usize, T>,
    flushing: bool,
    flush_tx: Option<oneshot::Sender<()>>,
}

struct PipeInner<T> {
    width: usize,
    state: Mutex<PipeState<T>>,
    /// Serializes flushes; two concurrent flushes must not both
    /// register a drain waiter.
    flush_lock: tokio::sync::Mutex<()>,
}

/// Bounded-concurrency future runner.
///
/// Cheap to clone; all clones feed the same window.
pub struct Pipeliner<T> {
    inner: Arc<PipeInner<T>>,
}

impl<T> Clone for Pipeliner<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pipeliner<T> {
    /// Create a pipeliner running at most `width` futures at a time.
    /// A width of 0 is treated as 1.
    pub fn new(width: usize) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                width: width.max(1),
                state: Mutex::new(PipeState {
                    queue: VecDeque::new(),
                    running: 0,
                    next_index: 0,
                    results: HashMap::new(),
                    flushing: false,
                    flush_tx: None,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The concurrency bound.
    pub fn width(&self) -> usize {
        self.inner.width
    }

    /// Submit a future. Runs immediately if a slot is free, otherwise
    /// waits in line. Returns the future's submission index.
    ///
    /// # Errors
    ///
    /// Returns `PipelinerClosed` once `flush` has been called.
    pub fn push<F>(&self, fut: F) -> Result<usize>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let boxed: BoxFuture<'static, T> = Box::pin(fut);
        let index;
        {
            let mut state = self.inner.state.lock().expect("pipeliner lock poisoned");
            if state.flushing {
                return Err(WirecallError::PipelinerClosed);
            }
            index = state.next_index;
            state.next_index += 1;

            if state.running >= self.inner.width {
                state.queue.push_back((index, boxed));
                return Ok(index);
            }
            state.running += 1;
        }
        launch(self.inner.clone(), index, boxed);
        Ok(index)
    }

    /// Stop accepting pushes and wait for every submitted future. The
    /// result map is keyed by submission index.
    ///
    /// Concurrent flushes are serialized: each one waits until the
    /// window has drained, and the first to finish takes the results.
    pub async fn flush(&self) -> HashMap<usize, T> {
        let _guard = self.inner.flush_lock.lock().await;
        let rx = {
            let mut state = self.inner.state.lock().expect("pipeliner lock poisoned");
            state.flushing = true;
            if state.running == 0 && state.queue.is_empty() {
                return std::mem::take(&mut state.results);
            }
            let (tx, rx) = oneshot::channel();
            state.flush_tx = Some(tx);
            rx
        };

        // Sender dropping without firing cannot happen while the state
        // holds it, but a lost signal just means everything drained
        let _ = rx.await;

        let mut state = self.inner.state.lock().expect("pipeliner lock poisoned");
        std::mem::take(&mut state.results)
    }

    /// Futures currently running.
    pub fn running(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("pipeliner lock poisoned")
            .running
    }
}

/// Run one future on its own task; on completion record the result,
/// refill the window from the queue, and wake the flusher if drained.
fn launch<T: Send + 'static>(inner: Arc<PipeInner<T>>, index: usize, fut: BoxFuture<'static, T>) {
    tokio::spawn(async move {
        let result = fut.await;

        let next = {
            let mut state = inner.state.lock().expect("pipeliner lock poisoned");
            state.results.insert(index, result);

            match state.queue.pop_front() {
                Some(next) => Some(next),
                None => {
                    state.running -= 1;
                    if state.flushing && state.running == 0 {
                        if let Some(tx) = state.flush_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    None
                }
            }
        };

        if let Some((next_index, next_fut)) = next {
            launch(inner, next_index, next_fut);
        }
    });
}
