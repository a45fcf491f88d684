//! Call coalescing for UI-driven operations
//!
//! Sliders fire on every pixel of a drag. Wrapping an operation in a
//! [`Debouncer`] (or a [`KeyedDebouncer`] when calls for different entities
//! must not interfere) turns a burst of calls into a single invocation that
//! runs once the burst has been quiet for `delay`. The last call's arguments
//! win and every caller from the window receives a clone of the one result.
//!
//! Failures are not swallowed: when the wrapped future resolves to an `Err`,
//! every caller sees that `Err`; when it panics or its task is cancelled,
//! every caller sees [`Dropped`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type KeyFn<K, A> = Box<dyn Fn(&A) -> K + Send + Sync>;
type CallFn<A, T> = Box<dyn Fn(A) -> BoxFuture<T> + Send + Sync>;

/// The coalesced invocation never delivered a result
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("debounced call dropped before producing a result")]
pub struct Dropped;

/// Pending callers for one key
struct Window<A, T> {
    generation: u64,
    args: Option<A>,
    waiters: Vec<oneshot::Sender<T>>,
}

struct Inner<K, A, T> {
    delay: Duration,
    key_of: KeyFn<K, A>,
    func: CallFn<A, T>,
    generation: AtomicU64,
    windows: Mutex<HashMap<K, Window<A, T>>>,
}

impl<K, A, T> Inner<K, A, T>
where
    K: Eq + Hash,
    T: Clone,
{
    async fn fire(&self, key: K, generation: u64) {
        let (args, waiters) = {
            let mut windows = self.windows.lock();
            match windows.get(&key) {
                Some(window) if window.generation == generation => {}
                // superseded by a later call
                _ => return,
            }
            let Some(window) = windows.remove(&key) else {
                return;
            };
            let Some(args) = window.args else {
                return;
            };
            (args, window.waiters)
        };

        let result = (self.func)(args).await;
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Debouncer with an independent window per key
///
/// The key is derived from the call's arguments, typically the device or
/// application identifier they start with.
pub struct KeyedDebouncer<K, A, T> {
    inner: Arc<Inner<K, A, T>>,
}

impl<K, A, T> Clone for KeyedDebouncer<K, A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, A, T> KeyedDebouncer<K, A, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    A: Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new<KF, F, Fut>(delay: Duration, key_of: KF, func: F) -> Self
    where
        KF: Fn(&A) -> K + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                delay,
                key_of: Box::new(key_of),
                func: Box::new(move |args| Box::pin(func(args))),
                generation: AtomicU64::new(0),
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a call. The timer for its key (re)starts immediately, so the
    /// returned future does not need to be polled for the invocation to run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn call(&self, args: A) -> impl Future<Output = Result<T, Dropped>> + Send + 'static {
        let key = (self.inner.key_of)(&args);
        let (tx, rx) = oneshot::channel();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut windows = self.inner.windows.lock();
            let window = windows.entry(key.clone()).or_insert_with(|| Window {
                generation,
                args: None,
                waiters: Vec::new(),
            });
            window.generation = generation;
            window.args = Some(args);
            window.waiters.push(tx);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.delay).await;
            inner.fire(key, generation).await;
        });

        async move { rx.await.map_err(|_| Dropped) }
    }

    /// Number of keys with callers waiting on their timer
    pub fn pending_keys(&self) -> usize {
        self.inner.windows.lock().len()
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }
}

/// Debouncer with a single shared window
pub struct Debouncer<A, T> {
    keyed: KeyedDebouncer<(), A, T>,
}

impl<A, T> Clone for Debouncer<A, T> {
    fn clone(&self) -> Self {
        Self {
            keyed: self.keyed.clone(),
        }
    }
}

impl<A, T> Debouncer<A, T>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new<F, Fut>(delay: Duration, func: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            keyed: KeyedDebouncer::new(delay, |_: &A| (), func),
        }
    }

    pub fn call(&self, args: A) -> impl Future<Output = Result<T, Dropped>> + Send + 'static {
        self.keyed.call(args)
    }

    pub fn is_pending(&self) -> bool {
        self.keyed.pending_keys() > 0
    }
}
