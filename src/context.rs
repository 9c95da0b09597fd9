//! Runtime context shared by every component of a process.
//!
//! A [`Context`] is created once at startup and passed by reference to the
//! broker, pools, clients and event endpoints. It owns:
//!
//! - the root [`CancellationToken`]; each component derives a child token,
//! - a [`TaskTracker`] recording every reactor task so shutdown can wait,
//! - the bounded executor that runs user callbacks off the reactors.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Default number of user callbacks allowed to run at the same time.
pub const DEFAULT_CALLBACK_CONCURRENCY: usize = 64;

/// Default per-channel queue capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Tunables fixed for the lifetime of a [`Context`].
#[derive(Debug, Clone, Copy)]
pub struct ContextSettings {
    /// Upper bound on concurrently running callbacks.
    pub callback_concurrency: usize,
    /// Capacity of channel send and receive queues.
    pub channel_capacity: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            callback_concurrency: DEFAULT_CALLBACK_CONCURRENCY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Process-wide owner of cancellation, reactor tasks and the callback pool.
///
/// Cloning is cheap and yields a handle to the same context.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    shutdown: CancellationToken,
    tasks: TaskTracker,
    callbacks: Arc<Semaphore>,
    settings: ContextSettings,
}

impl Context {
    /// Creates a context with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(ContextSettings::default())
    }

    /// Creates a context with explicit settings.
    #[must_use]
    pub fn with_settings(settings: ContextSettings) -> Self {
        let permits = settings.callback_concurrency.max(1);
        Self {
            inner: Arc::new(ContextInner {
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                callbacks: Arc::new(Semaphore::new(permits)),
                settings,
            }),
        }
    }

    /// Returns the settings this context was created with.
    #[must_use]
    pub fn settings(&self) -> ContextSettings {
        self.inner.settings
    }

    /// Capacity used for channel queues.
    #[must_use]
    pub fn channel_capacity(&self) -> usize {
        self.inner.settings.channel_capacity.max(1)
    }

    /// Derives a token that is cancelled when the context shuts down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Returns `true` once [`Context::shutdown`] has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Spawns a tracked task on the current runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tasks.spawn(future)
    }

    /// Runs `callback` on the blocking pool once a callback permit is free.
    ///
    /// The caller never waits: permit acquisition happens in a tracked task.
    /// At most `callback_concurrency` callbacks execute at once; the rest
    /// queue on the semaphore instead of each claiming a thread.
    pub fn spawn_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = Arc::clone(&self.inner.callbacks);
        self.inner.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(err) = tokio::task::spawn_blocking(callback).await {
                tracing::warn!(error = %err, "callback panicked");
            }
        });
    }

    /// Cancels every component derived from this context and waits for all
    /// tracked tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::debug!("context shut down");
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn callbacks_run_and_shutdown_waits() {
        let ctx = Context::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = Arc::clone(&hits);
            ctx.spawn_callback(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        ctx.shutdown().await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn callback_concurrency_is_bounded() {
        let ctx = Context::with_settings(ContextSettings {
            callback_concurrency: 2,
            ..ContextSettings::default()
        });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            ctx.spawn_callback(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        ctx.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn child_tokens_follow_root() {
        let ctx = Context::new();
        let child = ctx.child_token();
        assert!(!child.is_cancelled());
        ctx.inner.shutdown.cancel();
        assert!(child.is_cancelled());
        assert!(ctx.is_shutting_down());
    }
}
