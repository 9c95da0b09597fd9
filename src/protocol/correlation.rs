//! Outstanding-call bookkeeping.
//!
//! Every call issued by a client registers its uid here before the request
//! leaves. The entry is removed by whichever comes first: the matching
//! response ([`CorrelationTable::resolve`]) or the deadline
//! ([`CorrelationTable::expire`]). Removal happens under the table lock, so
//! exactly one of the two observes the entry and delivers; the other is a
//! no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Result, ZerobotError};

use super::message::Response;

/// Callback fired once with the final response of a call.
///
/// Timeouts are delivered as [`Response::timed_out`].
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send + 'static>;

/// How an outstanding call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The matching response arrived.
    Response(Response),
    /// The deadline fired first.
    TimedOut {
        /// Correlation id of the call.
        uid: String,
    },
}

impl Resolution {
    /// The response as a callback sees it: timeouts become a synthesized
    /// `timeout` error response.
    #[must_use]
    pub fn into_response(self) -> Response {
        match self {
            Self::Response(response) => response,
            Self::TimedOut { uid } => Response::timed_out(uid),
        }
    }

    /// Converts into the returned data.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Timeout`] for a timed-out call and
    /// [`ZerobotError::RemoteExecution`] for an error response.
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self {
            Self::Response(response) => response.into_result(),
            Self::TimedOut { uid } => Err(ZerobotError::Timeout { uid }),
        }
    }
}

struct Waiter {
    tx: oneshot::Sender<Resolution>,
    callback: Option<ResponseCallback>,
}

/// Waiting side of one registered call.
#[derive(Debug)]
pub struct PendingCall {
    uid: String,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingCall {
    /// Correlation id of the call.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Waits for the resolution.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`] if the table was cleared before the
    /// call resolved.
    pub async fn wait(self) -> Result<Resolution> {
        self.rx.await.map_err(|_| ZerobotError::Closed)
    }

    /// Returns the resolution if it is already available.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`] if the table was cleared or the
    /// resolution was already taken.
    pub fn try_take(&mut self) -> Result<Option<Resolution>> {
        match self.rx.try_recv() {
            Ok(resolution) => Ok(Some(resolution)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(ZerobotError::Closed),
        }
    }
}

/// Map from outstanding uid to its waiter. Cheap to clone.
#[derive(Clone)]
pub struct CorrelationTable {
    inner: Arc<TableInner>,
}

struct TableInner {
    ctx: Context,
    timers: CancellationToken,
    pending: Mutex<HashMap<String, Waiter>>,
}

impl fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("outstanding", &self.len())
            .finish_non_exhaustive()
    }
}

impl CorrelationTable {
    /// Creates an empty table. Callbacks run on `ctx`'s callback executor.
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        Self {
            inner: Arc::new(TableInner {
                ctx: ctx.clone(),
                timers: ctx.child_token(),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an outstanding call.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::DuplicateUid`] if `uid` is already outstanding.
    pub fn register(
        &self,
        uid: impl Into<String>,
        callback: Option<ResponseCallback>,
    ) -> Result<PendingCall> {
        let uid = uid.into();
        let mut pending = self.lock();
        if pending.contains_key(&uid) {
            return Err(ZerobotError::DuplicateUid(uid));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(uid.clone(), Waiter { tx, callback });
        Ok(PendingCall { uid, rx })
    }

    /// Arms a detached timer that expires `uid` after `timeout`.
    ///
    /// Firing after the call resolved is a no-op.
    pub fn arm_timeout(&self, uid: impl Into<String>, timeout: Duration) {
        let uid = uid.into();
        let table = self.clone();
        let token = self.inner.timers.clone();
        self.inner.ctx.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if table.expire(&uid) {
                        tracing::debug!(%uid, ?timeout, "call timed out");
                    }
                }
            }
        });
    }

    /// Delivers a response to its waiter.
    ///
    /// Returns `true` if this resolved the call, `false` if the uid was not
    /// outstanding (late after a timeout, or foreign).
    pub fn resolve(&self, response: Response) -> bool {
        let Some(waiter) = self.lock().remove(&response.uid) else {
            tracing::debug!(uid = %response.uid, "response for unknown uid dropped");
            return false;
        };
        self.deliver(waiter, Resolution::Response(response));
        true
    }

    /// Resolves `uid` as timed out.
    ///
    /// Returns `true` if this resolved the call, `false` if it had already
    /// been resolved.
    pub fn expire(&self, uid: &str) -> bool {
        let Some(waiter) = self.lock().remove(uid) else {
            return false;
        };
        self.deliver(
            waiter,
            Resolution::TimedOut {
                uid: uid.to_string(),
            },
        );
        true
    }

    /// Removes `uid` without resolving it. Used when the request never left.
    pub fn cancel(&self, uid: &str) -> bool {
        self.lock().remove(uid).is_some()
    }

    fn deliver(&self, waiter: Waiter, resolution: Resolution) {
        if let Some(callback) = waiter.callback {
            let response = resolution.clone().into_response();
            self.inner.ctx.spawn_callback(move || callback(response));
        }
        // The caller may have dropped its handle; the entry is gone either way.
        let _ = waiter.tx.send(resolution);
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no call is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns `true` if `uid` is outstanding.
    #[must_use]
    pub fn contains(&self, uid: &str) -> bool {
        self.lock().contains_key(uid)
    }

    /// Drops every outstanding call and stops the pending timers. Waiters
    /// observe [`ZerobotError::Closed`].
    pub fn close(&self) {
        self.inner.timers.cancel();
        let dropped = std::mem::take(&mut *self.lock());
        if !dropped.is_empty() {
            tracing::debug!(outstanding = dropped.len(), "abandoning outstanding calls");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn response_resolves_waiter() {
        let ctx = Context::new();
        let table = CorrelationTable::new(&ctx);
        let Ok(pending) = table.register("a", None) else {
            panic!("register");
        };
        assert!(table.resolve(Response::ok("a", json!(84))));
        let Ok(Resolution::Response(response)) = pending.wait().await else {
            panic!("expected a response");
        };
        assert_eq!(response.data, json!(84));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_uid_is_rejected_while_outstanding() {
        let ctx = Context::new();
        let table = CorrelationTable::new(&ctx);
        let Ok(_first) = table.register("dup", None) else {
            panic!("register");
        };
        assert!(matches!(
            table.register("dup", None),
            Err(ZerobotError::DuplicateUid(_))
        ));
        assert!(table.expire("dup"));
        assert!(table.register("dup", None).is_ok());
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_a_no_op() {
        let ctx = Context::new();
        let table = CorrelationTable::new(&ctx);
        let Ok(pending) = table.register("slow", None) else {
            panic!("register");
        };
        assert!(table.expire("slow"));
        assert!(!table.resolve(Response::ok("slow", json!(1))));
        let Ok(resolution) = pending.wait().await else {
            panic!("resolved");
        };
        assert_eq!(resolution, Resolution::TimedOut { uid: "slow".into() });
    }

    #[tokio::test]
    async fn armed_timer_expires_the_call() {
        let ctx = Context::new();
        let table = CorrelationTable::new(&ctx);
        let Ok(pending) = table.register("t", None) else {
            panic!("register");
        };
        table.arm_timeout("t", Duration::from_millis(10));
        let Ok(Ok(resolution)) = tokio::time::timeout(Duration::from_secs(2), pending.wait()).await
        else {
            panic!("timer never fired");
        };
        assert!(matches!(
            resolution.into_result(),
            Err(ZerobotError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn racing_resolution_is_observed_once() {
        let ctx = Context::new();
        let table = CorrelationTable::new(&ctx);
        let calls = Arc::new(AtomicUsize::new(0));
        for round in 0..200 {
            let uid = format!("race-{round}");
            let counter = Arc::clone(&calls);
            let callback: ResponseCallback = Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let Ok(_pending) = table.register(uid.clone(), Some(callback)) else {
                panic!("register");
            };
            let by_timer = {
                let table = table.clone();
                let uid = uid.clone();
                tokio::task::spawn_blocking(move || table.expire(&uid))
            };
            let by_response = {
                let table = table.clone();
                tokio::task::spawn_blocking(move || table.resolve(Response::ok(uid, json!(round))))
            };
            let (Ok(a), Ok(b)) = (by_timer.await, by_response.await) else {
                panic!("join");
            };
            assert!(a ^ b, "exactly one side must win");
        }
        ctx.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 200);
    }

    #[tokio::test]
    async fn callback_receives_synthesized_timeout() {
        let ctx = Context::new();
        let table = CorrelationTable::new(&ctx);
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |response| {
            let _ = tx.send(response);
        });
        let Ok(_pending) = table.register("cb", Some(callback)) else {
            panic!("register");
        };
        assert!(table.expire("cb"));
        let Ok(response) = rx.await else {
            panic!("callback never ran");
        };
        assert_eq!(response, Response::timed_out("cb"));
    }

    #[tokio::test]
    async fn close_abandons_waiters() {
        let ctx = Context::new();
        let table = CorrelationTable::new(&ctx);
        let Ok(pending) = table.register("x", None) else {
            panic!("register");
        };
        table.close();
        assert!(matches!(pending.wait().await, Err(ZerobotError::Closed)));
    }
}
