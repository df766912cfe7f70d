//! Request/response correlator
//!
//! Request ids are `<first-8-hex-of-local-id>_<monotonic-counter>`, unique
//! per process. A registered waiter is resolved at most once; a sweep
//! removes waiters past their deadline (dropping the sender rejects the
//! receiving future).

use crate::wire::Payload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    tx: oneshot::Sender<Payload>,
    deadline: Instant,
}

pub struct PendingRequests {
    local_prefix: String,
    counter: AtomicU64,
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingRequests {
    /// `local_prefix` is the first eight hex characters of the local id.
    pub fn new(local_prefix: String) -> Self {
        PendingRequests {
            local_prefix,
            counter: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.local_prefix, n)
    }

    /// Register a waiter for `request_id` with the given time budget.
    pub fn register(&self, request_id: &str, timeout: Duration) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(
            request_id.to_string(),
            Waiter {
                tx,
                deadline: Instant::now() + timeout,
            },
        );
        rx
    }

    /// Resolve a waiter with its response. Returns false when nothing was
    /// waiting (late, duplicate, or unsolicited response).
    pub fn resolve(&self, request_id: &str, response: Payload) -> bool {
        let Some(waiter) = self.waiters.lock().remove(request_id) else {
            debug!(request_id, "response with no registered waiter");
            return false;
        };
        waiter.tx.send(response).is_ok()
    }

    /// Drop the waiter for an abandoned request.
    pub fn cancel(&self, request_id: &str) {
        self.waiters.lock().remove(request_id);
    }

    /// Remove waiters past their deadline. Dropping the sender rejects the
    /// pending future.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|_, waiter| waiter.deadline > now);
        before - waiters.len()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingRequests {
        PendingRequests::new("ab12cd34".to_string())
    }

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let pending = pending();
        let a = pending.next_request_id();
        let b = pending.next_request_id();

        assert!(a.starts_with("ab12cd34_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn resolve_wakes_the_waiter_exactly_once() {
        let pending = pending();
        let id = pending.next_request_id();
        let rx = pending.register(&id, Duration::from_secs(5));

        assert!(pending.resolve(&id, Payload::Pong { request_id: id.clone() }));
        // Second resolution finds nothing.
        assert!(!pending.resolve(&id, Payload::Pong { request_id: id.clone() }));

        let got = rx.await.unwrap();
        assert_eq!(got.request_id(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn sweep_rejects_expired_waiters() {
        let pending = pending();
        let id = pending.next_request_id();
        let rx = pending.register(&id, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pending.sweep_expired(), 1);
        assert!(pending.is_empty());

        // The waiting future observes the rejection.
        assert!(rx.await.is_err());
    }

    #[test]
    fn cancel_removes_the_waiter() {
        let pending = pending();
        let id = pending.next_request_id();
        let _rx = pending.register(&id, Duration::from_secs(5));
        pending.cancel(&id);
        assert!(pending.is_empty());
    }
}
