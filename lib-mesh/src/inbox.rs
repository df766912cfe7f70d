//! Ordered per-peer inbox
//!
//! Every inbound message from a peer lands in that peer's FIFO; a single
//! processor drains it serially, so dependent messages never interleave.
//! Entries older than the message timeout are discarded at dequeue, and the
//! queue is capped, dropping its oldest entries when it overflows.

use lib_dht::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

struct Queued {
    envelope: Envelope,
    enqueued_at: Instant,
}

pub struct PeerInbox {
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
    message_timeout: Duration,
    max_queue_size: usize,
    dropped: AtomicU64,
}

impl PeerInbox {
    pub fn new(message_timeout: Duration, max_queue_size: usize) -> Self {
        PeerInbox {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            message_timeout,
            max_queue_size,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a message. Past the cap, the oldest entry is dropped to make
    /// room.
    pub fn push(&self, envelope: Envelope) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.max_queue_size {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("inbox over capacity, dropped oldest message");
            }
            queue.push_back(Queued {
                envelope,
                enqueued_at: Instant::now(),
            });
        }
        self.notify.notify_one();
    }

    /// Take the next non-stale message, waiting if the queue is empty.
    pub async fn pop(&self) -> Envelope {
        loop {
            {
                let mut queue = self.queue.lock();
                while let Some(entry) = queue.pop_front() {
                    if entry.enqueued_at.elapsed() > self.message_timeout {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            kind = entry.envelope.payload.type_name(),
                            "stale message discarded at dequeue"
                        );
                        continue;
                    }
                    return entry.envelope;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`PeerInbox::pop`].
    pub fn try_pop(&self) -> Option<Envelope> {
        let mut queue = self.queue.lock();
        while let Some(entry) = queue.pop_front() {
            if entry.enqueued_at.elapsed() > self.message_timeout {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return Some(entry.envelope);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::NodeId;
    use lib_dht::Payload;

    fn envelope(n: u64) -> Envelope {
        Envelope::new(
            NodeId::from_key("sender"),
            None,
            Payload::HeadUpdate {
                topic: "t".to_string(),
                seq: n,
                message: None,
            },
        )
    }

    fn seq_of(envelope: &Envelope) -> u64 {
        match envelope.payload {
            Payload::HeadUpdate { seq, .. } => seq,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn delivery_is_fifo() {
        let inbox = PeerInbox::new(Duration::from_secs(30), 100);
        for n in 0..5 {
            inbox.push(envelope(n));
        }
        for n in 0..5 {
            assert_eq!(seq_of(&inbox.pop().await), n);
        }
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest() {
        let inbox = PeerInbox::new(Duration::from_secs(30), 3);
        for n in 0..5 {
            inbox.push(envelope(n));
        }
        assert_eq!(inbox.len(), 3);
        assert_eq!(inbox.dropped_count(), 2);
        assert_eq!(seq_of(&inbox.pop().await), 2);
    }

    #[tokio::test]
    async fn stale_messages_are_discarded_at_dequeue() {
        let inbox = PeerInbox::new(Duration::from_millis(1), 100);
        inbox.push(envelope(0));
        inbox.push(envelope(1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Both entries aged past the timeout while queued.
        assert!(inbox.try_pop().is_none());
        assert_eq!(inbox.dropped_count(), 2);
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let inbox = std::sync::Arc::new(PeerInbox::new(Duration::from_secs(30), 10));
        let reader = inbox.clone();
        let handle = tokio::spawn(async move { reader.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        inbox.push(envelope(9));

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq_of(&got), 9);
    }
}
