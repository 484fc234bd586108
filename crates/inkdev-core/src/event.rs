/*!
 * Event delivery for inkdev.
 *
 * Transport callbacks (status changes, pen samples, discovery results) are
 * published on an [`EventHub`] and consumed through [`Subscription`]s. Each
 * subscriber owns an unbounded queue, so events from one hub are observed in
 * publication order and a slow subscriber never causes drops for the others.
 * Dropping a subscription, or calling [`Subscription::unsubscribe`], removes
 * it from the hub; [`EventHub::close`] ends every stream.
 */
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

type Subscribers<T> = HashMap<u64, mpsc::UnboundedSender<T>>;

struct HubInner<T> {
    name: &'static str,
    subscribers: Mutex<Subscribers<T>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T> HubInner<T> {
    fn lock(&self) -> MutexGuard<'_, Subscribers<T>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An ordered, multi-subscriber event source
pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for EventHub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("name", &self.inner.name)
            .field("subscribers", &self.inner.lock().len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    /// Create a new hub; `name` only appears in traces
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(HubInner {
                name,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber
    ///
    /// Subscribing to a closed hub yields a stream that ends immediately.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut subscribers = self.inner.lock();
            if !self.inner.closed.load(Ordering::SeqCst) {
                subscribers.insert(id, tx);
            }
        }
        trace!(hub = self.inner.name, id, "subscribed");
        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Publish an event to every current subscriber
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.inner.lock();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        let delivered = subscribers.len();
        trace!(hub = self.inner.name, delivered, "published");
        delivered
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drop every subscriber; their streams end after draining queued events
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let removed = {
            let mut subscribers = self.inner.lock();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        trace!(hub = self.inner.name, removed, "closed");
    }

    /// Whether [`EventHub::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// A registration on an [`EventHub`]
///
/// Implements [`Stream`]; the stream ends when the hub is closed.
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    hub: Weak<HubInner<T>>,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<T: Send + 'static> Subscription<T> {
    /// Wait for the next event, `None` once the hub is closed and drained
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Drain every queued event without waiting
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Remove this subscription from its hub
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Deliver every event to `handler` on a dedicated task, in order
    ///
    /// This is how callers marshal events to their own execution context:
    /// the handler can post to a UI queue, a channel, or act directly.
    pub fn forward<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.receiver.recv().await {
                handler(event);
            }
        })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().remove(&self.id);
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        seq: u32,
    }

    #[tokio::test]
    async fn test_publish_subscribe_in_order() {
        let hub = EventHub::new("samples");
        let mut sub = hub.subscribe();

        for seq in 0..100 {
            assert_eq!(hub.publish(Sample { seq }), 1);
        }

        for seq in 0..100 {
            assert_eq!(sub.recv().await, Some(Sample { seq }));
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let hub = EventHub::new("samples");
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.publish(Sample { seq: 7 }), 2);
        assert_eq!(a.recv().await, Some(Sample { seq: 7 }));
        assert_eq!(b.recv().await, Some(Sample { seq: 7 }));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = EventHub::new("samples");
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(a);
        assert_eq!(hub.subscriber_count(), 1);

        b.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(Sample { seq: 1 }), 0);
    }

    #[tokio::test]
    async fn test_close_ends_streams_after_drain() {
        let hub = EventHub::new("samples");
        let sub = hub.subscribe();
        hub.publish(Sample { seq: 1 });
        hub.close();

        let received: Vec<Sample> = sub.collect().await;
        assert_eq!(received, vec![Sample { seq: 1 }]);

        let mut late = hub.subscribe();
        assert_eq!(late.recv().await, None);
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn test_forward_preserves_order() {
        let hub = EventHub::new("samples");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = hub.subscribe().forward(move |s: Sample| {
            let _ = tx.send(s.seq);
        });

        for seq in 0..10 {
            hub.publish(Sample { seq });
        }
        hub.close();
        handle.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(seq) = rx.try_recv() {
            seen.push(seq);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_publish() {
        const PUBLISHERS: usize = 8;
        const EVENTS: usize = 25;

        let hub = EventHub::new("samples");
        let mut sub = hub.subscribe();
        let barrier = Arc::new(Barrier::new(PUBLISHERS));

        let mut handles = Vec::new();
        for p in 0..PUBLISHERS {
            let hub = hub.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                for i in 0..EVENTS {
                    hub.publish(Sample {
                        seq: (p * EVENTS + i) as u32,
                    });
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut count = 0;
        while tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            count += 1;
        }
        assert_eq!(count, PUBLISHERS * EVENTS);
    }
}
