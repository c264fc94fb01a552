//! Shared test doubles: an in-memory bus with wildcard fanout.

use async_trait::async_trait;
use bytes::Bytes;
use edgebus::bus::{BusError, BusHandler, Delivery, MessageBus, Subscription};
use edgebus::message::topic_matches;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SubscriptionList = Arc<Mutex<Vec<(u64, String, Arc<dyn BusHandler>)>>>;

/// In-process bus: records every publication and fans deliveries out to
/// subscriptions whose pattern matches, with the same `*`/`>` wildcard
/// semantics the broker has.
#[derive(Default)]
pub struct InMemoryBus {
    next_id: AtomicU64,
    subscriptions: SubscriptionList,
    published: Mutex<Vec<(String, Bytes)>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every payload published on a subject matching `pattern`.
    pub fn published_matching(&self, pattern: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(subject, _)| topic_matches(pattern, subject))
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Subjects of every publication, in order.
    pub fn published_subjects(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), payload.clone()));

        let matching: Vec<Arc<dyn BusHandler>> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, pattern, _)| topic_matches(pattern, subject))
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in matching {
            let delivery = Delivery {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            let _ = handler.handle(delivery).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .push((id, subject.to_string(), handler));
        Ok(Box::new(InMemorySubscription {
            id,
            subscriptions: Arc::clone(&self.subscriptions),
        }))
    }
}

struct InMemorySubscription {
    id: u64,
    subscriptions: SubscriptionList,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|(id, _, _)| *id != self.id);
        Ok(())
    }
}

/// Polls `check` until it returns true or the deadline passes.
pub async fn wait_until(check: impl Fn() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
