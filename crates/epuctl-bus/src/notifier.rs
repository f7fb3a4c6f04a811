use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use epuctl_domain::Subscriber;
use serde_json::Value;
use tracing::warn;

use crate::bus::MessageBus;

/// Fans record state changes out to subscribers.
///
/// Delivery is fire-and-forget with a bounded retry: a subscriber that
/// stays unreachable is logged and skipped, never blocking the caller's
/// tick. Within one subscriber, records are delivered in submission order;
/// there is no ordering across subscribers.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send_record(&self, record: Value, subscribers: &[Subscriber]);

    async fn send_records(&self, records: &[Value], subscribers: &[Subscriber]) {
        for record in records {
            self.send_record(record.clone(), subscribers).await;
        }
    }
}

/// [`Notifier`] delivering over the message bus.
pub struct BusNotifier {
    bus: Arc<dyn MessageBus>,
    max_attempts: u32,
    backoff: Duration,
}

impl BusNotifier {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        BusNotifier { bus, max_attempts: 3, backoff: Duration::from_millis(50) }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl Notifier for BusNotifier {
    async fn send_record(&self, record: Value, subscribers: &[Subscriber]) {
        for subscriber in subscribers {
            let mut delay = self.backoff;
            for attempt in 1..=self.max_attempts {
                match self
                    .bus
                    .fire(&subscriber.name, &subscriber.operation, record.clone())
                    .await
                {
                    Ok(()) => break,
                    Err(_) if attempt < self.max_attempts => {
                        tokio::time::sleep(delay).await;
                        // capped exponential backoff
                        delay = (delay * 2).min(Duration::from_secs(1));
                    }
                    Err(e) => {
                        warn!(
                            subscriber = %subscriber,
                            error = %e,
                            "dropping notification after {} attempts",
                            self.max_attempts
                        );
                    }
                }
            }
        }
    }
}

/// Test [`Notifier`] that records every delivery.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(Value, Subscriber)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Value, Subscriber)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Records delivered to a given subscriber name, in submission order.
    pub fn records_for(&self, name: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|(_, s)| s.name == name)
            .map(|(record, _)| record)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_record(&self, record: Value, subscribers: &[Subscriber]) {
        let mut guard = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        for subscriber in subscribers {
            guard.push((record.clone(), subscriber.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusHandler;
    use crate::error::BusError;
    use crate::inprocess::InProcessBus;
    use serde_json::json;

    struct Sink {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl BusHandler for Sink {
        async fn handle(&self, _operation: &str, payload: Value) -> Result<Value, BusError> {
            self.seen.lock().unwrap().push(payload);
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn records_arrive_in_submission_order() {
        let bus = Arc::new(InProcessBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register("sub", Arc::new(Sink { seen: seen.clone() })).await;

        let notifier = BusNotifier::new(bus);
        let subscribers = [Subscriber::new("sub", "instance_info")];
        notifier
            .send_records(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})], &subscribers)
            .await;

        // one-way delivery runs on spawned tasks; give them a beat
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0]["n"], 1);
        assert_eq!(seen[2]["n"], 3);
    }

    #[tokio::test]
    async fn unreachable_subscriber_does_not_block() {
        let bus = Arc::new(InProcessBus::new());
        let notifier = BusNotifier::new(bus).with_retry(2, Duration::from_millis(1));
        let subscribers = [Subscriber::new("ghost", "instance_info")];
        // must return despite nobody listening
        notifier.send_record(json!({"n": 1}), &subscribers).await;
    }

    #[tokio::test]
    async fn recording_notifier_captures_per_subscriber() {
        let notifier = RecordingNotifier::new();
        let subscribers =
            [Subscriber::new("a", "op"), Subscriber::new("b", "op")];
        notifier.send_record(json!({"x": 1}), &subscribers).await;

        assert_eq!(notifier.sent().len(), 2);
        assert_eq!(notifier.records_for("a").len(), 1);
        assert_eq!(notifier.records_for("b").len(), 1);
    }
}
