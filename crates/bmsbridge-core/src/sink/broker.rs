// Broker sink: one JSON message per event, keyed by channel, on a fixed
// topic. Delivery goes through a `Publisher` so tests can stand in for
// Kafka.

use std::sync::Arc;
#[cfg(feature = "kafka")]
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{OutputSink, SinkKind, delivery_error};
use crate::error::CoreError;
use crate::event::DecodedEvent;

/// Publishes a payload to a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), String>;

    async fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

pub struct BrokerSink {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl BrokerSink {
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish_event(&self, event: &DecodedEvent) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(&event.to_message())
            .map_err(|e| delivery_error(SinkKind::Broker, e))?;
        self.publisher
            .publish(&self.topic, &event.channel, &payload)
            .await
            .map_err(|e| delivery_error(SinkKind::Broker, e))
    }
}

#[async_trait]
impl OutputSink for BrokerSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Broker
    }

    async fn deliver(&self, event: &DecodedEvent) -> bool {
        match self.publish_event(event).await {
            Ok(()) => {
                debug!(topic = %self.topic, channel = %event.channel, "event published");
                true
            }
            Err(e) => {
                warn!(topic = %self.topic, channel = %event.channel, error = %e, "broker delivery failed");
                false
            }
        }
    }

    async fn flush(&self) {
        if let Err(e) = self.publisher.flush().await {
            warn!(error = %e, "broker flush failed");
        }
    }
}

// ── Kafka ────────────────────────────────────────────────────────────

#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;

#[cfg(feature = "kafka")]
mod kafka {
    use super::{CoreError, Duration, Publisher, async_trait};

    use rdkafka::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
    use tracing::info;

    const SEND_TIMEOUT: Duration = Duration::from_secs(5);
    const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

    /// `rdkafka` producer. Retries and reconnects are left to librdkafka.
    pub struct KafkaPublisher {
        producer: FutureProducer,
    }

    impl KafkaPublisher {
        pub fn new(brokers: &str) -> Result<Self, CoreError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("client.id", "bmsbridge")
                .set("message.timeout.ms", "10000")
                .set("socket.timeout.ms", "10000")
                .set("request.timeout.ms", "10000")
                .set("reconnect.backoff.ms", "1000")
                .set("reconnect.backoff.max.ms", "10000")
                .set("retry.backoff.ms", "1000")
                .set("message.send.max.retries", "3")
                .create()
                .map_err(|e| CoreError::Config {
                    message: format!("failed to create Kafka producer for {brokers}: {e}"),
                })?;

            info!(%brokers, "Kafka producer created");
            Ok(Self { producer })
        }
    }

    #[async_trait]
    impl Publisher for KafkaPublisher {
        async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), String> {
            let record = FutureRecord::to(topic).key(key).payload(payload);
            self.producer
                .send(record, SEND_TIMEOUT)
                .await
                .map(|_| ())
                .map_err(|(e, _)| e.to_string())
        }

        async fn flush(&self) -> Result<(), String> {
            let producer = self.producer.clone();
            tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::{Value, json};

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), String> {
            if self.fail {
                return Err("broker transport failure".into());
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_owned(), key.to_owned(), payload.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_keyed_json_message() {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = BrokerSink::new(publisher.clone(), "bms-events");
        let event = DecodedEvent::new(
            "sensor.state_changed",
            "private-location-4",
            json!({ "state": "ok" }),
        );

        assert!(sink.deliver(&event).await);

        let sent = publisher.sent.lock().unwrap();
        let (topic, key, payload) = &sent[0];
        assert_eq!(topic, "bms-events");
        assert_eq!(key, "private-location-4");

        let message: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(message["eventType"], "sensor.state_changed");
        assert_eq!(message["data"], json!({ "state": "ok" }));
        assert_eq!(message["source"], "bms-realtime");
    }

    #[tokio::test]
    async fn broker_failure_is_a_failed_delivery() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        });
        let sink = BrokerSink::new(publisher, "bms-events");
        let event = DecodedEvent::new("user.created", "private-organization-1", json!({}));

        assert!(!sink.deliver(&event).await);
    }

    #[tokio::test]
    async fn broker_failure_names_the_sink() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        });
        let sink = BrokerSink::new(publisher, "bms-events");
        let event = DecodedEvent::new("user.created", "private-organization-1", json!({}));

        let err = sink.publish_event(&event).await.unwrap_err();
        assert!(matches!(err, CoreError::SinkDelivery { ref sink, .. } if sink == "broker"));
        assert_eq!(
            err.to_string(),
            "broker sink failed to deliver event: broker transport failure"
        );
    }
}
