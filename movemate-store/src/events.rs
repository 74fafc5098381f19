use async_trait::async_trait;
use movemate_core::documents::{DocumentGenerator, DocumentRequest, GeneratedDocument};
use movemate_core::notification::{FeedUpdate, Notification, NotificationSink, PushPayload};
use movemate_core::{CoreError, CoreResult};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::app_config::TopicConfig;

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(topic, key, partition = delivery.partition, offset = delivery.offset, "Event published");
                Ok(())
            }
            Err((e, _msg)) => {
                error!(topic, key, error = %e, "Failed to publish event");
                Err(e)
            }
        }
    }

    /// Serialize and publish; failures become `ExternalFailure`.
    pub async fn publish_json<T: Serialize>(&self, topic: &str, key: &str, event: &T) -> CoreResult<()> {
        let payload = serde_json::to_string(event).map_err(|e| CoreError::ExternalFailure(e.to_string()))?;
        self.publish(topic, key, &payload)
            .await
            .map_err(|e| CoreError::ExternalFailure(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct UserNotificationEvent<'a> {
    user_id: Uuid,
    #[serde(flatten)]
    notification: &'a Notification,
}

#[derive(Debug, Serialize)]
struct PushEvent<'a> {
    token: &'a str,
    #[serde(flatten)]
    payload: &'a PushPayload,
}

/// Notifications, FCM pushes and feed updates as Kafka events. Delivery to
/// devices is the consumers' business.
#[derive(Clone)]
pub struct KafkaNotificationSink {
    producer: EventProducer,
    topics: TopicConfig,
}

impl KafkaNotificationSink {
    pub fn new(producer: EventProducer, topics: TopicConfig) -> Self {
        Self { producer, topics }
    }
}

#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    async fn notify(&self, user_id: Uuid, notification: Notification) -> CoreResult<()> {
        let event = UserNotificationEvent {
            user_id,
            notification: &notification,
        };
        self.producer
            .publish_json(&self.topics.notifications, &user_id.to_string(), &event)
            .await
    }

    async fn notify_admins(&self, notification: Notification) -> CoreResult<()> {
        self.producer
            .publish_json(&self.topics.admin_notifications, "admins", &notification)
            .await
    }

    async fn push_fcm(&self, token: &str, payload: PushPayload) -> CoreResult<()> {
        let event = PushEvent { token, payload: &payload };
        self.producer.publish_json(&self.topics.pushes, token, &event).await
    }

    async fn publish_feed(&self, update: FeedUpdate) -> CoreResult<()> {
        self.producer
            .publish_json(&self.topics.feed, &update.tracking_number, &update)
            .await
    }
}

/// Queues a render request and hands back the id the renderer will file
/// the document under. The file itself arrives later.
#[derive(Clone)]
pub struct KafkaDocumentRequester {
    producer: EventProducer,
    topic: String,
}

#[derive(Debug, Serialize)]
struct RenderRequested<'a> {
    document_id: &'a str,
    #[serde(flatten)]
    request: &'a DocumentRequest,
}

impl KafkaDocumentRequester {
    pub fn new(producer: EventProducer, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl DocumentGenerator for KafkaDocumentRequester {
    async fn generate(&self, request: &DocumentRequest) -> CoreResult<GeneratedDocument> {
        let document_id = Uuid::new_v4().to_string();
        let event = RenderRequested {
            document_id: &document_id,
            request,
        };
        self.producer
            .publish_json(&self.topic, &request.billing_number, &event)
            .await?;
        Ok(GeneratedDocument { document_id, file: None })
    }
}
