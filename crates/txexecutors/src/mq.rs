//! Messaging executor and its broker connection.
//!
//! One publisher is created at startup and shared by every flow; the
//! executor only encodes the task input and hands it over.

use async_trait::async_trait;
use iggy::clients::client::IggyClient;
use iggy::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use txcore::executor::require_str;
use txcore::{params_to_json, ConfigMap, ExecContext, ExecutorError, Params, TaskExecutor};
use txruntime::config::BrokerConfig;

/// Broker-side sink for encoded messages.
///
/// `publish` returns once the broker has acknowledged the message.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ExecutorError>;
}

/// Publishes the task input, JSON-encoded, to the configured `topic`
pub struct MqExecutor {
    publisher: Arc<dyn MessagePublisher>,
}

impl MqExecutor {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl TaskExecutor for MqExecutor {
    fn task_type(&self) -> &str {
        "mq"
    }

    async fn execute(&self, ctx: &ExecContext, config: &ConfigMap, input: &Params) -> Result<(), ExecutorError> {
        let topic = require_str(config, "topic")?;
        let payload = serde_json::to_vec(&params_to_json(input))
            .map_err(|e| ExecutorError::Broker(format!("Failed to encode message: {}", e)))?;
        let size = payload.len();

        ctx.guard(self.publisher.publish(topic, payload)).await?;

        tracing::info!(task_id = %ctx.task_id, topic, bytes = size, "Message published");
        Ok(())
    }
}

/// [`MessagePublisher`] backed by a single Iggy connection
pub struct IggyPublisher {
    client: IggyClient,
    stream_id: u32,
    topics: TopicCache,
}

impl IggyPublisher {
    /// Connect, authenticate and make sure the stream exists
    pub async fn connect(config: &BrokerConfig) -> Result<Self, ExecutorError> {
        tracing::info!("Connecting to Iggy server: {}", config.connection_string);

        let client = IggyClient::from_connection_string(&config.connection_string)
            .map_err(|e| ExecutorError::Broker(format!("Client creation failed: {}", e)))?;
        client
            .connect()
            .await
            .map_err(|e| ExecutorError::Broker(format!("Connection failed: {}", e)))?;

        // The connection string may already carry credentials
        if let Err(e) = client.login_user(&config.username, &config.password).await {
            tracing::warn!("Explicit authentication returned error: {:?}", e);
        }

        let stream = match client.create_stream(&config.stream, None).await {
            Ok(details) => {
                tracing::info!("Created stream: {} with ID: {}", config.stream, details.id);
                details
            }
            Err(e) => {
                tracing::debug!("Stream creation failed (might already exist): {:?}", e);
                let identifier: Identifier = config
                    .stream
                    .as_str()
                    .try_into()
                    .map_err(|e| ExecutorError::Broker(format!("Invalid stream name: {}", e)))?;
                client
                    .get_stream(&identifier)
                    .await
                    .map_err(|e| ExecutorError::Broker(format!("Failed to get stream: {}", e)))?
                    .ok_or_else(|| ExecutorError::Broker(format!("Stream {} not found", config.stream)))?
            }
        };

        Ok(Self {
            client,
            stream_id: stream.id,
            topics: TopicCache::default(),
        })
    }

    fn stream_identifier(&self) -> Result<Identifier, ExecutorError> {
        self.stream_id
            .try_into()
            .map_err(|e| ExecutorError::Broker(format!("Invalid stream ID {}: {}", self.stream_id, e)))
    }

    /// Resolve a topic id, creating the topic on first use
    async fn topic_id(&self, topic: &str) -> Result<u32, ExecutorError> {
        self.topics.resolve(topic, || self.create_topic(topic)).await
    }

    async fn create_topic(&self, topic: &str) -> Result<u32, ExecutorError> {
        let stream_id = self.stream_identifier()?;
        let details = match self
            .client
            .create_topic(
                &stream_id,
                topic,
                1,
                CompressionAlgorithm::default(),
                None,
                None,
                IggyExpiry::NeverExpire,
                MaxTopicSize::ServerDefault,
            )
            .await
        {
            Ok(details) => {
                tracing::info!("Created topic: {} with ID: {}", topic, details.id);
                details
            }
            Err(e) => {
                tracing::debug!("Topic creation failed (might already exist): {:?}", e);
                let identifier: Identifier = topic
                    .try_into()
                    .map_err(|e| ExecutorError::Broker(format!("Invalid topic name: {}", e)))?;
                self.client
                    .get_topic(&stream_id, &identifier)
                    .await
                    .map_err(|e| ExecutorError::Broker(format!("Failed to get topic: {}", e)))?
                    .ok_or_else(|| ExecutorError::Broker(format!("Topic {} not found", topic)))?
            }
        };
        Ok(details.id)
    }
}

/// Topic name to server-assigned id.
///
/// The lock only guards the map; broker round trips for unknown topics run
/// outside it, so publishes to known topics never wait on a creation.
#[derive(Default)]
struct TopicCache {
    ids: Mutex<HashMap<String, u32>>,
}

impl TopicCache {
    async fn resolve<F, Fut>(&self, topic: &str, create: F) -> Result<u32, ExecutorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u32, ExecutorError>>,
    {
        if let Some(id) = self.ids.lock().await.get(topic) {
            return Ok(*id);
        }
        let id = create().await?;
        // A concurrent first use may have won; keep whichever id landed first
        Ok(*self.ids.lock().await.entry(topic.to_string()).or_insert(id))
    }
}

#[async_trait]
impl MessagePublisher for IggyPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ExecutorError> {
        let topic_id = self.topic_id(topic).await?;
        let stream_id = self.stream_identifier()?;
        let topic_identifier: Identifier = topic_id
            .try_into()
            .map_err(|e| ExecutorError::Broker(format!("Invalid topic ID {}: {}", topic_id, e)))?;

        let mut messages = vec![IggyMessage::from(payload)];
        self.client
            .send_messages(&stream_id, &topic_identifier, &Partitioning::balanced(), &mut messages)
            .await
            .map_err(|e| {
                ExecutorError::Broker(format!(
                    "Send failed: {} (stream_id: {}, topic_id: {})",
                    e, self.stream_id, topic_id
                ))
            })
    }
}
