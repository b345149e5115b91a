//! Kafka implementation of [`QueueAdapter`], grounded on the corpus's use
//! of `rdkafka` for queue-backed scheduling consumers. Delivery is marked
//! complete by committing the message's offset; abandon simply skips the
//! commit so the next `receive` (on this or another consumer in the same
//! group) redelivers it.

use async_trait::async_trait;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::Message,
    ClientConfig,
};

use crate::{
    config::QueueDispatcherConfig,
    error::{SchedulerError, SchedulerResult},
};

use super::adapter::{Delivery, MessageEnvelope, QueueAdapter};

pub struct KafkaAdapter {
    config: QueueDispatcherConfig,
    consumer: Option<StreamConsumer>,
}

impl KafkaAdapter {
    pub fn new(config: QueueDispatcherConfig) -> Self {
        Self {
            config,
            consumer: None,
        }
    }
}

pub struct KafkaToken {
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl QueueAdapter for KafkaAdapter {
    type Token = KafkaToken;

    async fn connect(&mut self) -> SchedulerResult<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", &self.config.group_id)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|err| SchedulerError::QueueAdapterError(err.to_string()))?;

        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|err| SchedulerError::QueueAdapterError(err.to_string()))?;

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn disconnect(&mut self) -> SchedulerResult<()> {
        self.consumer = None;
        Ok(())
    }

    async fn receive(&mut self) -> SchedulerResult<Option<Delivery<Self::Token>>> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SchedulerError::QueueAdapterError("adapter not connected".to_string()))?;

        let message = match tokio::time::timeout(
            std::time::Duration::from_secs(5),
            consumer.recv(),
        )
        .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => return Err(SchedulerError::QueueAdapterError(err.to_string())),
            Err(_) => return Ok(None),
        };

        let payload = message
            .payload()
            .ok_or_else(|| SchedulerError::QueueAdapterError("empty message payload".to_string()))?;

        let envelope: MessageEnvelope = serde_json::from_slice(payload)?;

        let token = KafkaToken {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };

        Ok(Some(Delivery { envelope, token }))
    }

    async fn complete(&mut self, token: Self::Token) -> SchedulerResult<()> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SchedulerError::QueueAdapterError("adapter not connected".to_string()))?;

        let mut tpl = rdkafka::TopicPartitionList::new();
        tpl.add_partition_offset(
            &token.topic,
            token.partition,
            rdkafka::Offset::Offset(token.offset + 1),
        )
        .map_err(|err| SchedulerError::QueueAdapterError(err.to_string()))?;

        consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|err| SchedulerError::QueueAdapterError(err.to_string()))
    }

    async fn abandon(&mut self, _token: Self::Token) -> SchedulerResult<()> {
        // No commit: the next poll on this group redelivers the message,
        // matching the adapter contract's "return to queue" semantics.
        Ok(())
    }
}
