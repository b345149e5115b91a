//! Queue adapter contract (spec §4.4 "Adapter contract"). A backend plugs
//! in by implementing [`QueueAdapter`]; the [`crate::queue::QueueDispatcher`]
//! loop only ever talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchedulerResult;

/// Wire shape of one queued message (spec §4.4 "Message envelope").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub handler_name: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub job_id: Option<i64>,
}

/// One received message plus the opaque delivery token needed to
/// complete or abandon it.
pub struct Delivery<T> {
    pub envelope: MessageEnvelope,
    pub token: T,
}

#[async_trait]
pub trait QueueAdapter: Send + Sync {
    type Token: Send;

    async fn connect(&mut self) -> SchedulerResult<()>;
    async fn disconnect(&mut self) -> SchedulerResult<()>;

    /// Produces the next available message, or `None` if none arrived
    /// before the adapter's internal poll timeout.
    async fn receive(&mut self) -> SchedulerResult<Option<Delivery<Self::Token>>>;

    async fn complete(&mut self, token: Self::Token) -> SchedulerResult<()>;
    async fn abandon(&mut self, token: Self::Token) -> SchedulerResult<()>;
}
