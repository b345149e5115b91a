//! Queue Dispatcher (spec §4.4): turns one external queue message into
//! one `job_executions` row with `param_source = event`.

pub mod adapter;
pub mod kafka;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    db::{store, Registry},
    error::{SchedulerError, SchedulerResult},
};

use adapter::{MessageEnvelope, QueueAdapter};

pub struct QueueDispatcher<A: QueueAdapter> {
    registry: Registry,
    database: String,
    adapter: A,
}

impl<A: QueueAdapter> QueueDispatcher<A> {
    pub fn new(registry: Registry, database: String, adapter: A) -> Self {
        Self {
            registry,
            database,
            adapter,
        }
    }

    pub async fn run(&mut self, shutdown: CancellationToken) -> SchedulerResult<()> {
        self.adapter.connect().await?;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = self.adapter.receive() => delivery?,
            };

            let Some(delivery) = delivery else {
                continue;
            };

            match self.process(delivery.envelope).await {
                Ok(()) => self.adapter.complete(delivery.token).await?,
                Err(err) => {
                    tracing::warn!(%err, "failed to materialize queued message, abandoning");
                    self.adapter.abandon(delivery.token).await?;
                }
            }
        }

        self.adapter.disconnect().await
    }

    /// Processing of one message (spec §4.4 steps 1-4).
    async fn process(&self, envelope: MessageEnvelope) -> SchedulerResult<()> {
        let request_id = crate::id::generate("request");

        if envelope.handler_name.trim().is_empty() {
            return Err(SchedulerError::Config("handler_name must be non-empty".to_string()));
        }

        let db = self.registry.get(&self.database)?;

        let base_params = self.resolve_base_params(db, &envelope).await?;
        let merged = merge_params(base_params, envelope.params.clone().unwrap_or_default());

        store::insert_event_execution(db, envelope.job_id, &envelope.handler_name, &merged).await?;
        tracing::debug!(request_id, handler = %envelope.handler_name, "materialized event execution");
        Ok(())
    }

    async fn resolve_base_params(
        &self,
        db: &crate::db::Database,
        envelope: &MessageEnvelope,
    ) -> SchedulerResult<Value> {
        if let Some(job_id) = envelope.job_id {
            if let Some(job) = store::get_cron_job(db, job_id).await? {
                if job.is_enabled {
                    return Ok(job.handler_params.unwrap_or_default());
                }
            }
        }

        if let Some(job) = store::find_enabled_cron_job_by_handler(db, &envelope.handler_name).await? {
            return Ok(job.handler_params.unwrap_or_default());
        }

        Ok(Value::Object(Default::default()))
    }
}

/// Shallow key-wise union of base and message params; message keys win
/// (spec §4.4 step 3).
fn merge_params(base: Value, overlay: Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map,
        _ => Default::default(),
    };

    if let Value::Object(overlay_map) = overlay {
        for (key, value) in overlay_map {
            merged.insert(key, value);
        }
    }

    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_keys_win_on_conflict() {
        let base = serde_json::json!({ "a": 1, "b": 2 });
        let overlay = serde_json::json!({ "b": 99, "c": 3 });

        let merged = merge_params(base, overlay);

        assert_eq!(merged, serde_json::json!({ "a": 1, "b": 99, "c": 3 }));
    }

    #[test]
    fn non_object_base_is_treated_as_empty() {
        let merged = merge_params(Value::Null, serde_json::json!({ "a": 1 }));
        assert_eq!(merged, serde_json::json!({ "a": 1 }));
    }
}
