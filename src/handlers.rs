//! Example handler registrations. Handler business logic itself is out of
//! scope; these two exist to give the registry something concrete to
//! dispatch to and to ground the worker pool's tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{SchedulerError, SchedulerResult},
    handler::{Handler, HandlerRegistry, HandlerRegistryBuilder},
};

/// Echoes its params back as the result. Useful for smoke-testing a
/// freshly registered cron job end to end.
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn call(&self, params: Value) -> SchedulerResult<Value> {
        Ok(params)
    }
}

#[derive(Debug, Deserialize)]
struct HttpWebhookParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Sends `params.body` to `params.url`, grounded on the reqwest-based
/// outbound webhook dispatch this codebase already used for one-off jobs.
pub struct HttpWebhookHandler {
    client: reqwest::Client,
}

impl Default for HttpWebhookHandler {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Handler for HttpWebhookHandler {
    async fn call(&self, params: Value) -> SchedulerResult<Value> {
        let params: HttpWebhookParams = serde_json::from_value(params)?;
        let method: reqwest::Method = params
            .method
            .parse()
            .map_err(|_| SchedulerError::HandlerFailure(format!("invalid method '{}'", params.method)))?;

        let mut request = self.client.request(method, &params.url);
        if let Some(body) = &params.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SchedulerError::HandlerFailure(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| SchedulerError::HandlerFailure(err.to_string()))?;

        if !status.is_success() {
            return Err(SchedulerError::HandlerFailure(format!(
                "webhook returned {status}: {text}"
            )));
        }

        Ok(serde_json::json!({ "status": status.as_u16(), "body": text }))
    }
}

pub fn registry() -> SchedulerResult<HandlerRegistry> {
    let registry = HandlerRegistryBuilder::new()
        .register("noop", || NoopHandler)?
        .register("http_webhook", HttpWebhookHandler::default)?
        .build();

    Ok(registry)
}
