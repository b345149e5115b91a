//! Handler Registry (spec §4.5 "Handler Registry"): a process-wide,
//! read-after-startup table from handler name to a factory producing a
//! fresh handler value per invocation. Grounded on the same trait-object
//! dispatch idiom the scheduling loop uses for its own pluggable units,
//! generalized from a compile-time generic to a runtime name lookup since
//! handlers are registered dynamically rather than known at compile time.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SchedulerResult;

/// One unit of executable work. Implementors parse their own `params`
/// shape out of the raw JSON value (spec §4.5 "Execution of one claimed
/// row" step 2); a parse failure is a handler failure like any other.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: Value) -> SchedulerResult<Value>;
}

#[async_trait]
pub trait HandlerFactory: Send + Sync {
    fn build(&self) -> Box<dyn Handler>;
}

struct FnFactory<F>(F);

impl<F, H> HandlerFactory for FnFactory<F>
where
    F: Fn() -> H + Send + Sync,
    H: Handler + 'static,
{
    fn build(&self) -> Box<dyn Handler> {
        Box::new((self.0)())
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: Arc<HashMap<String, Arc<dyn HandlerFactory>>>,
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`. Duplicate names are a startup-time
    /// fatal error, never a per-item one.
    pub fn register<F, H>(mut self, name: &str, factory: F) -> crate::error::SchedulerResult<Self>
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(crate::error::SchedulerError::DuplicateHandlerName(
                name.to_string(),
            ));
        }

        self.factories
            .insert(name.to_string(), Arc::new(FnFactory(factory)));
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            factories: Arc::new(self.factories),
        }
    }
}

impl HandlerRegistry {
    pub fn get(&self, name: &str) -> Option<Box<dyn Handler>> {
        self.factories.get(name).map(|factory| factory.build())
    }
}
