//! Built-in handler kinds for exercising descriptors without application code.
//!
//! | kind               | behavior                                                   |
//! |--------------------|------------------------------------------------------------|
//! | `trace`            | appends its name to the `trace` property                   |
//! | `suspend`          | traces, then suspends on fresh entry; continues on resume  |
//! | `fail`             | faults with parameter `message`                            |
//! | `set_property`     | sets property `key` to parameter `value`                   |
//! | `require_property` | faults unless property `key` is present                    |

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use phasechain::{
    Entry, Handler, HandlerConfig, HandlerName, HandlerRegistry, HandlerResponse, MessageContext,
};
use serde_json::Value;
use tracing::info;

/// Context property the tracing kinds append to.
pub const TRACE_PROPERTY: &str = "trace";

/// Registry with every built-in kind.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("trace", |config| {
            Ok(Arc::new(TraceHandler::new(config.handler_name(), false)) as Arc<dyn Handler>)
        })
        .register("suspend", |config| {
            Ok(Arc::new(TraceHandler::new(config.handler_name(), true)) as Arc<dyn Handler>)
        })
        .register("fail", |config| {
            let message = string_parameter(config, "message")
                .unwrap_or_else(|| format!("{} failed", config.name));
            Ok(Arc::new(FailHandler {
                name: config.handler_name(),
                message,
            }) as Arc<dyn Handler>)
        })
        .register("set_property", |config| {
            let key = string_parameter(config, "key").context("set_property needs a 'key' parameter")?;
            let value = config.parameter("value").cloned().unwrap_or(Value::Bool(true));
            Ok(Arc::new(SetPropertyHandler {
                name: config.handler_name(),
                key,
                value,
            }) as Arc<dyn Handler>)
        })
        .register("require_property", |config| {
            let key =
                string_parameter(config, "key").context("require_property needs a 'key' parameter")?;
            Ok(Arc::new(RequirePropertyHandler {
                name: config.handler_name(),
                key,
            }) as Arc<dyn Handler>)
        });
    registry
}

fn string_parameter(config: &HandlerConfig, name: &str) -> Option<String> {
    config
        .parameter(name)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn append_trace(ctx: &mut MessageContext, entry: String) {
    let mut trace: Vec<String> = ctx.property_as(TRACE_PROPERTY).unwrap_or_default();
    trace.push(entry);
    ctx.set_property(TRACE_PROPERTY, trace);
}

/// Traces each invocation; optionally suspends once per message.
pub struct TraceHandler {
    name: HandlerName,
    suspend: bool,
}

impl TraceHandler {
    pub fn new(name: HandlerName, suspend: bool) -> Self {
        Self { name, suspend }
    }
}

#[async_trait]
impl Handler for TraceHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, ctx: &mut MessageContext, entry: Entry) -> Result<HandlerResponse> {
        let label = match entry {
            Entry::Fresh => self.name.to_string(),
            Entry::Resumed => format!("{} (resumed)", self.name),
        };
        info!(handler = %self.name, message_id = %ctx.id(), resumed = entry.is_resumed(), "trace");
        append_trace(ctx, label);

        if self.suspend && !entry.is_resumed() {
            return Ok(HandlerResponse::Suspend);
        }
        Ok(HandlerResponse::Continue)
    }
}

struct FailHandler {
    name: HandlerName,
    message: String,
}

#[async_trait]
impl Handler for FailHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, _ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
        Err(anyhow!(self.message.clone()))
    }
}

struct SetPropertyHandler {
    name: HandlerName,
    key: String,
    value: Value,
}

#[async_trait]
impl Handler for SetPropertyHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
        ctx.set_property(self.key.clone(), self.value.clone());
        Ok(HandlerResponse::Continue)
    }
}

struct RequirePropertyHandler {
    name: HandlerName,
    key: String,
}

#[async_trait]
impl Handler for RequirePropertyHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
        if ctx.property(&self.key).is_none() {
            anyhow::bail!("required property '{}' is missing", self.key);
        }
        Ok(HandlerResponse::Continue)
    }
}
