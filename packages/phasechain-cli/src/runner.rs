//! Loading descriptors and driving synthetic messages.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use phasechain::{
    Engine, EngineError, EngineOutcome, FaultHandling, Flow, HandlerRegistry, MessageContext, Pipeline,
    PipelineConfig,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::handlers::TRACE_PROPERTY;
use crate::report::{RunReport, RunStatus};

/// Read a descriptor and resolve it into a pipeline.
pub fn load_pipeline(path: &Path, registry: &HandlerRegistry) -> Result<Pipeline> {
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("failed to load descriptor {}", path.display()))?;
    let pipeline = config
        .into_pipeline(registry)
        .with_context(|| format!("failed to resolve descriptor {}", path.display()))?;
    Ok(pipeline)
}

/// Parse a `key=value` property. The value is read as JSON when it parses,
/// otherwise as a plain string.
pub fn parse_property(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty property key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Push one message through `flow`, resuming it up to `max_resumes` times.
///
/// Handlers are cleaned up afterwards whatever the outcome.
pub async fn run_message(
    pipeline: Arc<Pipeline>,
    flow: Flow,
    properties: Vec<(String, Value)>,
    max_resumes: usize,
) -> Result<RunReport> {
    let engine = Engine::new(pipeline);
    let mut ctx = MessageContext::new(flow);
    for (key, value) in properties {
        ctx.set_property(key, value);
    }

    info!(message_id = %ctx.id(), %flow, "running synthetic message");
    let mut resumes = 0;
    let mut result = engine.run(flow, &mut ctx).await;

    loop {
        match &result {
            Ok(EngineOutcome::Paused { phase }) if resumes < max_resumes => {
                info!(message_id = %ctx.id(), phase = %phase, "resuming paused message");
            }
            // A fault flow that paused is resumable too
            Err(EngineError::Faulted { handling, .. })
                if ctx.is_paused() && resumes < max_resumes =>
            {
                info!(message_id = %ctx.id(), %handling, "resuming paused fault flow");
            }
            _ => break,
        }
        resumes += 1;
        let next = engine.resume(&mut ctx).await;
        // The original fault stays the result; only the fault flow's progress changes
        result = match (result, next) {
            (
                Err(EngineError::Faulted {
                    flow, phase, source, ..
                }),
                next,
            ) => Err(EngineError::Faulted {
                flow,
                phase,
                source,
                handling: fault_flow_progress(next),
            }),
            (_, next) => next,
        };
    }

    let status = match result {
        Ok(EngineOutcome::Completed) => RunStatus::Completed,
        Ok(EngineOutcome::Paused { phase }) => RunStatus::Paused { phase },
        Err(EngineError::Faulted {
            flow,
            phase,
            handling,
            source,
        }) => RunStatus::Faulted {
            flow,
            phase,
            error: format!("{:#}", source),
            fault_flow: handling.to_string(),
        },
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = engine.shutdown().await {
        warn!(error = ?e, "handler cleanup reported failures");
    }

    let trace = ctx.property_as(TRACE_PROPERTY).unwrap_or_default();
    Ok(RunReport {
        message_id: ctx.id().to_string(),
        flow,
        status,
        resumes,
        trace,
        properties: ctx.properties().clone(),
    })
}

/// How a resumed fault flow ended, as seen from the fault that started it.
fn fault_flow_progress(next: Result<EngineOutcome, EngineError>) -> FaultHandling {
    match next {
        Ok(EngineOutcome::Completed) => FaultHandling::Completed,
        Ok(EngineOutcome::Paused { phase }) => FaultHandling::Paused { phase },
        Err(EngineError::Faulted { source, .. }) => FaultHandling::Failed(source),
        Err(e) => FaultHandling::Failed(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("retries=3").unwrap(),
            ("retries".to_string(), Value::from(3))
        );
        assert_eq!(
            parse_property("action=urn:echo").unwrap(),
            ("action".to_string(), Value::from("urn:echo"))
        );
        assert_eq!(
            parse_property("flag=true").unwrap(),
            ("flag".to_string(), Value::Bool(true))
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }
}
