//! Pipeline descriptors and environment settings.
//!
//! A descriptor is a JSON document naming the phases of each flow and the
//! handlers to place into them:
//!
//! ```json
//! {
//!   "flows": {
//!     "in": ["Transport", "Security", "Dispatch"],
//!     "out": ["Security", "MessageOut"],
//!     "in_fault": ["FaultHandling"]
//!   },
//!   "handlers": [
//!     { "name": "Timestamp", "kind": "trace", "phase": "Security", "phase_first": true },
//!     { "name": "Signer", "namespace": "urn:security", "kind": "trace",
//!       "phase": "Security", "after": "Timestamp",
//!       "parameters": [{ "name": "algorithm", "value": "rsa-sha256" }] }
//!   ]
//! }
//! ```
//!
//! Handlers are placed in file order. Placement is order-dependent, so the
//! same file always resolves to the same pipeline.
//!
//! The `kind` field selects a factory from a [`HandlerRegistry`]; the
//! application decides what kinds exist.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::context::Flow;
use crate::description::{HandlerDescription, ParameterSet, PhaseRule};
use crate::error::PhaseError;
use crate::handler::{Handler, HandlerName};
use crate::pipeline::{Pipeline, PipelineBuilder};

/// Default `PHASECHAIN_LOG` filter.
pub const DEFAULT_LOG_FILTER: &str = "info,phasechain=debug";

// =============================================================================
// Errors
// =============================================================================

/// Error loading a descriptor or turning it into a pipeline.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read descriptor {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline descriptor")]
    Parse(#[from] serde_json::Error),

    #[error("handler '{handler}' has unknown kind '{kind}'")]
    UnknownHandlerKind { handler: String, kind: String },

    #[error("failed to create handler '{handler}' of kind '{kind}'")]
    Factory {
        handler: String,
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// The factory built a handler whose name differs from the descriptor.
    #[error("handler '{expected}' was created with name '{actual}'")]
    NameMismatch { expected: String, actual: String },

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

// =============================================================================
// Descriptor
// =============================================================================

/// Ordered phase names for each flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowsConfig {
    #[serde(default, rename = "in")]
    pub inflow: Vec<String>,
    #[serde(default, rename = "out")]
    pub outflow: Vec<String>,
    #[serde(default)]
    pub in_fault: Vec<String>,
    #[serde(default)]
    pub out_fault: Vec<String>,
}

impl FlowsConfig {
    pub fn phases(&self, flow: Flow) -> &[String] {
        match flow {
            Flow::In => &self.inflow,
            Flow::Out => &self.outflow,
            Flow::InFault => &self.in_fault,
            Flow::OutFault => &self.out_fault,
        }
    }
}

/// One handler entry of a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub kind: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default)]
    pub phase_first: bool,
    #[serde(default)]
    pub phase_last: bool,
    #[serde(default)]
    pub parameters: ParameterSet,
}

impl HandlerConfig {
    /// Name factories should give the handler they build.
    pub fn handler_name(&self) -> HandlerName {
        match &self.namespace {
            Some(ns) => HandlerName::qualified(ns.clone(), self.name.clone()),
            None => HandlerName::new(self.name.clone()),
        }
    }

    pub fn rule(&self) -> PhaseRule {
        let mut rule = PhaseRule::new().in_phase(self.phase.clone());
        if let Some(before) = &self.before {
            rule = rule.before(before.clone());
        }
        if let Some(after) = &self.after {
            rule = rule.after(after.clone());
        }
        if self.phase_first {
            rule = rule.phase_first();
        }
        if self.phase_last {
            rule = rule.phase_last();
        }
        rule
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name).map(|p| &p.value)
    }
}

/// A complete pipeline descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub flows: FlowsConfig,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Build handlers through `registry` and resolve them into a pipeline.
    ///
    /// # Errors
    ///
    /// Fails on the first handler that cannot be created or placed.
    pub fn into_pipeline(&self, registry: &HandlerRegistry) -> Result<Pipeline, ConfigError> {
        let mut builder = PipelineBuilder::new();
        for flow in Flow::ALL {
            builder.declare_flow(flow, self.flows.phases(flow).iter().cloned())?;
        }

        for config in &self.handlers {
            let handler = registry.create(config)?;
            let desc = HandlerDescription::new(handler)
                .with_rule(config.rule())
                .with_parameters(config.parameters.clone());
            builder.add_handler(&desc)?;
        }

        let pipeline = builder.build();
        debug!(handlers = self.handlers.len(), "pipeline resolved from descriptor");
        Ok(pipeline)
    }
}

// =============================================================================
// Handler Registry
// =============================================================================

type HandlerFactory = Box<dyn Fn(&HandlerConfig) -> Result<Arc<dyn Handler>> + Send + Sync>;

/// Maps descriptor `kind` strings to handler factories.
///
/// # Example
///
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register("signer", |config| {
///     let algorithm = config.parameter("algorithm").and_then(|v| v.as_str()).unwrap_or("rsa");
///     Ok(Arc::new(SignatureHandler::new(config.handler_name(), algorithm)))
/// });
///
/// let pipeline = PipelineConfig::from_file("pipeline.json")?.into_pipeline(&registry)?;
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&HandlerConfig) -> Result<Arc<dyn Handler>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build the handler for one descriptor entry.
    pub fn create(&self, config: &HandlerConfig) -> Result<Arc<dyn Handler>, ConfigError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| ConfigError::UnknownHandlerKind {
                handler: config.name.clone(),
                kind: config.kind.clone(),
            })?;

        let handler = factory(config).map_err(|source| ConfigError::Factory {
            handler: config.name.clone(),
            kind: config.kind.clone(),
            source,
        })?;

        if handler.name().local_part() != config.name {
            return Err(ConfigError::NameMismatch {
                expected: config.name.clone(),
                actual: handler.name().to_string(),
            });
        }
        Ok(handler)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// =============================================================================
// Environment Settings
// =============================================================================

/// Settings read from the environment (and `.env` when present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `PHASECHAIN_CONFIG`: descriptor path.
    pub config_path: Option<PathBuf>,
    /// `PHASECHAIN_LOG`: tracing filter directive.
    pub log_filter: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            config_path: env::var_os("PHASECHAIN_CONFIG").map(PathBuf::from),
            log_filter: match env::var("PHASECHAIN_LOG") {
                Ok(filter) => filter,
                Err(env::VarError::NotPresent) => DEFAULT_LOG_FILTER.to_string(),
                Err(e) => return Err(e).context("PHASECHAIN_LOG must be valid unicode"),
            },
        })
    }

    /// Descriptor path, preferring an explicit override.
    pub fn descriptor_path(&self, explicit: Option<PathBuf>) -> Result<PathBuf> {
        explicit
            .or_else(|| self.config_path.clone())
            .context("no descriptor given; pass a path or set PHASECHAIN_CONFIG")
    }
}
