//! # Phasechain
//!
//! An ordered interceptor chain for message processing: handlers grouped into
//! named phases, phases chained into flows, and a per-message cursor that
//! lets any handler suspend a message and pick it up again later.
//!
//! ## Core Concepts
//!
//! - [`Handler`] = a shared processing unit (one instance, many messages)
//! - [`Phase`] = an ordered list of handlers, itself usable as a handler
//! - [`Pipeline`] = the phases of each [`Flow`]
//! - [`MessageContext`] = everything that belongs to one in-flight message
//!
//! ## Architecture
//!
//! ```text
//! Descriptor (JSON) ──► PipelineConfig ──► HandlerRegistry.create()
//!                                               │
//!                                               ▼
//!                            PipelineBuilder.add_handler(desc)
//!                                               │ Phase.add_handler()
//!                                               │ (phaseFirst / phaseLast /
//!                                               │  before / after placement)
//!                                               ▼
//!                                  Arc<Pipeline> (frozen, shared)
//!                                               │
//!     MessageContext ──► Engine.receive() ──► Phase ──► Phase ──► Phase
//!                              ▲                  │
//!                              │                  ├─► Handler.invoke() ─► Continue
//!                              │                  ├─► Handler.invoke() ─► Suspend ──┐
//!                              │                  └─► Handler.invoke() ─► Err       │
//!                              │                                 │                  │
//!                              │                  fault flow ◄───┘                  │
//!                              └──────────── Engine.resume() ◄──────────────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **phaseFirst stays first, phaseLast stays last** - no later placement
//!    displaces a pinned handler
//! 2. **Local names are unique per phase** - re-adding a name is a no-op
//! 3. **Failed placement changes nothing** - validation precedes mutation
//! 4. **Phases are shared, cursors are not** - positions live on the context
//! 5. **Resume re-enters the suspended handler** - with [`Entry::Resumed`]
//! 6. **Handler faults propagate unchanged** - downcast to the handler's type
//!
//! ## Example
//!
//! ```ignore
//! use phasechain::{Engine, Flow, HandlerDescription, MessageContext, PipelineBuilder};
//! use std::sync::Arc;
//!
//! let mut builder = PipelineBuilder::new();
//! builder.declare_flow(Flow::In, ["Transport", "Security", "Dispatch"])?;
//! builder.add_handler(
//!     &HandlerDescription::new(Arc::new(TimestampHandler)).in_phase("Security").phase_first(),
//! )?;
//! builder.add_handler(
//!     &HandlerDescription::new(Arc::new(SignatureHandler)).in_phase("Security").after("Timestamp"),
//! )?;
//!
//! let engine = Engine::new(Arc::new(builder.build()));
//! let mut ctx = MessageContext::new(Flow::In);
//! engine.receive(&mut ctx).await?;
//! ```

// Core modules
mod context;
mod description;
mod engine;
mod error;
mod handler;
mod phase;
mod pipeline;
mod sequence;

// Descriptor loading and environment settings
pub mod config;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export handler types
pub use handler::{Entry, Handler, HandlerName, HandlerResponse};

// Re-export description types
pub use description::{Constraint, HandlerDescription, Parameter, ParameterSet, PhaseRule};

// Re-export context types
pub use context::{Flow, MessageContext, PhaseCursor};

// Re-export phase types
pub use phase::{Phase, PhaseConditions, PhaseOutcome};

// Re-export pipeline types
pub use pipeline::{Pipeline, PipelineBuilder};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineOutcome, FAULT_REASON_PROPERTY};

// Re-export error types
pub use crate::error::{EngineError, FaultHandling, PhaseError, PhaseFault};

// Re-export config types
pub use config::{ConfigError, HandlerConfig, HandlerRegistry, PipelineConfig, Settings};

// Re-export commonly used external types
pub use async_trait::async_trait;
