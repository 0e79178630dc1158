//! Structured error types for configuration and message processing.
//!
//! Two families of failure exist and they never mix:
//!
//! - [`PhaseError`] is a **configuration** error. It is raised while handlers
//!   are being placed into phases, always synchronously, and is fatal for the
//!   configuration being loaded. Every variant names the phase and/or the
//!   handler so a deployer can fix the descriptor.
//! - [`PhaseFault`] and [`EngineError`] are **processing** faults raised while
//!   a message is in flight.
//!
//! Handler faults travel as `anyhow::Error` and are never wrapped by a phase:
//! the error a handler returns is the error the caller receives, so it can be
//! downcast to the handler's own type.
//!
//! Pausing is not an error. It is reported through
//! [`PhaseOutcome::Paused`](crate::PhaseOutcome) and
//! [`EngineOutcome::Paused`](crate::EngineOutcome).
//!
//! # Example
//!
//! ```ignore
//! use phasechain::{Phase, PhaseError};
//!
//! match phase.add_handler(&desc) {
//!     Ok(()) => {}
//!     Err(PhaseError::DuplicatePhaseFirst { phase, existing, .. }) => {
//!         eprintln!("{phase} already starts with {existing}");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::context::Flow;

// =============================================================================
// Configuration Errors
// =============================================================================

/// Error raised while resolving handler placement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    /// The same handler is named as both the before and the after target.
    #[error("handler '{handler}' in phase '{phase}' names '{target}' as both its before and after constraint")]
    AmbiguousConstraint {
        phase: String,
        handler: String,
        target: String,
    },

    /// The phase holds a handler marked both phaseFirst and phaseLast.
    #[error("phase '{phase}' can only hold handler '{sole}', which is both phaseFirst and phaseLast; cannot add '{handler}'")]
    Sealed {
        phase: String,
        handler: String,
        sole: String,
    },

    /// A handler marked both phaseFirst and phaseLast must be alone.
    #[error("handler '{handler}' is both phaseFirst and phaseLast but phase '{phase}' already holds {count} handler(s)")]
    SoleHandlerConflict {
        phase: String,
        handler: String,
        count: usize,
    },

    #[error("phase '{phase}' already has phaseFirst handler '{existing}'; cannot add '{handler}'")]
    DuplicatePhaseFirst {
        phase: String,
        handler: String,
        existing: String,
    },

    #[error("phase '{phase}' already has phaseLast handler '{existing}'; cannot add '{handler}'")]
    DuplicatePhaseLast {
        phase: String,
        handler: String,
        existing: String,
    },

    /// Pinned handlers cannot also carry relative constraints.
    #[error("handler '{handler}' in phase '{phase}' is marked phaseFirst or phaseLast and cannot declare before/after")]
    PinnedWithRelativeConstraint { phase: String, handler: String },

    #[error("cannot insert handler '{handler}' before '{target}' in phase '{phase}': '{target}' is marked phaseFirst")]
    BeforePhaseFirst {
        phase: String,
        handler: String,
        target: String,
    },

    #[error("cannot insert handler '{handler}' after '{target}' in phase '{phase}': '{target}' is marked phaseLast")]
    AfterPhaseLast {
        phase: String,
        handler: String,
        target: String,
    },

    /// The after-target already sits later than the before-target.
    #[error("incorrect handler order for '{handler}' in phase '{phase}': '{after}' is already placed after '{before}'")]
    ContradictoryOrder {
        phase: String,
        handler: String,
        before: String,
        after: String,
    },

    #[error("cannot insert handler '{handler}' at index {index} in phase '{phase}' holding {len} handler(s)")]
    IndexOutOfBounds {
        phase: String,
        handler: String,
        index: usize,
        len: usize,
    },

    /// A positional insert would displace a phaseFirst or phaseLast handler.
    #[error("cannot insert handler '{handler}' at index {index} in phase '{phase}': the slot belongs to pinned handler '{pinned}'")]
    PinnedSlot {
        phase: String,
        handler: String,
        index: usize,
        pinned: String,
    },

    /// The handler's rule names a phase no flow declares.
    #[error("handler '{handler}' references unknown phase '{phase}'")]
    UnknownPhase { phase: String, handler: String },

    #[error("handler '{handler}' does not name a phase")]
    MissingPhase { handler: String },

    #[error("flow '{flow}' declares phase '{phase}' more than once")]
    DuplicatePhase { flow: Flow, phase: String },
}

impl PhaseError {
    /// Name of the phase involved, when the error concerns a single phase.
    pub fn phase(&self) -> Option<&str> {
        match self {
            PhaseError::AmbiguousConstraint { phase, .. }
            | PhaseError::Sealed { phase, .. }
            | PhaseError::SoleHandlerConflict { phase, .. }
            | PhaseError::DuplicatePhaseFirst { phase, .. }
            | PhaseError::DuplicatePhaseLast { phase, .. }
            | PhaseError::PinnedWithRelativeConstraint { phase, .. }
            | PhaseError::BeforePhaseFirst { phase, .. }
            | PhaseError::AfterPhaseLast { phase, .. }
            | PhaseError::ContradictoryOrder { phase, .. }
            | PhaseError::IndexOutOfBounds { phase, .. }
            | PhaseError::PinnedSlot { phase, .. }
            | PhaseError::UnknownPhase { phase, .. }
            | PhaseError::DuplicatePhase { phase, .. } => Some(phase),
            PhaseError::MissingPhase { .. } => None,
        }
    }

    /// Name of the handler being placed, when there is one.
    pub fn handler(&self) -> Option<&str> {
        match self {
            PhaseError::AmbiguousConstraint { handler, .. }
            | PhaseError::Sealed { handler, .. }
            | PhaseError::SoleHandlerConflict { handler, .. }
            | PhaseError::DuplicatePhaseFirst { handler, .. }
            | PhaseError::DuplicatePhaseLast { handler, .. }
            | PhaseError::PinnedWithRelativeConstraint { handler, .. }
            | PhaseError::BeforePhaseFirst { handler, .. }
            | PhaseError::AfterPhaseLast { handler, .. }
            | PhaseError::ContradictoryOrder { handler, .. }
            | PhaseError::IndexOutOfBounds { handler, .. }
            | PhaseError::PinnedSlot { handler, .. }
            | PhaseError::UnknownPhase { handler, .. }
            | PhaseError::MissingPhase { handler } => Some(handler),
            PhaseError::DuplicatePhase { .. } => None,
        }
    }
}

// =============================================================================
// Processing Faults
// =============================================================================

/// Fault raised by a phase itself rather than by one of its handlers.
#[derive(Debug, Error)]
pub enum PhaseFault {
    #[error("pre-condition check failed for phase '{phase}'")]
    Precondition {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("post-condition check failed for phase '{phase}'")]
    Postcondition {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    /// A handler panicked. The panic is caught so that one handler cannot
    /// take down the task driving the message.
    #[error("handler '{handler}' panicked in phase '{phase}': {message}")]
    HandlerPanicked {
        phase: String,
        handler: String,
        message: String,
    },
}

impl PhaseFault {
    pub fn phase(&self) -> &str {
        match self {
            PhaseFault::Precondition { phase, .. }
            | PhaseFault::Postcondition { phase, .. }
            | PhaseFault::HandlerPanicked { phase, .. } => phase,
        }
    }
}

/// What happened when the engine ran the fault flow for a failed message.
#[derive(Debug)]
pub enum FaultHandling {
    /// The failed flow has no fault counterpart, or it declares no phases.
    NotConfigured,
    /// The fault flow ran to completion.
    Completed,
    /// The fault flow suspended; resume the context to finish it.
    Paused { phase: String },
    /// The fault flow faulted as well.
    Failed(anyhow::Error),
}

impl FaultHandling {
    pub fn is_completed(&self) -> bool {
        matches!(self, FaultHandling::Completed)
    }
}

impl fmt::Display for FaultHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultHandling::NotConfigured => write!(f, "no fault flow"),
            FaultHandling::Completed => write!(f, "fault flow completed"),
            FaultHandling::Paused { phase } => write!(f, "fault flow paused in phase '{}'", phase),
            FaultHandling::Failed(e) => write!(f, "fault flow failed: {}", e),
        }
    }
}

/// Error returned by the [`Engine`](crate::Engine) driver.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A phase of the flow faulted. `source` is the original fault, exactly
    /// as the handler or phase raised it.
    #[error("flow '{flow}' faulted in phase '{phase}' ({handling})")]
    Faulted {
        flow: Flow,
        phase: String,
        handling: FaultHandling,
        #[source]
        source: anyhow::Error,
    },

    #[error("message {id} is not paused")]
    NotPaused { id: Uuid },
}

impl EngineError {
    /// The original fault, if this error carries one.
    pub fn fault(&self) -> Option<&anyhow::Error> {
        match self {
            EngineError::Faulted { source, .. } => Some(source),
            EngineError::NotPaused { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_configuration_errors_name_phase_and_handler() {
        let err = PhaseError::DuplicatePhaseFirst {
            phase: "Security".into(),
            handler: "Signer".into(),
            existing: "Timestamp".into(),
        };
        let display = err.to_string();
        assert!(display.contains("Security"));
        assert!(display.contains("Signer"));
        assert!(display.contains("Timestamp"));
        assert_eq!(err.phase(), Some("Security"));
        assert_eq!(err.handler(), Some("Signer"));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = PhaseError::AmbiguousConstraint {
            phase: "Dispatch".into(),
            handler: "Router".into(),
            target: "Addressing".into(),
        };

        match &err {
            PhaseError::AmbiguousConstraint { target, .. } => assert_eq!(target, "Addressing"),
            _ => panic!("Expected AmbiguousConstraint"),
        }
    }

    #[test]
    fn test_missing_phase_has_no_phase() {
        let err = PhaseError::MissingPhase {
            handler: "Orphan".into(),
        };
        assert_eq!(err.phase(), None);
        assert_eq!(err.handler(), Some("Orphan"));
    }

    #[test]
    fn test_precondition_fault_keeps_source() {
        let fault = PhaseFault::Precondition {
            phase: "Security".into(),
            source: anyhow::anyhow!("missing header"),
        };
        assert!(fault.to_string().contains("Security"));
        assert_eq!(fault.source().unwrap().to_string(), "missing header");
        assert_eq!(fault.phase(), "Security");
    }

    #[test]
    fn test_fault_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = PhaseFault::HandlerPanicked {
            phase: "Dispatch".into(),
            handler: "Router".into(),
            message: "boom".into(),
        }
        .into();

        match err.downcast_ref::<PhaseFault>() {
            Some(PhaseFault::HandlerPanicked { message, .. }) => assert_eq!(message, "boom"),
            _ => panic!("Expected HandlerPanicked"),
        }
    }

    #[test]
    fn test_engine_error_exposes_original_fault() {
        let err = EngineError::Faulted {
            flow: Flow::In,
            phase: "Dispatch".into(),
            handling: FaultHandling::Completed,
            source: anyhow::anyhow!("no operation"),
        };
        let display = err.to_string();
        assert!(display.contains("'in'"));
        assert!(display.contains("Dispatch"));
        assert!(display.contains("fault flow completed"));
        assert_eq!(err.fault().unwrap().to_string(), "no operation");
    }
}
