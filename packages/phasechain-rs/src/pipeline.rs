//! Flows of phases and phase resolution from handler descriptions.
//!
//! A [`Pipeline`] maps each [`Flow`] to an ordered chain of phases. It is
//! assembled once with a [`PipelineBuilder`], then frozen and shared
//! (`Arc<Pipeline>`) by every message.
//!
//! ```text
//! PipelineBuilder
//!   ├─ declare_flow(In,  ["Transport", "Security", "Dispatch"])
//!   ├─ declare_flow(Out, ["Security", "MessageOut"])
//!   ├─ add_handler(Signer  { phase: "Security" })   → In/Security, Out/Security
//!   └─ add_handler(Router  { phase: "Dispatch" })   → In/Dispatch
//!          │
//!          ▼ build()
//! Pipeline { In: [Arc<Phase>; 3], Out: [Arc<Phase>; 2], InFault: [], OutFault: [] }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::context::Flow;
use crate::description::HandlerDescription;
use crate::error::PhaseError;
use crate::handler::Handler;
use crate::phase::Phase;

// =============================================================================
// Builder
// =============================================================================

/// Mutable assembly of a [`Pipeline`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    flows: BTreeMap<Flow, Vec<Phase>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append empty phases with the given names to a flow.
    ///
    /// # Errors
    ///
    /// [`PhaseError::DuplicatePhase`] if a name is already declared in the flow.
    pub fn declare_flow<I, S>(&mut self, flow: Flow, phases: I) -> Result<&mut Self, PhaseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in phases {
            self.add_phase(flow, Phase::new(name))?;
        }
        Ok(self)
    }

    /// Append a prebuilt phase (for example one with conditions) to a flow.
    ///
    /// # Errors
    ///
    /// [`PhaseError::DuplicatePhase`] if the flow already has a phase with
    /// this name.
    pub fn add_phase(&mut self, flow: Flow, phase: Phase) -> Result<&mut Self, PhaseError> {
        let phases = self.flows.entry(flow).or_default();
        if phases.iter().any(|p| p.name() == phase.name()) {
            return Err(PhaseError::DuplicatePhase {
                flow,
                phase: phase.name().to_string(),
            });
        }
        debug!(%flow, phase = %phase, position = phases.len(), "phase declared");
        phases.push(phase);
        Ok(self)
    }

    /// Route a description into the phase its rule names, in every flow
    /// that declares that phase.
    ///
    /// Placement is checked in every matching flow before any of them is
    /// changed, so a rejected description leaves the builder untouched.
    ///
    /// # Errors
    ///
    /// - [`PhaseError::MissingPhase`] if the rule names no phase
    /// - [`PhaseError::UnknownPhase`] if no flow declares the phase
    /// - any placement error from [`Phase::add_handler`]
    pub fn add_handler(&mut self, desc: &HandlerDescription) -> Result<&mut Self, PhaseError> {
        let Some(phase_name) = desc.rules().phase() else {
            return Err(PhaseError::MissingPhase {
                handler: desc.name().to_string(),
            });
        };

        let mut targets = 0;
        for phases in self.flows.values() {
            if let Some(phase) = phases.iter().find(|p| p.name() == phase_name) {
                phase.check_handler(desc)?;
                targets += 1;
            }
        }
        if targets == 0 {
            return Err(PhaseError::UnknownPhase {
                phase: phase_name.to_string(),
                handler: desc.name().to_string(),
            });
        }

        for (flow, phases) in self.flows.iter_mut() {
            if let Some(phase) = phases.iter_mut().find(|p| p.name() == phase_name) {
                phase.add_handler(desc)?;
                debug!(%flow, phase = phase_name, handler = %desc.name(), "handler routed");
            }
        }
        Ok(self)
    }

    /// A declared phase, for inspection before the pipeline is frozen.
    pub fn phase(&self, flow: Flow, name: &str) -> Option<&Phase> {
        self.flows.get(&flow)?.iter().find(|p| p.name() == name)
    }

    /// Freeze into a shareable pipeline.
    pub fn build(self) -> Pipeline {
        let flows = self
            .flows
            .into_iter()
            .map(|(flow, phases)| (flow, phases.into_iter().map(Arc::new).collect()))
            .collect();
        Pipeline { flows }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Immutable flows of shared phases.
///
/// `Pipeline` is `Send + Sync`; any number of messages may run through it at
/// once because all per-message state lives on the context.
#[derive(Debug, Default)]
pub struct Pipeline {
    flows: BTreeMap<Flow, Vec<Arc<Phase>>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Phases of a flow in execution order. Undeclared flows are empty.
    pub fn phases(&self, flow: Flow) -> &[Arc<Phase>] {
        self.flows.get(&flow).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn phase(&self, flow: Flow, name: &str) -> Option<&Arc<Phase>> {
        self.phases(flow).iter().find(|p| p.name() == name)
    }

    pub fn phase_names(&self, flow: Flow) -> Vec<String> {
        self.phases(flow).iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self, flow: Flow) -> bool {
        self.phases(flow).is_empty()
    }

    /// Every handler in the pipeline, each instance once, in order of first
    /// appearance across `In, Out, InFault, OutFault`.
    ///
    /// A handler routed into a phase shared by several flows is the same
    /// instance in each of them.
    pub fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        let mut seen = HashSet::new();
        let mut handlers = Vec::new();
        for phases in self.flows.values() {
            for phase in phases {
                for handler in phase.handlers() {
                    if seen.insert(Arc::as_ptr(handler) as *const () as usize) {
                        handlers.push(handler.clone());
                    }
                }
            }
        }
        handlers
    }
}
