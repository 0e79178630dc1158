//! Phases: ordered handler containers with resumable invocation.
//!
//! A [`Phase`] has two lives:
//!
//! 1. **Configuration** (`&mut self`): descriptions are placed one at a time
//!    by [`Phase::add_handler`], honoring phaseFirst/phaseLast pins and
//!    before/after constraints.
//! 2. **Processing** (`&self`): [`Phase::invoke`] walks the handlers for one
//!    message. The phase is shared across messages and never mutated here;
//!    the position lives on the [`MessageContext`].
//!
//! # Invocation State Machine
//!
//! ```text
//!            fresh entry                 handler Suspend / ctx.pause()
//!  idle ──► pre-conditions ──► running ─────────────────────────────► paused
//!               │                 │  ▲                                  │
//!               │ Err             │  └──────── invoke again ────────────┘
//!               ▼                 │ handler Err / panic
//!            faulted ◄────────────┤
//!               ▲                 │ end of list
//!               │ Err             ▼
//!               └────────── post-conditions ──► completed (cursor reset)
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::context::MessageContext;
use crate::description::HandlerDescription;
use crate::error::{PhaseError, PhaseFault};
use crate::handler::{Entry, Handler, HandlerName, HandlerResponse};
use crate::sequence::{resolve_slot, HandlerSequence, Pins, Slot};

/// Boundary checks run around a whole phase.
///
/// Both default to success. Implement this to validate message properties a
/// phase depends on before any of its handlers run, or to verify what they
/// produced afterwards.
///
/// # Example
///
/// ```ignore
/// struct RequireAction;
///
/// impl PhaseConditions for RequireAction {
///     fn check_preconditions(&self, ctx: &MessageContext) -> anyhow::Result<()> {
///         ctx.property("wsa.action").map(|_| ()).context("wsa:Action is required")
///     }
/// }
///
/// let phase = Phase::with_conditions("Dispatch", Arc::new(RequireAction));
/// ```
pub trait PhaseConditions: Send + Sync + 'static {
    fn check_preconditions(&self, _ctx: &MessageContext) -> Result<()> {
        Ok(())
    }

    fn check_postconditions(&self, _ctx: &MessageContext) -> Result<()> {
        Ok(())
    }
}

/// Result of one pass through a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Every handler ran; the cursor is back at 0.
    Completed,
    /// A handler suspended; the cursor still points at it.
    Paused,
}

/// An ordered collection of handlers.
pub struct Phase {
    name: HandlerName,
    handlers: HandlerSequence,
    pins: Pins,
    conditions: Option<Arc<dyn PhaseConditions>>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: HandlerName::new(name.into()),
            handlers: HandlerSequence::default(),
            pins: Pins::default(),
            conditions: None,
        }
    }

    /// Create a phase with pre/post-condition checks.
    pub fn with_conditions(name: impl Into<String>, conditions: Arc<dyn PhaseConditions>) -> Self {
        Self {
            conditions: Some(conditions),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        self.name.local_part()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = HandlerName::new(name.into());
    }

    /// Handlers in resolved invocation order.
    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        self.handlers.as_slice()
    }

    /// Local names in resolved invocation order.
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.local_names().map(str::to_string).collect()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn contains(&self, local: &str) -> bool {
        self.handlers.contains(local)
    }

    pub fn has_phase_first(&self) -> bool {
        self.pins.first
    }

    pub fn has_phase_last(&self) -> bool {
        self.pins.last
    }

    /// True once a handler marked both phaseFirst and phaseLast occupies
    /// the phase; nothing else can be added.
    pub fn is_sealed(&self) -> bool {
        self.pins.sealed
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Place a described handler according to its rules.
    ///
    /// Adding a handler whose local name is already present is a no-op, so
    /// the same module configuration can be applied more than once.
    ///
    /// # Errors
    ///
    /// Returns a [`PhaseError`] naming this phase and the handler when the
    /// rules cannot be satisfied. The phase is left unchanged on error.
    pub fn add_handler(&mut self, desc: &HandlerDescription) -> Result<(), PhaseError> {
        let Some(slot) = self.plan(desc)? else {
            debug!(phase = %self.name, handler = %desc.name(), "handler already present, skipping");
            return Ok(());
        };

        let handler = desc.handler().clone();
        let index = match slot {
            Slot::Sole => {
                self.handlers.push(handler);
                self.pins.sealed = true;
                0
            }
            Slot::First => {
                self.handlers.insert(0, handler);
                self.pins.first = true;
                0
            }
            Slot::Last => {
                self.handlers.push(handler);
                self.pins.last = true;
                self.handlers.len() - 1
            }
            Slot::At(index) => {
                self.handlers.insert(index, handler);
                index
            }
        };

        debug!(
            phase = %self.name,
            handler = %desc.name(),
            index,
            ?slot,
            "handler placed"
        );
        Ok(())
    }

    /// Check whether [`Phase::add_handler`] would accept `desc`, without
    /// placing it.
    pub fn check_handler(&self, desc: &HandlerDescription) -> Result<(), PhaseError> {
        self.plan(desc).map(|_| ())
    }

    /// Resolve where `desc` lands. `None` means it is already present.
    fn plan(&self, desc: &HandlerDescription) -> Result<Option<Slot>, PhaseError> {
        if self.handlers.contains(desc.name().local_part()) {
            return Ok(None);
        }

        if self.pins.sealed {
            return Err(PhaseError::Sealed {
                phase: self.name().to_string(),
                handler: desc.name().to_string(),
                sole: self.handlers.first_name(),
            });
        }

        desc.validate(self.name())?;
        resolve_slot(&self.handlers, self.pins, desc, self.name()).map(Some)
    }

    /// Insert a handler at an explicit position, bypassing rule resolution.
    ///
    /// A phaseFirst handler keeps index 0 and a phaseLast handler keeps the
    /// final index; positions that would displace either are rejected.
    ///
    /// # Errors
    ///
    /// - [`PhaseError::Sealed`] if the phase holds a sole handler
    /// - [`PhaseError::IndexOutOfBounds`] if `index` exceeds the handler count
    /// - [`PhaseError::PinnedSlot`] if `index` is 0 behind a phaseFirst
    ///   handler, or the end behind a phaseLast handler
    pub fn insert_handler(&mut self, handler: Arc<dyn Handler>, index: usize) -> Result<(), PhaseError> {
        if self.pins.sealed {
            return Err(PhaseError::Sealed {
                phase: self.name().to_string(),
                handler: handler.name().to_string(),
                sole: self.handlers.first_name(),
            });
        }
        if index > self.handlers.len() {
            return Err(PhaseError::IndexOutOfBounds {
                phase: self.name().to_string(),
                handler: handler.name().to_string(),
                index,
                len: self.handlers.len(),
            });
        }

        let pinned = if self.pins.first && index == 0 {
            Some(self.handlers.first_name())
        } else if self.pins.last && index == self.handlers.len() {
            Some(self.handlers.last_name())
        } else {
            None
        };
        if let Some(pinned) = pinned {
            return Err(PhaseError::PinnedSlot {
                phase: self.name().to_string(),
                handler: handler.name().to_string(),
                index,
                pinned,
            });
        }

        debug!(phase = %self.name, handler = %handler.name(), index, "handler inserted");
        self.handlers.insert(index, handler);
        Ok(())
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Drive one pass of the message through this phase.
    ///
    /// Starts at the context's cursor. A fresh entry runs the pre-conditions
    /// first; reaching the end resets the cursor and runs the post-conditions.
    /// A suspended handler leaves the cursor on itself and is re-invoked with
    /// [`Entry::Resumed`] the next time this is called with the same context.
    ///
    /// # Errors
    ///
    /// - The handler's own error, unchanged, when a handler faults
    /// - [`PhaseFault`] for condition failures and handler panics
    pub async fn invoke(&self, ctx: &mut MessageContext) -> Result<PhaseOutcome> {
        let fresh = ctx.cursor_mut().enter();
        ctx.set_paused(false);

        if fresh {
            debug!(phase = %self.name, "checking pre-conditions");
            if let Err(source) = self.check_preconditions(ctx) {
                error!(phase = %self.name, error = ?source, "pre-condition check failed");
                ctx.cursor_mut().complete();
                return Err(PhaseFault::Precondition {
                    phase: self.name().to_string(),
                    source,
                }
                .into());
            }
        }

        debug!(phase = %self.name, resumed = !fresh, "invoking phase");

        let depth = ctx.cursor().depth();
        let mut index = ctx.current_handler_index();
        let mut entry = if !fresh && ctx.cursor().is_suspended() {
            Entry::Resumed
        } else {
            Entry::Fresh
        };

        while index < self.handlers.len() {
            let handler = &self.handlers[index];
            info!(phase = %self.name, handler = %handler.name(), index, "invoking handler");

            let result = AssertUnwindSafe(handler.invoke(ctx, entry))
                .catch_unwind()
                .await;
            entry = Entry::Fresh;

            let response = match result {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    error!(phase = %self.name, handler = %handler.name(), index, error = ?err, "handler faulted");
                    ctx.cursor_mut().unwind_to(depth);
                    ctx.cursor_mut().leave();
                    return Err(err);
                }
                Err(panic_info) => {
                    let message = extract_panic_message(&panic_info);
                    error!(phase = %self.name, handler = %handler.name(), index, panic = %message, "handler panicked");
                    ctx.cursor_mut().unwind_to(depth);
                    ctx.cursor_mut().leave();
                    return Err(PhaseFault::HandlerPanicked {
                        phase: self.name().to_string(),
                        handler: handler.name().to_string(),
                        message,
                    }
                    .into());
                }
            };

            if response == HandlerResponse::Suspend {
                ctx.pause();
            }
            if ctx.is_paused() {
                warn!(phase = %self.name, handler = %handler.name(), index, "handler suspended message");
                ctx.cursor_mut().suspend();
                return Ok(PhaseOutcome::Paused);
            }

            index += 1;
            ctx.set_current_handler_index(index);
        }

        debug!(phase = %self.name, "checking post-conditions");
        ctx.cursor_mut().complete();
        if let Err(source) = self.check_postconditions(ctx) {
            error!(phase = %self.name, error = ?source, "post-condition check failed");
            return Err(PhaseFault::Postcondition {
                phase: self.name().to_string(),
                source,
            }
            .into());
        }

        Ok(PhaseOutcome::Completed)
    }

    fn check_preconditions(&self, ctx: &MessageContext) -> Result<()> {
        match &self.conditions {
            Some(conditions) => conditions.check_preconditions(ctx),
            None => Ok(()),
        }
    }

    fn check_postconditions(&self, ctx: &MessageContext) -> Result<()> {
        match &self.conditions {
            Some(conditions) => conditions.check_postconditions(ctx),
            None => Ok(()),
        }
    }
}

/// Phases nest: a phase can be registered as a handler in another phase.
#[async_trait]
impl Handler for Phase {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
        match Phase::invoke(self, ctx).await? {
            PhaseOutcome::Completed => Ok(HandlerResponse::Continue),
            PhaseOutcome::Paused => Ok(HandlerResponse::Suspend),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        for handler in self.handlers.as_slice() {
            handler.cleanup().await?;
        }
        Ok(())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name())
            .field("handlers", &self.handler_names())
            .field("pins", &self.pins)
            .finish_non_exhaustive()
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
