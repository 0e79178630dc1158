//! Ordered handler sequence and the placement resolver.
//!
//! Placement is greedy and single-pass: each description is resolved against
//! the sequence as it stands when the description arrives. The resulting
//! order therefore depends on registration order, not only on the declared
//! constraints. Callers that need reproducible results must register in a
//! stable order (e.g. descriptor file order).
//!
//! Resolution never mutates. [`resolve_slot`] computes where a description
//! goes (or why it cannot go anywhere) and the phase applies the slot, so a
//! rejected description leaves the phase untouched.

use std::ops::Index;
use std::sync::Arc;

use crate::description::{Constraint, HandlerDescription};
use crate::error::PhaseError;
use crate::handler::Handler;

/// Ordered, index-addressable list of handlers.
#[derive(Clone, Default)]
pub(crate) struct HandlerSequence {
    entries: Vec<Arc<dyn Handler>>,
}

impl HandlerSequence {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[Arc<dyn Handler>] {
        &self.entries
    }

    /// Index of the handler whose local name matches.
    pub fn position(&self, local: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|h| h.name().local_part() == local)
    }

    pub fn contains(&self, local: &str) -> bool {
        self.position(local).is_some()
    }

    pub fn local_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|h| h.name().local_part())
    }

    pub fn first_name(&self) -> String {
        self.entries
            .first()
            .map(|h| h.name().to_string())
            .unwrap_or_default()
    }

    pub fn last_name(&self) -> String {
        self.entries
            .last()
            .map(|h| h.name().to_string())
            .unwrap_or_default()
    }

    /// Insert at `index`, shifting later handlers back.
    ///
    /// Callers check bounds; `index == len` appends.
    pub fn insert(&mut self, index: usize, handler: Arc<dyn Handler>) {
        self.entries.insert(index, handler);
    }

    pub fn push(&mut self, handler: Arc<dyn Handler>) {
        self.entries.push(handler);
    }
}

impl Index<usize> for HandlerSequence {
    type Output = Arc<dyn Handler>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

/// Placement flags a phase has accumulated so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Pins {
    /// A phaseFirst handler sits at index 0.
    pub first: bool,
    /// A phaseLast handler sits at the final index.
    pub last: bool,
    /// A handler that is both phaseFirst and phaseLast occupies the phase.
    pub sealed: bool,
}

/// Where a description lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Sole occupant; seals the phase.
    Sole,
    /// Index 0; pins the first position.
    First,
    /// End of the sequence; pins the last position.
    Last,
    /// Unpinned insertion at an index.
    At(usize),
}

/// Resolve the slot for a description that has already passed
/// [`HandlerDescription::validate`] and is not a duplicate.
pub(crate) fn resolve_slot(
    seq: &HandlerSequence,
    pins: Pins,
    desc: &HandlerDescription,
    phase: &str,
) -> Result<Slot, PhaseError> {
    let rules = desc.rules();
    let handler = desc.name().to_string();

    match (rules.is_phase_first(), rules.is_phase_last()) {
        (true, true) => {
            if seq.is_empty() {
                Ok(Slot::Sole)
            } else {
                Err(PhaseError::SoleHandlerConflict {
                    phase: phase.to_string(),
                    handler,
                    count: seq.len(),
                })
            }
        }
        (true, false) => {
            if pins.first {
                Err(PhaseError::DuplicatePhaseFirst {
                    phase: phase.to_string(),
                    handler,
                    existing: seq.first_name(),
                })
            } else {
                Ok(Slot::First)
            }
        }
        (false, true) => {
            if pins.last {
                Err(PhaseError::DuplicatePhaseLast {
                    phase: phase.to_string(),
                    handler,
                    existing: seq.last_name(),
                })
            } else {
                Ok(Slot::Last)
            }
        }
        (false, false) => match rules.constraint() {
            Constraint::Anywhere => Ok(Slot::At(default_index(seq, pins))),
            Constraint::Before(target) => before_slot(seq, pins, target, phase, handler),
            Constraint::After(target) => after_slot(seq, pins, target, phase, handler),
            Constraint::Both { before, after } => {
                both_slot(seq, pins, before, after, phase, handler)
            }
        },
    }
}

/// Append, but keep a pinned phaseLast handler at the end.
fn default_index(seq: &HandlerSequence, pins: Pins) -> usize {
    if pins.last && !seq.is_empty() {
        seq.len() - 1
    } else {
        seq.len()
    }
}

fn before_slot(
    seq: &HandlerSequence,
    pins: Pins,
    target: &str,
    phase: &str,
    handler: String,
) -> Result<Slot, PhaseError> {
    match seq.position(target) {
        Some(0) if pins.first => Err(PhaseError::BeforePhaseFirst {
            phase: phase.to_string(),
            handler,
            target: target.to_string(),
        }),
        Some(index) => Ok(Slot::At(index)),
        None => Ok(Slot::At(default_index(seq, pins))),
    }
}

fn after_slot(
    seq: &HandlerSequence,
    pins: Pins,
    target: &str,
    phase: &str,
    handler: String,
) -> Result<Slot, PhaseError> {
    match seq.position(target) {
        Some(index) if pins.last && index + 1 == seq.len() => Err(PhaseError::AfterPhaseLast {
            phase: phase.to_string(),
            handler,
            target: target.to_string(),
        }),
        Some(index) => Ok(Slot::At(index + 1)),
        // Target not registered yet: go to the front so it can still land
        // after us, behind a pinned phaseFirst handler.
        None if pins.first => Ok(Slot::At(1)),
        None => Ok(Slot::At(0)),
    }
}

fn both_slot(
    seq: &HandlerSequence,
    pins: Pins,
    before: &str,
    after: &str,
    phase: &str,
    handler: String,
) -> Result<Slot, PhaseError> {
    let mut before_index = None;
    let mut after_index = None;

    for (index, name) in seq.local_names().enumerate() {
        if name == after {
            after_index = Some(index);
        } else if name == before {
            before_index = Some(index);
        }
        if before_index.is_some() && after_index.is_some() {
            break;
        }
    }

    match (before_index, after_index) {
        (Some(b), Some(a)) if a > b => Err(PhaseError::ContradictoryOrder {
            phase: phase.to_string(),
            handler,
            before: before.to_string(),
            after: after.to_string(),
        }),
        // A missing before-target imposes nothing.
        (None, _) => Ok(Slot::At(default_index(seq, pins))),
        (Some(0), _) if pins.first => Err(PhaseError::BeforePhaseFirst {
            phase: phase.to_string(),
            handler,
            target: before.to_string(),
        }),
        (Some(b), _) => Ok(Slot::At(b)),
    }
}
