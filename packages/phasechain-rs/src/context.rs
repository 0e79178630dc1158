//! Per-message state carried through a pipeline.
//!
//! A [`MessageContext`] is owned by exactly one in-flight message. Phases and
//! handlers are shared across messages, so everything that changes while a
//! message is processed lives here: the property bag, the paused flag, the
//! engine's position in the flow and the [`PhaseCursor`].
//!
//! # Cursor Frames
//!
//! A phase may itself be registered as a handler inside another phase. The
//! cursor therefore keeps one frame per nesting level:
//!
//! ```text
//! Phase "Security"            frames: [2]
//!   ├─ Timestamp              (done)
//!   ├─ Decrypt                (done)
//!   └─ Phase "TokenChecks"    frames: [2, 1]   ← paused here
//!        ├─ Expiry            (done)
//!        └─ Revocation        ← awaiting CRL fetch
//! ```
//!
//! A frame exists from first entry into a phase until that phase completes.
//! Pausing or faulting leaves the frame in place. Only frames left by a pause
//! hand [`Entry::Resumed`](crate::Entry) to the handler they point at.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use uuid::Uuid;

/// Direction a message travels through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Inbound request processing.
    In,
    /// Outbound response or request processing.
    Out,
    /// Runs after a fault in the inbound flow.
    InFault,
    /// Runs after a fault in the outbound flow.
    OutFault,
}

impl Flow {
    pub const ALL: [Flow; 4] = [Flow::In, Flow::Out, Flow::InFault, Flow::OutFault];

    /// The flow that handles faults raised in this one, if any.
    pub fn fault_counterpart(self) -> Option<Flow> {
        match self {
            Flow::In => Some(Flow::InFault),
            Flow::Out => Some(Flow::OutFault),
            Flow::InFault | Flow::OutFault => None,
        }
    }

    pub fn is_fault(self) -> bool {
        matches!(self, Flow::InFault | Flow::OutFault)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Flow::In => "in",
            Flow::Out => "out",
            Flow::InFault => "in_fault",
            Flow::OutFault => "out_fault",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message position within nested phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseCursor {
    frames: SmallVec<[usize; 4]>,
    depth: usize,
    suspended: bool,
}

impl PhaseCursor {
    /// Handler index of the phase currently executing.
    ///
    /// Outside any phase this is the outermost retained frame, which is where
    /// the next invocation will pick up (0 when nothing is retained).
    pub fn position(&self) -> usize {
        match self.depth {
            0 => self.frames.first().copied().unwrap_or(0),
            depth => self.frames.get(depth - 1).copied().unwrap_or(0),
        }
    }

    pub fn set_position(&mut self, index: usize) {
        let level = self.depth.saturating_sub(1);
        match self.frames.get_mut(level) {
            Some(frame) => *frame = index,
            None => {
                self.frames.truncate(level);
                self.frames.push(index);
            }
        }
    }

    /// Retained frames, outermost first.
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    /// Number of phases currently on the call stack.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True when no frame is retained.
    pub fn is_clear(&self) -> bool {
        self.frames.is_empty()
    }

    /// True when the retained frames were left by a suspended handler
    /// rather than a fault.
    pub fn is_suspended(&self) -> bool {
        self.suspended && !self.frames.is_empty()
    }

    /// Enter a phase. Returns `true` when this is a fresh entry (no frame was
    /// retained at this level).
    pub(crate) fn enter(&mut self) -> bool {
        let level = self.depth;
        let fresh = self.frames.len() <= level;
        if fresh {
            self.frames.truncate(level);
            self.frames.push(0);
        }
        self.depth += 1;
        fresh
    }

    /// Leave a phase that completed: its frame is dropped.
    pub(crate) fn complete(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.frames.truncate(self.depth);
    }

    /// Leave a phase that paused: its frame is retained for resumption.
    pub(crate) fn suspend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.suspended = true;
    }

    /// Leave a phase that faulted: its frame is retained for diagnostics.
    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.suspended = false;
    }

    /// Restore the call depth after a handler unwound without leaving.
    pub(crate) fn unwind_to(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Drop every frame.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.depth = 0;
        self.suspended = false;
    }
}

/// Opaque per-message carrier handed to every handler.
///
/// # Example
///
/// ```ignore
/// let mut ctx = MessageContext::new(Flow::In);
/// ctx.set_property("wsa.action", "urn:GetQuote");
///
/// match engine.receive(&mut ctx).await? {
///     EngineOutcome::Completed => {}
///     EngineOutcome::Paused { phase } => park(ctx, phase),
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MessageContext {
    id: Uuid,
    created_at: DateTime<Utc>,
    flow: Flow,
    properties: Map<String, Value>,
    paused: bool,
    phase_index: usize,
    cursor: PhaseCursor,
}

impl MessageContext {
    pub fn new(flow: Flow) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            flow,
            properties: Map::new(),
            paused: false,
            phase_index: 0,
            cursor: PhaseCursor::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn set_flow(&mut self, flow: Flow) {
        self.flow = flow;
    }

    // ---------------------------------------------------------------------
    // Properties
    // ---------------------------------------------------------------------

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Deserialize a property into a typed value.
    ///
    /// Returns `None` if the property is absent or has a different shape.
    pub fn property_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.properties
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    // ---------------------------------------------------------------------
    // Suspension
    // ---------------------------------------------------------------------

    /// Request suspension. The running phase stops after the current handler
    /// returns and keeps its cursor on that handler.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Clear the pause flag.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // ---------------------------------------------------------------------
    // Positions
    // ---------------------------------------------------------------------

    /// Cursor of the phase currently executing (see [`PhaseCursor::position`]).
    pub fn current_handler_index(&self) -> usize {
        self.cursor.position()
    }

    pub fn set_current_handler_index(&mut self, index: usize) {
        self.cursor.set_position(index);
    }

    /// Index of the phase the engine is running within the current flow.
    pub fn current_phase_index(&self) -> usize {
        self.phase_index
    }

    pub fn set_current_phase_index(&mut self, index: usize) {
        self.phase_index = index;
    }

    pub fn cursor(&self) -> &PhaseCursor {
        &self.cursor
    }

    pub(crate) fn cursor_mut(&mut self) -> &mut PhaseCursor {
        &mut self.cursor
    }

    /// Forget every position, ready to start a flow from the top.
    pub(crate) fn rewind(&mut self) {
        self.phase_index = 0;
        self.cursor.reset();
        self.paused = false;
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::new(Flow::In)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_counterparts() {
        assert_eq!(Flow::In.fault_counterpart(), Some(Flow::InFault));
        assert_eq!(Flow::Out.fault_counterpart(), Some(Flow::OutFault));
        assert_eq!(Flow::InFault.fault_counterpart(), None);
        assert_eq!(Flow::OutFault.fault_counterpart(), None);
        assert!(Flow::OutFault.is_fault());
        assert!(!Flow::In.is_fault());
    }

    #[test]
    fn test_flow_serde_names() {
        assert_eq!(serde_json::to_value(Flow::InFault).unwrap(), "in_fault");
        let flow: Flow = serde_json::from_value(serde_json::json!("out")).unwrap();
        assert_eq!(flow, Flow::Out);
        assert_eq!(Flow::OutFault.to_string(), "out_fault");
    }

    #[test]
    fn test_cursor_fresh_enter_and_complete() {
        let mut cursor = PhaseCursor::default();
        assert!(cursor.enter());
        assert_eq!(cursor.position(), 0);
        cursor.set_position(3);
        assert_eq!(cursor.position(), 3);
        cursor.complete();
        assert!(cursor.is_clear());
        assert_eq!(cursor.depth(), 0);
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_cursor_suspend_retains_frame() {
        let mut cursor = PhaseCursor::default();
        cursor.enter();
        cursor.set_position(2);
        cursor.suspend();

        assert_eq!(cursor.frames(), &[2]);
        assert_eq!(cursor.position(), 2);
        assert!(cursor.is_suspended());

        // Re-entering resumes rather than starting fresh
        assert!(!cursor.enter());
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn test_cursor_nested_frames() {
        let mut cursor = PhaseCursor::default();
        cursor.enter();
        cursor.set_position(1);
        cursor.enter();
        cursor.set_position(4);
        assert_eq!(cursor.frames(), &[1, 4]);

        // Inner pauses, outer pauses
        cursor.suspend();
        cursor.suspend();
        assert_eq!(cursor.frames(), &[1, 4]);

        // Resume both levels
        assert!(!cursor.enter());
        assert_eq!(cursor.position(), 1);
        assert!(!cursor.enter());
        assert_eq!(cursor.position(), 4);

        // Inner completes, outer continues
        cursor.complete();
        assert_eq!(cursor.frames(), &[1]);
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn test_cursor_fault_retains_frame_without_suspension() {
        let mut cursor = PhaseCursor::default();
        cursor.enter();
        cursor.set_position(1);
        cursor.suspend();
        assert!(cursor.is_suspended());

        // Resumed, then the handler at the cursor faults
        cursor.enter();
        cursor.leave();
        assert_eq!(cursor.frames(), &[1]);
        assert!(!cursor.is_suspended());

        cursor.reset();
        assert!(!cursor.is_suspended());
    }

    #[test]
    fn test_set_position_outside_phase() {
        let mut cursor = PhaseCursor::default();
        cursor.set_position(5);
        assert_eq!(cursor.frames(), &[5]);
        assert!(!cursor.enter());
        assert_eq!(cursor.position(), 5);
    }

    #[test]
    fn test_properties() {
        let mut ctx = MessageContext::new(Flow::In);
        ctx.set_property("retries", 3);
        ctx.set_property("action", "urn:GetQuote");

        assert_eq!(ctx.property_as::<u32>("retries"), Some(3));
        assert_eq!(ctx.property("action").unwrap(), "urn:GetQuote");
        assert_eq!(ctx.property_as::<u32>("action"), None);
        assert!(ctx.remove_property("retries").is_some());
        assert!(ctx.property("retries").is_none());
    }

    #[test]
    fn test_pause_flag() {
        let mut ctx = MessageContext::default();
        assert!(!ctx.is_paused());
        ctx.pause();
        assert!(ctx.is_paused());
        ctx.resume();
        assert!(!ctx.is_paused());
        ctx.set_paused(true);
        assert!(ctx.is_paused());
    }

    #[test]
    fn test_rewind_clears_positions() {
        let mut ctx = MessageContext::default();
        ctx.set_current_phase_index(2);
        ctx.set_current_handler_index(3);
        ctx.pause();

        ctx.rewind();

        assert_eq!(ctx.current_phase_index(), 0);
        assert_eq!(ctx.current_handler_index(), 0);
        assert!(ctx.cursor().is_clear());
        assert!(!ctx.is_paused());
    }

    #[test]
    fn test_contexts_have_distinct_ids() {
        let a = MessageContext::default();
        let b = MessageContext::default();
        assert_ne!(a.id(), b.id());
    }
}
