//! Testing utilities for phases and pipelines.
//!
//! Scripted handlers that record what happened to them, plus an ordering
//! assertion for resolved phases.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! phasechain = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use phasechain::testing::{InvocationLog, RecordingHandler, SuspendingHandler};
//!
//! let log = InvocationLog::new();
//! let mut phase = Phase::new("Dispatch");
//! phase.add_handler(&HandlerDescription::new(Arc::new(RecordingHandler::new("A", log.clone()))))?;
//! phase.add_handler(&HandlerDescription::new(Arc::new(SuspendingHandler::new("Wait", log.clone(), 1))))?;
//!
//! let mut ctx = MessageContext::new(Flow::In);
//! assert_eq!(phase.invoke(&mut ctx).await?, PhaseOutcome::Paused);
//! assert_eq!(log.entries(), vec!["A", "Wait"]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::context::MessageContext;
use crate::handler::{Entry, Handler, HandlerName, HandlerResponse};

/// Asserts the resolved local-name order of a phase.
///
/// # Example
///
/// ```ignore
/// assert_order!(phase, ["Timestamp", "Signer", "Dispatch"]);
/// ```
#[macro_export]
macro_rules! assert_order {
    ($phase:expr, [$($name:expr),* $(,)?]) => {{
        let actual = $phase.handler_names();
        let expected: Vec<&str> = vec![$($name),*];
        assert_eq!(
            actual, expected,
            "phase '{}' resolved to {:?}, expected {:?}",
            $phase.name(), actual, expected
        );
    }};
}

/// Shared, ordered record of handler activity.
///
/// Clones share the same underlying log, so several handlers can write to
/// one log and a test can read it afterwards.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.into());
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

fn record_entry(log: &InvocationLog, name: &HandlerName, entry: Entry) {
    match entry {
        Entry::Fresh => log.record(name.local_part()),
        Entry::Resumed => log.record(format!("{}(resumed)", name.local_part())),
    }
}

/// Records its local name on every invocation and always continues.
///
/// Resumed invocations are recorded as `Name(resumed)`, cleanup as
/// `Name(cleanup)`.
#[derive(Debug)]
pub struct RecordingHandler {
    name: HandlerName,
    log: InvocationLog,
}

impl RecordingHandler {
    pub fn new(name: impl Into<HandlerName>, log: InvocationLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, _ctx: &mut MessageContext, entry: Entry) -> Result<HandlerResponse> {
        record_entry(&self.log, &self.name, entry);
        Ok(HandlerResponse::Continue)
    }

    async fn cleanup(&self) -> Result<()> {
        self.log.record(format!("{}(cleanup)", self.name.local_part()));
        Ok(())
    }
}

/// Suspends the first `times` fresh invocations, then continues.
///
/// A resumed invocation always continues. The suspension budget is shared
/// across messages, which lets a test park one message and watch another
/// pass through the same phase.
#[derive(Debug)]
pub struct SuspendingHandler {
    name: HandlerName,
    log: InvocationLog,
    remaining: AtomicUsize,
    via_context: bool,
}

impl SuspendingHandler {
    pub fn new(name: impl Into<HandlerName>, log: InvocationLog, times: usize) -> Self {
        Self {
            name: name.into(),
            log,
            remaining: AtomicUsize::new(times),
            via_context: false,
        }
    }

    /// Suspend by setting the context's pause flag and returning
    /// `Continue`, instead of returning `Suspend`.
    pub fn via_context(mut self) -> Self {
        self.via_context = true;
        self
    }

    fn take_suspension(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Handler for SuspendingHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, ctx: &mut MessageContext, entry: Entry) -> Result<HandlerResponse> {
        record_entry(&self.log, &self.name, entry);

        if entry.is_resumed() || !self.take_suspension() {
            return Ok(HandlerResponse::Continue);
        }

        if self.via_context {
            ctx.pause();
            Ok(HandlerResponse::Continue)
        } else {
            Ok(HandlerResponse::Suspend)
        }
    }
}

type ErrorFactory = Box<dyn Fn() -> anyhow::Error + Send + Sync>;

/// Always faults.
pub struct FailingHandler {
    name: HandlerName,
    error: ErrorFactory,
    calls: AtomicUsize,
}

impl FailingHandler {
    /// Fault with a plain message.
    pub fn new(name: impl Into<HandlerName>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_error(name, move || anyhow::anyhow!(message.clone()))
    }

    /// Fault with an error built by `error`, so tests can downcast to a
    /// concrete type.
    pub fn with_error<F>(name: impl Into<HandlerName>, error: F) -> Self
    where
        F: Fn() -> anyhow::Error + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            error: Box::new(error),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of times this handler was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FailingHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, _ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

/// Panics on every invocation with a message containing "boom".
#[derive(Debug)]
pub struct PanickingHandler {
    name: HandlerName,
}

impl PanickingHandler {
    pub fn new(name: impl Into<HandlerName>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Handler for PanickingHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, _ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
        panic!("boom in {}", self.name);
    }
}

/// Writes a property on every invocation, so tests can see which flow ran.
#[derive(Debug)]
pub struct PropertyHandler {
    name: HandlerName,
    key: String,
    value: serde_json::Value,
}

impl PropertyHandler {
    pub fn new(
        name: impl Into<HandlerName>,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Handler for PropertyHandler {
    fn name(&self) -> &HandlerName {
        &self.name
    }

    async fn invoke(&self, ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
        ctx.set_property(self.key.clone(), self.value.clone());
        Ok(HandlerResponse::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Flow;

    #[test]
    fn test_log_clones_share_entries() {
        let log = InvocationLog::new();
        let other = log.clone();
        log.record("A");
        other.record("B");
        assert_eq!(log.entries(), vec!["A", "B"]);
        assert_eq!(other.len(), 2);
        log.clear();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_suspending_handler_budget() {
        let log = InvocationLog::new();
        let handler = SuspendingHandler::new("Wait", log.clone(), 1);
        let mut ctx = MessageContext::new(Flow::In);

        let first = handler.invoke(&mut ctx, Entry::Fresh).await.unwrap();
        let second = handler.invoke(&mut ctx, Entry::Fresh).await.unwrap();

        assert_eq!(first, HandlerResponse::Suspend);
        assert_eq!(second, HandlerResponse::Continue);
        assert_eq!(log.entries(), vec!["Wait", "Wait"]);
    }

    #[tokio::test]
    async fn test_failing_handler_counts_calls() {
        let handler = FailingHandler::new("Bad", "nope");
        let mut ctx = MessageContext::new(Flow::In);

        let err = handler.invoke(&mut ctx, Entry::Fresh).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(handler.calls(), 1);
    }
}
