//! Engine: drives a message context through the phases of a flow.
//!
//! The engine holds no per-message state. It reads and advances the phase
//! index stored on the [`MessageContext`], so a paused message can be parked
//! anywhere and resumed later by any engine sharing the same pipeline.
//!
//! # Fault Handling
//!
//! ```text
//! receive(ctx) ── In flow ──► Transport ──► Security ──✗ fault
//!                                                      │
//!                       ctx["fault.reason"] = "..."    │
//!                       ctx.flow = InFault             ▼
//!                                     InFault flow from the top
//!                                                      │
//!      Err(EngineError::Faulted { source: original fault, handling })
//! ```
//!
//! The original fault is always what the caller gets back. The outcome of
//! the fault flow rides along in [`FaultHandling`]. Faults raised while a
//! fault flow runs never start another fault flow.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::context::{Flow, MessageContext};
use crate::error::{EngineError, FaultHandling};
use crate::phase::PhaseOutcome;
use crate::pipeline::Pipeline;

/// Context property holding the message of the fault that started a fault flow.
pub const FAULT_REASON_PROPERTY: &str = "fault.reason";

/// Result of driving a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Every phase of the flow completed.
    Completed,
    /// A handler suspended the message in the named phase.
    Paused { phase: String },
}

impl EngineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, EngineOutcome::Completed)
    }
}

/// Flow driver over a shared [`Pipeline`].
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(Arc::new(pipeline));
///
/// let mut ctx = MessageContext::new(Flow::In);
/// match engine.receive(&mut ctx).await? {
///     EngineOutcome::Completed => {}
///     EngineOutcome::Paused { .. } => {
///         // later, once whatever the handler waited on is ready
///         engine.resume(&mut ctx).await?;
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    pipeline: Arc<Pipeline>,
}

impl Engine {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Run the inbound flow from the top.
    pub async fn receive(&self, ctx: &mut MessageContext) -> Result<EngineOutcome, EngineError> {
        self.start(Flow::In, ctx).await
    }

    /// Run the outbound flow from the top.
    pub async fn send(&self, ctx: &mut MessageContext) -> Result<EngineOutcome, EngineError> {
        self.start(Flow::Out, ctx).await
    }

    /// Run any flow from the top.
    pub async fn run(&self, flow: Flow, ctx: &mut MessageContext) -> Result<EngineOutcome, EngineError> {
        self.start(flow, ctx).await
    }

    /// Continue a paused message in its current flow, at the phase and
    /// handler where it stopped.
    ///
    /// A resumed fault flow that faults is reported as a fault of the fault
    /// flow itself. Callers holding the fault that started it should keep
    /// that one and record this as [`FaultHandling::Failed`]; the message of
    /// the starting fault is also on the context under
    /// [`FAULT_REASON_PROPERTY`].
    ///
    /// # Errors
    ///
    /// [`EngineError::NotPaused`] if the context is not paused.
    pub async fn resume(&self, ctx: &mut MessageContext) -> Result<EngineOutcome, EngineError> {
        if !ctx.is_paused() {
            return Err(EngineError::NotPaused { id: ctx.id() });
        }
        info!(
            message_id = %ctx.id(),
            flow = %ctx.flow(),
            phase_index = ctx.current_phase_index(),
            "resuming message"
        );
        ctx.resume();
        self.drive(ctx).await
    }

    /// Call `cleanup` on every distinct handler in the pipeline.
    ///
    /// Every handler is attempted even if an earlier one fails.
    pub async fn shutdown(&self) -> Result<()> {
        let handlers = self.pipeline.handlers();
        let mut failed = 0usize;

        for handler in &handlers {
            if let Err(e) = handler.cleanup().await {
                error!(handler = %handler.name(), error = ?e, "handler cleanup failed");
                failed += 1;
            }
        }

        info!(handlers = handlers.len(), failed, "engine shut down");
        if failed > 0 {
            anyhow::bail!("{} of {} handler(s) failed to clean up", failed, handlers.len());
        }
        Ok(())
    }

    async fn start(&self, flow: Flow, ctx: &mut MessageContext) -> Result<EngineOutcome, EngineError> {
        ctx.set_flow(flow);
        ctx.rewind();
        debug!(message_id = %ctx.id(), %flow, "starting flow");
        self.drive(ctx).await
    }

    async fn drive(&self, ctx: &mut MessageContext) -> Result<EngineOutcome, EngineError> {
        let flow = ctx.flow();
        match self.run_phases(ctx).await {
            Ok(outcome) => Ok(outcome),
            Err((phase, source)) => {
                error!(
                    message_id = %ctx.id(),
                    %flow,
                    phase = %phase,
                    error = ?source,
                    "flow faulted"
                );
                let handling = self.handle_fault(flow, ctx, &source).await;
                Err(EngineError::Faulted {
                    flow,
                    phase,
                    handling,
                    source,
                })
            }
        }
    }

    /// Run phases from the context's phase index to the end of its flow.
    ///
    /// On fault, returns the faulting phase name with the error untouched.
    async fn run_phases(
        &self,
        ctx: &mut MessageContext,
    ) -> std::result::Result<EngineOutcome, (String, anyhow::Error)> {
        let phases = self.pipeline.phases(ctx.flow());

        while let Some(phase) = phases.get(ctx.current_phase_index()) {
            match phase.invoke(ctx).await {
                Ok(PhaseOutcome::Completed) => {
                    let next = ctx.current_phase_index() + 1;
                    ctx.set_current_phase_index(next);
                }
                Ok(PhaseOutcome::Paused) => {
                    warn!(message_id = %ctx.id(), flow = %ctx.flow(), phase = %phase, "message paused");
                    return Ok(EngineOutcome::Paused {
                        phase: phase.name().to_string(),
                    });
                }
                Err(e) => return Err((phase.name().to_string(), e)),
            }
        }

        ctx.set_current_phase_index(0);
        debug!(message_id = %ctx.id(), flow = %ctx.flow(), "flow completed");
        Ok(EngineOutcome::Completed)
    }

    async fn handle_fault(
        &self,
        flow: Flow,
        ctx: &mut MessageContext,
        source: &anyhow::Error,
    ) -> FaultHandling {
        let Some(fault_flow) = flow.fault_counterpart() else {
            return FaultHandling::NotConfigured;
        };
        if self.pipeline.is_empty(fault_flow) {
            return FaultHandling::NotConfigured;
        }

        info!(message_id = %ctx.id(), %flow, %fault_flow, "running fault flow");
        ctx.set_property(FAULT_REASON_PROPERTY, source.to_string());
        ctx.set_flow(fault_flow);
        ctx.rewind();

        match self.run_phases(ctx).await {
            Ok(EngineOutcome::Completed) => FaultHandling::Completed,
            Ok(EngineOutcome::Paused { phase }) => FaultHandling::Paused { phase },
            Err((phase, e)) => {
                error!(
                    message_id = %ctx.id(),
                    flow = %fault_flow,
                    phase = %phase,
                    error = ?e,
                    "fault flow faulted"
                );
                FaultHandling::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::HandlerDescription;
    use crate::error::PhaseFault;
    use crate::handler::{Entry, Handler, HandlerName, HandlerResponse};
    use crate::phase::{Phase, PhaseConditions};
    use crate::pipeline::PipelineBuilder;
    use crate::testing::{
        FailingHandler, InvocationLog, PropertyHandler, RecordingHandler, SuspendingHandler,
    };
    use async_trait::async_trait;

    fn recording(name: &str, phase: &str, log: &InvocationLog) -> HandlerDescription {
        HandlerDescription::new(Arc::new(RecordingHandler::new(name, log.clone()))).in_phase(phase)
    }

    fn described(handler: impl Handler, phase: &str) -> HandlerDescription {
        HandlerDescription::new(Arc::new(handler)).in_phase(phase)
    }

    fn builder() -> PipelineBuilder {
        let mut builder = PipelineBuilder::new();
        builder
            .declare_flow(Flow::In, ["Transport", "Security", "Dispatch"])
            .unwrap()
            .declare_flow(Flow::Out, ["MessageOut"])
            .unwrap();
        builder
    }

    #[tokio::test]
    async fn test_receive_runs_phases_in_order() {
        let log = InvocationLog::new();
        let mut builder = builder();
        builder
            .add_handler(&recording("Router", "Dispatch", &log))
            .unwrap()
            .add_handler(&recording("Listener", "Transport", &log))
            .unwrap()
            .add_handler(&recording("Verifier", "Security", &log))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        let outcome = engine.receive(&mut ctx).await.unwrap();

        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(log.entries(), vec!["Listener", "Verifier", "Router"]);
        assert_eq!(ctx.current_phase_index(), 0);
    }

    #[tokio::test]
    async fn test_send_runs_out_flow() {
        let log = InvocationLog::new();
        let mut builder = builder();
        builder
            .add_handler(&recording("Sender", "MessageOut", &log))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        engine.send(&mut ctx).await.unwrap();
        assert_eq!(ctx.flow(), Flow::Out);
        assert_eq!(log.entries(), vec!["Sender"]);
    }

    #[tokio::test]
    async fn test_pause_and_resume_across_phases() {
        let log = InvocationLog::new();
        let mut builder = builder();
        builder
            .add_handler(&recording("Listener", "Transport", &log))
            .unwrap()
            .add_handler(&described(
                SuspendingHandler::new("TokenFetch", log.clone(), 1),
                "Security",
            ))
            .unwrap()
            .add_handler(&recording("Verifier", "Security", &log))
            .unwrap()
            .add_handler(&recording("Router", "Dispatch", &log))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        let outcome = engine.receive(&mut ctx).await.unwrap();
        assert_eq!(
            outcome,
            EngineOutcome::Paused {
                phase: "Security".into()
            }
        );
        assert!(ctx.is_paused());
        assert_eq!(ctx.current_phase_index(), 1);
        assert_eq!(ctx.current_handler_index(), 0);

        let outcome = engine.resume(&mut ctx).await.unwrap();
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(
            log.entries(),
            vec!["Listener", "TokenFetch", "TokenFetch(resumed)", "Verifier", "Router"]
        );
    }

    #[tokio::test]
    async fn test_resume_requires_paused_context() {
        let engine = Engine::new(Arc::new(builder().build()));
        let mut ctx = MessageContext::new(Flow::In);
        let err = engine.resume(&mut ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::NotPaused { id } if id == ctx.id()));
    }

    #[tokio::test]
    async fn test_fault_runs_fault_flow_and_returns_original() {
        let log = InvocationLog::new();
        let mut builder = builder();
        builder.declare_flow(Flow::InFault, ["FaultHandling"]).unwrap();
        builder
            .add_handler(&recording("Listener", "Transport", &log))
            .unwrap()
            .add_handler(&described(FailingHandler::new("Verifier", "bad signature"), "Security"))
            .unwrap()
            .add_handler(&recording("Router", "Dispatch", &log))
            .unwrap()
            .add_handler(&described(
                PropertyHandler::new("FaultBuilder", "fault.built", true),
                "FaultHandling",
            ))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        let err = engine.receive(&mut ctx).await.unwrap_err();

        match &err {
            EngineError::Faulted {
                flow,
                phase,
                handling,
                source,
            } => {
                assert_eq!(*flow, Flow::In);
                assert_eq!(phase, "Security");
                assert!(handling.is_completed());
                assert_eq!(source.to_string(), "bad signature");
            }
            other => panic!("Expected Faulted, got {:?}", other),
        }
        assert_eq!(log.entries(), vec!["Listener"]);
        assert_eq!(ctx.flow(), Flow::InFault);
        assert_eq!(ctx.property(FAULT_REASON_PROPERTY).unwrap(), "bad signature");
        assert_eq!(ctx.property_as::<bool>("fault.built"), Some(true));
    }

    #[tokio::test]
    async fn test_fault_without_fault_flow() {
        let mut builder = builder();
        builder
            .add_handler(&described(FailingHandler::new("Router", "no operation"), "Dispatch"))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        let err = engine.receive(&mut ctx).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Faulted {
                handling: FaultHandling::NotConfigured,
                ..
            }
        ));
        assert_eq!(ctx.flow(), Flow::In);
        assert!(ctx.property(FAULT_REASON_PROPERTY).is_none());
    }

    #[tokio::test]
    async fn test_fault_in_fault_flow_is_reported_not_chained() {
        let mut builder = builder();
        builder.declare_flow(Flow::InFault, ["FaultHandling"]).unwrap();
        builder
            .add_handler(&described(FailingHandler::new("Router", "first"), "Dispatch"))
            .unwrap()
            .add_handler(&described(FailingHandler::new("FaultBuilder", "second"), "FaultHandling"))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        let err = engine.receive(&mut ctx).await.unwrap_err();

        match err {
            EngineError::Faulted {
                handling: FaultHandling::Failed(inner),
                source,
                ..
            } => {
                assert_eq!(source.to_string(), "first");
                assert_eq!(inner.to_string(), "second");
            }
            other => panic!("Expected Failed fault handling, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_paused_fault_flow_resumes_in_fault_flow() {
        let log = InvocationLog::new();
        let mut builder = builder();
        builder.declare_flow(Flow::InFault, ["FaultHandling"]).unwrap();
        builder
            .add_handler(&described(FailingHandler::new("Router", "boom"), "Dispatch"))
            .unwrap()
            .add_handler(&described(
                SuspendingHandler::new("Notifier", log.clone(), 1),
                "FaultHandling",
            ))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        let err = engine.receive(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Faulted {
                handling: FaultHandling::Paused { .. },
                ..
            }
        ));
        assert!(ctx.is_paused());

        let outcome = engine.resume(&mut ctx).await.unwrap();
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(log.entries(), vec!["Notifier", "Notifier(resumed)"]);
    }

    #[tokio::test]
    async fn test_phase_condition_fault_surfaces_as_phase_fault() {
        struct NeedsAction;

        impl PhaseConditions for NeedsAction {
            fn check_preconditions(&self, ctx: &MessageContext) -> Result<()> {
                match ctx.property("wsa.action") {
                    Some(_) => Ok(()),
                    None => anyhow::bail!("wsa:Action missing"),
                }
            }
        }

        let mut builder = PipelineBuilder::new();
        builder
            .add_phase(Flow::In, Phase::with_conditions("Dispatch", Arc::new(NeedsAction)))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let mut ctx = MessageContext::new(Flow::In);
        let err = engine.receive(&mut ctx).await.unwrap_err();
        let fault = err.fault().unwrap().downcast_ref::<PhaseFault>().unwrap();
        assert!(matches!(fault, PhaseFault::Precondition { .. }));

        ctx.set_property("wsa.action", "urn:echo");
        assert!(engine.receive(&mut ctx).await.unwrap().is_completed());
    }

    struct CountingCleanup {
        name: HandlerName,
        log: InvocationLog,
        fail: bool,
    }

    #[async_trait]
    impl Handler for CountingCleanup {
        fn name(&self) -> &HandlerName {
            &self.name
        }

        async fn invoke(&self, _ctx: &mut MessageContext, _entry: Entry) -> Result<HandlerResponse> {
            Ok(HandlerResponse::Continue)
        }

        async fn cleanup(&self) -> Result<()> {
            self.log.record(self.name.local_part());
            if self.fail {
                anyhow::bail!("cleanup failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_cleans_each_handler_once() {
        let log = InvocationLog::new();
        let mut builder = PipelineBuilder::new();
        builder
            .declare_flow(Flow::In, ["Security"])
            .unwrap()
            .declare_flow(Flow::Out, ["Security"])
            .unwrap();
        builder
            .add_handler(&described(
                CountingCleanup {
                    name: "Signer".into(),
                    log: log.clone(),
                    fail: true,
                },
                "Security",
            ))
            .unwrap()
            .add_handler(&described(
                CountingCleanup {
                    name: "Timestamp".into(),
                    log: log.clone(),
                    fail: false,
                },
                "Security",
            ))
            .unwrap();
        let engine = Engine::new(Arc::new(builder.build()));

        let err = engine.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
        assert_eq!(log.entries(), vec!["Signer", "Timestamp"]);
    }
}
