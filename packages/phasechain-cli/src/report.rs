//! Human and JSON renderings of resolved pipelines and message runs.

use std::fmt::Write as _;

use colored::Colorize;
use phasechain::{Flow, Pipeline};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub name: String,
    pub handlers: Vec<String>,
    pub phase_first: bool,
    pub phase_last: bool,
    pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowReport {
    pub flow: Flow,
    pub phases: Vec<PhaseReport>,
}

/// Resolved handler order of every flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub flows: Vec<FlowReport>,
}

impl PipelineReport {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        let flows = Flow::ALL
            .into_iter()
            .map(|flow| FlowReport {
                flow,
                phases: pipeline
                    .phases(flow)
                    .iter()
                    .map(|phase| PhaseReport {
                        name: phase.name().to_string(),
                        handlers: phase
                            .handlers()
                            .iter()
                            .map(|h| h.name().to_string())
                            .collect(),
                        phase_first: phase.has_phase_first(),
                        phase_last: phase.has_phase_last(),
                        sealed: phase.is_sealed(),
                    })
                    .collect(),
            })
            .collect();
        Self { flows }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for flow in &self.flows {
            let _ = writeln!(out, "{}", format!("{} flow", flow.flow).bright_cyan().bold());
            if flow.phases.is_empty() {
                let _ = writeln!(out, "  {}", "(no phases)".dimmed());
                continue;
            }
            for (i, phase) in flow.phases.iter().enumerate() {
                let _ = writeln!(out, "  {}. {}", i + 1, phase.name.bold());
                for (j, handler) in phase.handlers.iter().enumerate() {
                    let pin = pin_label(phase, j);
                    let _ = writeln!(out, "       {} {}", handler, pin.yellow());
                }
            }
        }
        out
    }
}

fn pin_label(phase: &PhaseReport, index: usize) -> &'static str {
    let last_index = phase.handlers.len().saturating_sub(1);
    if phase.sealed {
        "[sole]"
    } else if phase.phase_first && index == 0 {
        "[phaseFirst]"
    } else if phase.phase_last && index == last_index {
        "[phaseLast]"
    } else {
        ""
    }
}

/// Outcome of pushing one synthetic message through a flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Still paused after the resume budget ran out.
    Paused { phase: String },
    Faulted {
        flow: Flow,
        phase: String,
        error: String,
        fault_flow: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub message_id: String,
    pub flow: Flow,
    #[serde(flatten)]
    pub status: RunStatus,
    pub resumes: usize,
    pub trace: Vec<String>,
    pub properties: Map<String, Value>,
}

impl RunReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "message {} through {} flow", self.message_id, self.flow);
        for (i, entry) in self.trace.iter().enumerate() {
            let _ = writeln!(out, "  {:>3}  {}", i + 1, entry);
        }
        let status = match &self.status {
            RunStatus::Completed => "completed".green().bold().to_string(),
            RunStatus::Paused { phase } => format!("paused in {}", phase).yellow().bold().to_string(),
            RunStatus::Faulted {
                flow,
                phase,
                error,
                fault_flow,
            } => format!("faulted in {}/{}: {} ({})", flow, phase, error, fault_flow)
                .red()
                .bold()
                .to_string(),
        };
        let _ = writeln!(out, "{} after {} resume(s)", status, self.resumes);
        out
    }
}
