//! Operator tooling for phasechain pipeline descriptors.
//!
//! The `phasechain` binary is a thin shell over this crate:
//!
//! - [`handlers`]: built-in handler kinds, so a descriptor can be resolved
//!   and run without application code
//! - [`runner`]: descriptor loading and synthetic message runs
//! - [`report`]: text and JSON output

pub mod handlers;
pub mod report;
pub mod runner;

pub use handlers::builtin_registry;
pub use report::{PipelineReport, RunReport, RunStatus};
pub use runner::{load_pipeline, parse_property, run_message};
