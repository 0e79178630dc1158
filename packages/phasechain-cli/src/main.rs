//! `phasechain`: inspect and exercise pipeline descriptors.
//!
//! ```text
//! phasechain --config pipeline.json resolve
//! phasechain --config pipeline.json run --flow in -p wsa.action=urn:echo
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use phasechain::config::DEFAULT_LOG_FILTER;
use phasechain::{Flow, Settings};
use phasechain_cli::{builtin_registry, load_pipeline, parse_property, run_message, PipelineReport};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "phasechain")]
#[command(about = "Inspect and exercise phasechain pipeline descriptors")]
struct Cli {
    /// Pipeline descriptor (defaults to $PHASECHAIN_CONFIG)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved handler order of every flow
    Resolve {
        #[arg(long)]
        json: bool,
    },

    /// Push a synthetic message through a flow
    Run {
        #[arg(long, value_enum, default_value_t = FlowArg::In)]
        flow: FlowArg,

        /// Initial message property (key=value, value parsed as JSON when possible)
        #[arg(long = "property", short = 'p', value_parser = parse_property)]
        properties: Vec<(String, Value)>,

        /// Resume a paused message at most this many times
        #[arg(long, default_value_t = 8)]
        max_resumes: usize,

        #[arg(long)]
        json: bool,
    },

    /// List the handler kinds descriptors can use
    Kinds,
}

#[derive(Clone, Copy, ValueEnum)]
enum FlowArg {
    In,
    Out,
    InFault,
    OutFault,
}

impl From<FlowArg> for Flow {
    fn from(flow: FlowArg) -> Self {
        match flow {
            FlowArg::In => Flow::In,
            FlowArg::Out => Flow::Out,
            FlowArg::InFault => Flow::InFault,
            FlowArg::OutFault => Flow::OutFault,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;

    // Initialize logging (stderr, so reports on stdout stay parseable)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_new(&settings.log_filter)
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let registry = builtin_registry();

    match cli.command {
        Commands::Kinds => {
            for kind in registry.kinds() {
                println!("{}", kind);
            }
        }
        Commands::Resolve { json } => {
            let path = settings.descriptor_path(cli.config)?;
            let pipeline = load_pipeline(&path, &registry)?;
            let report = PipelineReport::from_pipeline(&pipeline);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{} {}", "Resolved".bright_green().bold(), path.display());
                print!("{}", report.render());
            }
        }
        Commands::Run {
            flow,
            properties,
            max_resumes,
            json,
        } => {
            let path = settings.descriptor_path(cli.config)?;
            let pipeline = Arc::new(load_pipeline(&path, &registry)?);
            let report = run_message(pipeline, flow.into(), properties, max_resumes).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
        }
    }

    Ok(())
}
