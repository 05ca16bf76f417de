//! Command-line entry point: parse a pipeline script and run it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bitflow::{run_pipelines, EndpointFactory, PipelineConfig, Registry, ScriptBuilder};

/// Runs a bitflow pipeline script.
#[derive(Parser)]
#[command(name = "bitflow-pipeline", version, about)]
struct Args {
    /// The pipeline script. Mutually exclusive with --file.
    script: Option<String>,

    /// Read the script from a file instead of the command line.
    #[arg(short = 'f', long = "file", value_name = "PATH", conflicts_with = "script")]
    file: Option<PathBuf>,

    /// Print the available pipeline steps and exit.
    #[arg(long)]
    print_analyses: bool,

    /// Parse the script, print the resulting pipeline and exit.
    #[arg(long)]
    print_pipeline: bool,

    /// Print the registered steps as JSON and exit.
    #[arg(long)]
    capabilities: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let registry = Arc::new(Registry::with_builtins());

    if args.print_analyses {
        println!("Available pipeline steps:\n{}", registry.print_analyses());
        return ExitCode::SUCCESS;
    }
    if args.capabilities {
        println!("{}", registry.capabilities_json());
        return ExitCode::SUCCESS;
    }

    let script = match read_script(&args) {
        Ok(script) => script,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let config = PipelineConfig::default();
    let endpoints = Arc::new(EndpointFactory::new(config.clone()));
    let builder = ScriptBuilder::new(registry, endpoints);
    let pipelines = match builder.build_script(&script) {
        Ok(pipelines) => pipelines,
        Err(err) => {
            tracing::error!(error = %err, "cannot build pipeline");
            eprintln!("Use --print-analyses to list the available pipeline steps.");
            return ExitCode::FAILURE;
        }
    };

    for pipeline in &pipelines {
        for line in pipeline.format_lines() {
            tracing::info!("{line}");
        }
    }
    if args.print_pipeline {
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "cannot start runtime");
            return ExitCode::FAILURE;
        }
    };
    let errors = runtime.block_on(run_pipelines(pipelines, &config, true));
    ExitCode::from(errors.min(u8::MAX as usize) as u8)
}

fn read_script(args: &Args) -> Result<String, String> {
    match (&args.file, &args.script) {
        (Some(path), None) => std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|err| format!("cannot read script file {}: {err}", path.display())),
        (None, Some(script)) if !script.trim().is_empty() => Ok(script.trim().to_string()),
        _ => Err("Provide a pipeline script either directly or via --file.".to_string()),
    }
}
