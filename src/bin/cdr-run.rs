//! Runs the functions of a binary program and prints their results.

use cdr::{
    AsyncValue,
    config::RunConfig,
    driver::{self, DriverError},
};
use clap::Parser;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cdr-run")]
#[command(about = "Run the functions of a binary dataflow program")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    run: RunConfig,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let live_before = AsyncValue::live_instances();
    let mut stdout = std::io::stdout().lock();
    match driver::run(&cli.run, &mut stdout) {
        Ok(outcome) => {
            let live_after = AsyncValue::live_instances();
            if live_after != live_before {
                eprintln!("{live_after} async values alive at exit, {live_before} before the run");
                std::process::abort();
            }
            for diagnostic in &outcome.unexpected {
                eprintln!("unexpected diagnostic: {diagnostic}");
            }
            for expected in &outcome.unmatched {
                eprintln!("expected diagnostic was not produced: {expected}");
            }
            if outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err @ DriverError::Leak { .. }) => {
            eprintln!("{err}");
            std::process::abort();
        }
        Err(err) => {
            eprintln!("cdr-run: {err}");
            ExitCode::FAILURE
        }
    }
}
