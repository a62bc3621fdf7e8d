use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use xfs_core::{Outcome, Run, RunConfig, RunError, RunReport};

mod cli;
mod ui;

use cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.loud);

    match run(&cli) {
        Ok(report) => {
            if cli.json {
                match serde_json::to_string(&report) {
                    Ok(line) => println!("{line}"),
                    Err(e) => {
                        eprintln!("xfs: failed to encode report: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_summary(&report);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("xfs: {e:#}");
            match e.downcast_ref::<RunError>() {
                Some(RunError::NoRootfsFound | RunError::LowConfidenceRootfs { .. }) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<RunReport> {
    let config = match &cli.config {
        Some(path) => RunConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => RunConfig::default(),
    };
    let config = cli.apply(config);

    let mut run = Run::new(&cli.firmware, cli.output(), config);
    if cli.progress {
        run = run.with_sink(Arc::new(ui::SpinnerSink::new()));
    }
    Ok(run.execute()?)
}

fn print_summary(report: &RunReport) {
    if report.outcome == Outcome::LowConfidenceAccepted {
        eprintln!(
            "xfs: warning: accepted low-confidence rootfs (score {:.2})",
            report.winner.score
        );
    }
    if !report.extraction_complete {
        eprintln!("xfs: warning: extraction bounds were hit, results may be partial");
    }
    if !report.device_nodes.is_empty() {
        eprintln!("xfs: {} device node(s) were not materialized", report.device_nodes.len());
    }

    let identical = report.winner.duplicates.len();
    if identical > 0 {
        println!(
            "xfs: Best extractor: {} ({} identical result(s) collapsed), archive at {}",
            report.best_extractor(),
            identical,
            report.outputs.archive.display()
        );
    } else {
        println!(
            "xfs: Best extractor: {}, archive at {}",
            report.best_extractor(),
            report.outputs.archive.display()
        );
    }
    if let Some(rootfs) = &report.outputs.rootfs {
        println!("xfs: rootfs copied to {}", rootfs.display());
    }
    if let Some(scratch) = &report.outputs.scratch {
        println!("xfs: scratch kept at {}", scratch.display());
    }
}

fn init_logging(loud: bool) {
    let filter = EnvFilter::try_from_env("XFS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if loud { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
