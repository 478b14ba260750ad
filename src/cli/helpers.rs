//! Shared helper functions for CLI commands.

use std::sync::Arc;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::CancelSignal;
use crate::config::Settings;
use crate::import::ImportEvent;
use crate::pipeline::{Pipeline, RunReport};

/// Open the store and assemble a pipeline backed by the HTTP client.
pub fn open_pipeline(settings: &Settings) -> anyhow::Result<Pipeline> {
    settings.ensure_directories()?;
    let db = settings.create_db_context()?;
    let client = settings.http_client()?;
    Ok(Pipeline::new(settings, db, Arc::new(client))?)
}

/// A cancel signal that fires on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancelSignal {
    let (tx, signal) = CancelSignal::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{} Interrupted; in-flight imports are retried once their lease expires",
                style("!").yellow()
            );
            let _ = tx.send(true);
        }
    });
    signal
}

/// Spawn the task rendering import events on a spinner.
pub fn spawn_import_progress() -> (mpsc::Sender<ImportEvent>, JoinHandle<()>) {
    let (event_tx, mut event_rx) = mpsc::channel::<ImportEvent>(100);

    let handle = tokio::spawn(async move {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(120));

        let mut imported = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        while let Some(event) = event_rx.recv().await {
            match event {
                ImportEvent::Started { url, .. } => {
                    pb.set_message(format!(
                        "{} imported, {} skipped, {} failed | {}",
                        imported, skipped, failed, url
                    ));
                }
                ImportEvent::Succeeded { .. } => imported += 1,
                ImportEvent::Skipped { .. } => skipped += 1,
                ImportEvent::Failed {
                    url,
                    error,
                    permanent,
                    ..
                } => {
                    failed += 1;
                    let marker = if permanent {
                        style("✗").red()
                    } else {
                        style("!").yellow()
                    };
                    pb.println(format!("{} {}: {}", marker, url, error));
                }
            }
        }
        pb.finish_and_clear();
    });

    (event_tx, handle)
}

/// Print the outcome of a run.
pub fn print_run_report(report: &RunReport) {
    let c = &report.counters;

    if report.mode.discovers() {
        println!(
            "{} Discovered {} resources",
            style("✓").green(),
            c.discovered
        );
        println!(
            "  {} {} new, {} changed, {} unchanged, {} gone",
            style("→").dim(),
            c.new,
            c.changed,
            c.unchanged,
            c.gone
        );
        if c.unclassified > 0 {
            println!(
                "  {} {} unclassified",
                style("!").yellow(),
                c.unclassified
            );
        }
        if c.probe_errors > 0 {
            println!(
                "  {} {} could not be checked",
                style("!").yellow(),
                c.probe_errors
            );
        }
        for (seed, error) in &report.failed_seeds {
            println!(
                "  {} Seed {} failed: {}",
                style("✗").red(),
                seed,
                error
            );
        }
        if report.is_dry_run() {
            println!(
                "  {} {} would be queued for import (dry run, nothing saved)",
                style("→").dim(),
                c.enqueued
            );
        } else {
            println!("  {} {} queued for import", style("→").dim(), c.enqueued);
        }
    }

    if c.reclaimed + c.requeued > 0 {
        println!(
            "  {} {} expired leases reclaimed, {} retries requeued",
            style("→").dim(),
            c.reclaimed,
            c.requeued
        );
    }

    if report.mode.imports() {
        println!("{} Imported {} resources", style("✓").green(), c.succeeded);
        if c.skipped > 0 {
            println!(
                "  {} {} skipped (content already imported)",
                style("→").dim(),
                c.skipped
            );
        }
        if c.failed > 0 {
            println!(
                "  {} {} failed (see 'parlsync status')",
                style("!").yellow(),
                c.failed
            );
        }
    }

    for (host, stats) in &report.circuits {
        println!(
            "  {} {} unreachable, circuit tripped {} times ({})",
            style("!").yellow(),
            host,
            stats.trips,
            stats.state.as_str()
        );
    }

    if report.cancelled {
        println!(
            "{} Run cancelled; the next run resumes from the store",
            style("!").yellow()
        );
    }
}
