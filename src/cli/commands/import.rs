//! Import command.

use console::style;

use crate::cli::helpers::{
    cancel_on_ctrl_c, open_pipeline, print_run_report, spawn_import_progress,
};
use crate::config::Settings;
use crate::models::RunMode;
use crate::pipeline::RunOptions;

/// Run the pipeline and import changed resources.
pub async fn cmd_import(
    settings: &Settings,
    force: bool,
    queued_only: bool,
) -> anyhow::Result<()> {
    let pipeline = open_pipeline(settings)?;

    let mode = if queued_only {
        let pending = pipeline.queue().repository().pending_count()?;
        if pending == 0 {
            println!("{} No queued resources to import", style("!").yellow());
            println!(
                "  {} Run 'parlsync import' to discover new resources",
                style("→").dim()
            );
            return Ok(());
        }
        println!(
            "{} Starting {} import workers ({} queued)",
            style("→").cyan(),
            settings.import.workers,
            pending
        );
        RunMode::ImportOnly
    } else {
        println!(
            "{} Syncing {} seeds with {} import workers{}",
            style("→").cyan(),
            settings.seeds.len(),
            settings.import.workers,
            if force { " (forced)" } else { "" }
        );
        RunMode::Full
    };

    let (event_tx, event_handler) = spawn_import_progress();
    let result = pipeline
        .run(
            RunOptions::new(mode).force(force),
            cancel_on_ctrl_c(),
            Some(event_tx),
        )
        .await;

    // The pipeline owned the last sender, so the handler drains and exits
    if let Err(e) = event_handler.await {
        tracing::warn!("Event handler task failed: {}", e);
    }

    print_run_report(&result?);
    Ok(())
}
