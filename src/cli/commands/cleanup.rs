//! Cleanup command.

use console::style;

use crate::cli::helpers::open_pipeline;
use crate::config::Settings;

/// Reclaim stale leases, close abandoned runs and optionally prune payloads.
pub async fn cmd_cleanup(settings: &Settings, full: bool) -> anyhow::Result<()> {
    let report = open_pipeline(settings)?.cleanup(full).await?;

    println!(
        "{} Reclaimed {} expired leases",
        style("✓").green(),
        report.reclaimed_leases
    );
    println!(
        "  {} {} abandoned runs closed",
        style("→").dim(),
        report.closed_runs
    );
    if full {
        println!(
            "  {} {} orphaned payload files removed",
            style("→").dim(),
            report.removed_files
        );
        if report.vacuumed {
            println!("  {} Database compacted", style("→").dim());
        }
    }
    Ok(())
}
