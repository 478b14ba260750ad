//! Status command.

use console::style;

use crate::cli::helpers::open_pipeline;
use crate::config::Settings;
use crate::models::{DiscoveryStatus, ImportState};

/// Show resource, queue and failure counts.
pub async fn cmd_status(settings: &Settings, limit: usize) -> anyhow::Result<()> {
    if !settings.database_exists() {
        println!(
            "{} No database at {}",
            style("!").yellow(),
            settings.database_path().display()
        );
        println!("  {} Run 'parlsync import' first", style("→").dim());
        return Ok(());
    }

    let report = open_pipeline(settings)?.status()?;

    println!("{}", style("Resources").bold());
    println!("  {:<14} {}", "total", report.total_resources());
    for status in [
        DiscoveryStatus::Active,
        DiscoveryStatus::Inactive,
        DiscoveryStatus::Error,
    ] {
        println!("  {:<14} {}", status.as_str(), report.resources(status));
    }
    println!("  {:<14} {}", "changed", report.changed);
    println!("  {:<14} {}", "unclassified", report.unclassified);

    println!();
    println!("{}", style("Imports").bold());
    for state in ImportState::ALL {
        println!(
            "  {:<14} {:>6} current {:>6} total",
            state.as_str(),
            report.imports.current(state),
            report.imports.all(state)
        );
    }
    println!("  {:<14} {}", "queued", report.queued());

    let permanent: Vec<_> = report.permanent_failures().collect();
    let retrying: Vec<_> = report.waiting_for_retry().collect();
    if !permanent.is_empty() || !retrying.is_empty() {
        println!();
        println!(
            "{} ({} permanent, {} waiting for retry)",
            style("Failures").bold(),
            permanent.len(),
            retrying.len()
        );
        for failure in permanent.iter().chain(retrying.iter()).take(limit) {
            let when = match failure.next_retry_at {
                Some(at) if !failure.permanent => {
                    format!("retry at {}", at.format("%Y-%m-%d %H:%M"))
                }
                _ => "permanent".to_string(),
            };
            println!(
                "  {} [{}] {} (attempt {}, {})",
                if failure.permanent {
                    style("✗").red()
                } else {
                    style("!").yellow()
                },
                failure.section_name,
                failure.resource_url,
                failure.retry_count,
                when
            );
            if let Some(ref error) = failure.last_error {
                println!("      {}", style(error).dim());
            }
        }
    }

    if let Some(run) = report.latest_run {
        println!();
        println!("{}", style("Latest run").bold());
        println!(
            "  #{} {} started {}",
            run.id,
            run.mode.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        match (run.finished_at, run.error) {
            (None, _) => println!(
                "  {} interrupted in phase {}",
                style("!").yellow(),
                run.phase.as_str()
            ),
            (Some(_), Some(error)) => println!("  {} {}", style("✗").red(), error),
            (Some(at), None) => println!(
                "  {} finished {} ({} imported, {} failed)",
                style("✓").green(),
                at.format("%Y-%m-%d %H:%M:%S"),
                run.counters.succeeded,
                run.counters.failed
            ),
        }
    }

    Ok(())
}
