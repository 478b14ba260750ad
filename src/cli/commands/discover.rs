//! Discovery command.

use console::style;

use crate::cli::helpers::{cancel_on_ctrl_c, open_pipeline, print_run_report};
use crate::config::Settings;
use crate::models::{ChangeDecision, RunMode};
use crate::pipeline::RunOptions;

/// Crawl the seeds and list what would be imported.
pub async fn cmd_discover(settings: &Settings, save: bool) -> anyhow::Result<()> {
    if settings.seeds.is_empty() {
        println!("{} No seeds configured", style("!").yellow());
        println!(
            "  {} Add [[discovery.seeds]] entries to parlsync.toml",
            style("→").dim()
        );
        return Ok(());
    }

    println!(
        "{} Discovering from {} seeds{}",
        style("→").cyan(),
        settings.seeds.len(),
        if save { "" } else { " (dry run)" }
    );

    let pipeline = open_pipeline(settings)?;
    let options = RunOptions::new(RunMode::DiscoveryOnly).save(save);
    let report = pipeline.run(options, cancel_on_ctrl_c(), None).await?;

    for change in &report.changes {
        let marker = match change.decision {
            ChangeDecision::New => style("+").green(),
            ChangeDecision::Changed => style("~").cyan(),
            ChangeDecision::Gone => style("-").red(),
            ChangeDecision::Unchanged => continue,
        };
        match change.method {
            Some(method) => println!("  {} {} ({})", marker, change.url, method.as_str()),
            None => println!("  {} {}", marker, change.url),
        }
    }

    print_run_report(&report);
    Ok(())
}
