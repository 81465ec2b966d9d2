//! `rdloop-report` command implementation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::events::load_sessions;
use crate::render::{render_summary, render_table};
use crate::summary::aggregate;

/// Print the per-loop table and summary for `sessions`, or the summary as
/// JSON.
pub fn report_sessions(sessions: &[PathBuf], json: bool) -> Result<()> {
    let (rows, warnings) = load_sessions(sessions);
    for warning in &warnings {
        eprintln!("warning: {warning}");
    }
    let summary = aggregate(&rows, sessions.len());
    info!(loops = summary.loops, passes = summary.passes, "report built");
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        );
    } else {
        print!("{}", render_table(&rows));
        println!();
        print!("{}", render_summary(&summary));
    }
    Ok(())
}
