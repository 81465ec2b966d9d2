//! Offline summary of rdloop sessions, built from their event logs.

mod cli;
mod events;
mod render;
mod summary;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "rdloop-report",
    version,
    about = "Summarize rdloop session event logs"
)]
struct Cli {
    /// Session directories (each holding `events.jsonl`).
    #[arg(required = true)]
    sessions: Vec<PathBuf>,
    /// Print the summary as JSON instead of the table.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    rdloop::logging::init(false);
    cli::report_sessions(&cli.sessions, cli.json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sessions_and_json() {
        let cli = Cli::parse_from(["rdloop-report", "log", "old/log", "--json"]);
        assert_eq!(cli.sessions, vec![PathBuf::from("log"), PathBuf::from("old/log")]);
        assert!(cli.json);
    }

    #[test]
    fn sessions_are_required() {
        assert!(Cli::try_parse_from(["rdloop-report"]).is_err());
    }
}
