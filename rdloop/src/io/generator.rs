//! Text generation backend.
//!
//! The [`Generator`] trait decouples the stages from the model backend.
//! [`CommandGenerator`] pipes the prompt into a configured command (by
//! default `codex exec -`) and returns its stdout.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::GeneratorConfig;
use crate::io::process::run_command_with_timeout;

/// Produces free-form text for a system/user prompt pair.
pub trait Generator: Send + Sync {
    fn generate(&self, system: &str, user: &str) -> Result<String>;
}

/// Generator that spawns an external command per request.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        Ok(Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(program = %self.command[0], timeout_secs = self.timeout.as_secs()))]
    fn generate(&self, system: &str, user: &str) -> Result<String> {
        info!(prompt_bytes = system.len() + user.len(), "requesting generation");
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        let prompt = render_prompt(system, user);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run generator")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "generator timed out");
            return Err(anyhow!("generator timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator failed with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(anyhow!("generator returned no output"));
        }
        debug!(response_bytes = text.len(), "generation complete");
        Ok(text)
    }
}

fn render_prompt(system: &str, user: &str) -> String {
    format!("{}\n\n{}\n", system.trim(), user.trim())
}
