//! Prompt rendering for the propose and implement stages.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::text::{head_chars, tail_chars};
use crate::core::trace::{HistoryTrace, TraceEntry};
use crate::core::types::ChallengeVariant;
use crate::io::challenge::Challenge;

const PROPOSE_TEMPLATE: &str = include_str!("prompts/propose.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");

pub const PROPOSE_SYSTEM: &str = "You are an FHE expert specializing in the OpenFHE C++ library.";

const PLAN_PREVIEW_CHARS: usize = 300;
const HISTORY_FEEDBACK_CHARS: usize = 600;
const CHALLENGE_SUMMARY_CHARS: usize = 1200;
const FEEDBACK_ERROR_CHARS: usize = 800;
const FEEDBACK_OUTPUT_CHARS: usize = 500;

/// System prompt for the implement stage.
pub fn code_system(method: &str) -> String {
    format!("You are an OpenFHE C++ expert. Generate only the {method}() function body.")
}

#[derive(Debug, Clone, Serialize)]
struct TemplateRow {
    name: String,
    chars: usize,
}

#[derive(Debug, Clone, Serialize)]
struct IdentifierRow {
    name: String,
    role: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryRow {
    number: usize,
    plan_preview: String,
    result: &'static str,
    feedback: String,
}

/// Inputs for the implement-stage prompt that are not part of the challenge.
#[derive(Debug, Clone)]
pub struct CodePromptInputs<'a> {
    pub plan: &'a str,
    pub solution_file: &'a str,
    pub method: &'a str,
    pub fence: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("propose", PROPOSE_TEMPLATE)
            .expect("propose template should be valid");
        env.add_template("code", CODE_TEMPLATE)
            .expect("code template should be valid");
        Self { env }
    }

    /// User prompt asking for an algorithm plan, informed by the last
    /// `window` trace entries.
    pub fn render_propose(
        &self,
        challenge: &Challenge,
        trace: &HistoryTrace,
        window: usize,
    ) -> Result<String> {
        let recent = trace.recent_window(window);
        let first_number = trace.len() - recent.len() + 1;
        let history: Vec<HistoryRow> = recent
            .iter()
            .enumerate()
            .map(|(offset, entry)| history_row(first_number + offset, entry))
            .collect();

        let template = self.env.get_template("propose")?;
        let rendered = template.render(context! {
            challenge_name => challenge.name.as_str(),
            description => challenge.description.trim(),
            templates => template_rows(challenge),
            identifiers => identifier_rows(challenge),
            history => history,
        })?;
        Ok(rendered)
    }

    /// User prompt asking for the method body that implements `plan`.
    pub fn render_code(
        &self,
        challenge: &Challenge,
        trace: &HistoryTrace,
        input: &CodePromptInputs<'_>,
    ) -> Result<String> {
        let template = self.env.get_template("code")?;
        let rendered = template.render(context! {
            plan => input.plan.trim(),
            summary => head_chars(&challenge.description, CHALLENGE_SUMMARY_CHARS).trim(),
            identifiers => identifier_rows(challenge),
            feedback => last_feedback(trace),
            variant => challenge.variant.as_str(),
            externally_validated => challenge.variant == ChallengeVariant::ExternallyValidated,
            solution_file => input.solution_file,
            method => input.method,
            fence => input.fence,
        })?;
        Ok(rendered)
    }
}

fn template_rows(challenge: &Challenge) -> Vec<TemplateRow> {
    challenge
        .templates
        .iter()
        .map(|(name, contents)| TemplateRow {
            name: name.clone(),
            chars: contents.chars().count(),
        })
        .collect()
}

fn identifier_rows(challenge: &Challenge) -> Vec<IdentifierRow> {
    challenge
        .identifiers
        .rows()
        .into_iter()
        .map(|(name, role)| IdentifierRow { name, role })
        .collect()
}

fn history_row(number: usize, entry: &TraceEntry) -> HistoryRow {
    HistoryRow {
        number,
        plan_preview: head_chars(&entry.attempt.plan, PLAN_PREVIEW_CHARS).to_string(),
        result: if entry.decision.passed {
            "SUCCESS"
        } else {
            "FAILED"
        },
        feedback: head_chars(&entry.decision.rationale, HISTORY_FEEDBACK_CHARS).to_string(),
    }
}

/// Feedback drawn from the most recent trace entry.
fn last_feedback(trace: &HistoryTrace) -> String {
    let Some(last) = trace.entries().last() else {
        return "No previous feedback (first attempt).".to_string();
    };
    let outcome = last.attempt.outcome.as_ref();
    let error = outcome
        .map(|o| o.error_text.as_str())
        .filter(|text| !text.trim().is_empty())
        .or(last.decision.causing_error.as_deref());
    if let Some(error) = error {
        return format!(
            "Previous attempt failed:\n{}",
            head_chars(error, FEEDBACK_ERROR_CHARS)
        );
    }
    match outcome.map(|o| o.combined_output.as_str()) {
        Some(output) if !output.trim().is_empty() => format!(
            "Previous output (last {FEEDBACK_OUTPUT_CHARS} chars):\n{}",
            tail_chars(output, FEEDBACK_OUTPUT_CHARS)
        ),
        _ => "No previous feedback (first attempt).".to_string(),
    }
}
