//! Pass/fail judgement of a sandbox run.

use std::fmt::Display;

use crate::core::text::{head_chars, tail_chars};
use crate::core::trace::HistoryTrace;
use crate::core::types::{Decision, RunOutcome};

const ERROR_EXCERPT_CHARS: usize = 2000;
const FAILURE_OUTPUT_TAIL_CHARS: usize = 1000;
const SCORED_OUTPUT_TAIL_CHARS: usize = 2000;

/// Judge a completed run against `threshold`.
///
/// Build failure, run failure and a missing accuracy are all failures, checked
/// in that order. Otherwise the attempt passes when `accuracy >= threshold`;
/// the rationale cites the best accuracy already in `history` when there is
/// one.
pub fn judge(outcome: &RunOutcome, threshold: f64, history: &HistoryTrace) -> Decision {
    if !outcome.build_succeeded {
        return failed(failure_rationale("Build failed.", outcome));
    }
    if !outcome.run_succeeded {
        return failed(failure_rationale("Runtime error.", outcome));
    }
    let Some(accuracy) = outcome.accuracy else {
        return failed(format!(
            "Run succeeded but accuracy could not be parsed.\n\n\
             Output (last {FAILURE_OUTPUT_TAIL_CHARS} chars):\n{}",
            tail_chars(&outcome.combined_output, FAILURE_OUTPUT_TAIL_CHARS)
        ));
    };

    let passed = accuracy >= threshold;
    let status = if passed { "PASSED" } else { "FAILED" };
    let mut rationale = format!(
        "Accuracy: {accuracy:.4} ({:.1}%)\n\
         Threshold: {threshold:.2} ({:.0}%)\n\
         Status: {status}\n\n\
         Output (last {SCORED_OUTPUT_TAIL_CHARS} chars):\n{}",
        accuracy * 100.0,
        threshold * 100.0,
        tail_chars(&outcome.combined_output, SCORED_OUTPUT_TAIL_CHARS)
    );
    if let Some(best) = history.best_so_far().and_then(|entry| entry.attempt.accuracy()) {
        rationale.push_str(&format!("\n\nPrevious best accuracy: {best:.4}"));
    }

    Decision {
        passed,
        rationale,
        causing_error: None,
    }
}

impl Decision {
    /// Failing decision for an attempt that never reached the sandbox.
    pub fn from_error(err: &impl Display) -> Self {
        let message = err.to_string();
        Self {
            passed: false,
            rationale: format!("Implementation rejected before execution: {message}"),
            causing_error: Some(message),
        }
    }
}

fn failed(rationale: String) -> Decision {
    Decision {
        passed: false,
        rationale,
        causing_error: None,
    }
}

fn failure_rationale(headline: &str, outcome: &RunOutcome) -> String {
    format!(
        "{headline}\n\nError:\n{}\n\nOutput (last {FAILURE_OUTPUT_TAIL_CHARS} chars):\n{}",
        head_chars(&outcome.error_text, ERROR_EXCERPT_CHARS),
        tail_chars(&outcome.combined_output, FAILURE_OUTPUT_TAIL_CHARS)
    )
}
