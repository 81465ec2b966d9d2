//! Shared types for the experiment loop.
//!
//! These types cross every stage boundary and are persisted verbatim in
//! checkpoints and the event log, so their serialized shape must stay stable.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One stage of a loop iteration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Propose,
    Implement,
    Execute,
    Judge,
    Record,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Propose,
        Stage::Implement,
        Stage::Execute,
        Stage::Judge,
        Stage::Record,
    ];

    /// Stable name used in event tags and checkpoint file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Propose => "propose",
            Stage::Implement => "implement",
            Stage::Execute => "execute",
            Stage::Judge => "judge",
            Stage::Record => "record",
        }
    }

    /// Zero-based position in [`Stage::ALL`].
    pub fn index(self) -> usize {
        match self {
            Stage::Propose => 0,
            Stage::Implement => 1,
            Stage::Execute => 2,
            Stage::Judge => 3,
            Stage::Record => 4,
        }
    }

    /// The stage that normally follows this one, or `None` after `Record`.
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a challenge builds and scores candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeVariant {
    /// The challenge ships its own build scaffolding and verifier; each fixture
    /// directory is run against the built image.
    SelfContained,
    /// A fixed validator image builds the candidate and scores it against a
    /// reference test-case file.
    ExternallyValidated,
}

impl ChallengeVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeVariant::SelfContained => "self-contained",
            ChallengeVariant::ExternallyValidated => "externally-validated",
        }
    }
}

/// Result of building and running one candidate in the sandbox.
///
/// `accuracy` is only meaningful when `run_succeeded` is true, and a failed
/// build always implies a failed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub build_succeeded: bool,
    pub run_succeeded: bool,
    pub accuracy: Option<f64>,
    pub combined_output: String,
    pub error_text: String,
}

impl RunOutcome {
    /// Outcome for a candidate that never got past the build phase.
    pub fn build_failure(combined_output: String, error_text: String) -> Self {
        Self {
            build_succeeded: false,
            run_succeeded: false,
            accuracy: None,
            combined_output,
            error_text,
        }
    }

    /// Accuracy gated on the run having succeeded.
    pub fn scored_accuracy(&self) -> Option<f64> {
        if self.run_succeeded {
            self.accuracy
        } else {
            None
        }
    }
}

/// One loop iteration's artifact: plan, generated patch, workspace files and
/// the sandbox outcome. Filled in stage by stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub loop_idx: u32,
    /// Algorithm plan produced by the propose stage.
    pub plan: String,
    /// Function body injected into the solution template.
    pub patch: Option<String>,
    /// Generated files (name -> contents) overlaid on the template files.
    pub files: BTreeMap<String, String>,
    pub outcome: Option<RunOutcome>,
}

impl Attempt {
    pub fn new(loop_idx: u32, plan: impl Into<String>) -> Self {
        Self {
            loop_idx,
            plan: plan.into(),
            patch: None,
            files: BTreeMap::new(),
            outcome: None,
        }
    }

    /// Add or replace a generated file; later injections win.
    pub fn inject_file(&mut self, name: impl Into<String>, contents: impl Into<String>) {
        self.files.insert(name.into(), contents.into());
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.outcome.as_ref().and_then(RunOutcome::scored_accuracy)
    }
}

/// Pass/fail verdict for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub passed: bool,
    pub rationale: String,
    /// Error that short-circuited the attempt before it reached the sandbox.
    pub causing_error: Option<String>,
}

/// In-flight state of one iteration, carried between stages and persisted in
/// checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationState {
    pub attempt: Attempt,
    /// Why implement rejected the attempt; execute is skipped when set.
    pub rejection: Option<String>,
    pub decision: Option<Decision>,
}

impl IterationState {
    pub fn new(attempt: Attempt) -> Self {
        Self {
            attempt,
            rejection: None,
            decision: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_in_order() {
        let mut seen = vec![Stage::Propose];
        while let Some(next) = seen.last().and_then(|stage| stage.next()) {
            seen.push(next);
        }
        assert_eq!(seen, Stage::ALL);
        assert_eq!(Stage::Record.next(), None);
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Stage::Record).expect("serialize"),
            "\"record\""
        );
        assert_eq!(
            serde_json::to_string(&ChallengeVariant::ExternallyValidated).expect("serialize"),
            "\"externally-validated\""
        );
    }

    #[test]
    fn failed_run_hides_accuracy() {
        let mut attempt = Attempt::new(0, "plan");
        attempt.outcome = Some(RunOutcome {
            build_succeeded: true,
            run_succeeded: false,
            accuracy: Some(0.5),
            ..RunOutcome::default()
        });
        assert_eq!(attempt.accuracy(), None);
    }

    #[test]
    fn later_injection_replaces_file() {
        let mut attempt = Attempt::new(0, "plan");
        attempt.inject_file("yourSolution.cpp", "v1");
        attempt.inject_file("yourSolution.cpp", "v2");
        assert_eq!(attempt.files.len(), 1);
        assert_eq!(attempt.files["yourSolution.cpp"], "v2");
    }
}
