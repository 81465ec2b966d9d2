//! Accuracy extraction from verifier output and validator result artifacts.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Per-slot tolerance when neither the run nor the test case declares one.
pub const DEFAULT_ERROR_THRESHOLD: f64 = 0.01;

/// Lowercased output fragments that mark a validator failure as a build error.
pub const BUILD_ERROR_MARKERS: [&str; 5] = [
    "cmake error",
    "compilation",
    "error:",
    "make[",
    "undefined reference",
];

static VERIFIER_ACCURACY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Accuracy:\s*([0-9]*\.?[0-9]+)").unwrap());
static SLOTS_PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Slots passed:\s*(\d+)/(\d+)").unwrap());
static OUTPUT_ACCURACY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[Aa]ccuracy:\s*([0-9]*\.?[0-9]+)").unwrap());

/// Which phase a failed validator invocation died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Build,
    Runtime,
}

pub fn classify_validator_failure(output: &str) -> FailureKind {
    let lower = output.to_lowercase();
    if BUILD_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        FailureKind::Build
    } else {
        FailureKind::Runtime
    }
}

/// Accuracy printed by a challenge's own verifier: `Accuracy: 0.92`, or
/// `Slots passed: X/Y` as a fallback.
pub fn parse_fixture_accuracy(output: &str) -> Option<f64> {
    if let Some(value) = capture_fraction(&VERIFIER_ACCURACY_RE, output) {
        return Some(value);
    }
    let caps = SLOTS_PASSED_RE.captures(output)?;
    let passed: u64 = caps.get(1)?.as_str().parse().ok()?;
    let total: u64 = caps.get(2)?.as_str().parse().ok()?;
    if total == 0 {
        return None;
    }
    in_unit_range(passed as f64 / total as f64)
}

/// Last-resort scan of free-form output for an accuracy marker.
pub fn parse_output_accuracy(output: &str) -> Option<f64> {
    capture_fraction(&OUTPUT_ACCURACY_RE, output)
}

fn capture_fraction(re: &Regex, output: &str) -> Option<f64> {
    let raw = re.captures(output)?.get(1)?.as_str();
    in_unit_range(raw.parse().ok()?)
}

fn in_unit_range(value: f64) -> Option<f64> {
    (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(value)
}

/// `result.json` written by the external validator.
#[derive(Debug, Default, Deserialize)]
pub struct ValidatorReport {
    #[serde(default)]
    pub testcases: Vec<ValidatorTestCase>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ValidatorTestCase {
    pub error_threshold: Option<f64>,
    #[serde(default)]
    pub runs: Vec<ValidatorRun>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ValidatorRun {
    pub error_threshold: Option<f64>,
    #[serde(default)]
    pub result: Vec<Value>,
    #[serde(default)]
    pub expected_output: Vec<Value>,
}

impl ValidatorReport {
    pub fn parse(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("parse validator result")
    }

    /// Fraction of paired (result, expected) slots within tolerance.
    ///
    /// The run threshold wins over the test case threshold, which wins over
    /// [`DEFAULT_ERROR_THRESHOLD`]. Returns `None` when there are no slots.
    pub fn slot_accuracy(&self) -> Result<Option<f64>> {
        let mut total = 0usize;
        let mut correct = 0usize;
        for testcase in &self.testcases {
            for run in &testcase.runs {
                let threshold = run
                    .error_threshold
                    .or(testcase.error_threshold)
                    .unwrap_or(DEFAULT_ERROR_THRESHOLD);
                for (result, expected) in run.result.iter().zip(&run.expected_output) {
                    total += 1;
                    if (scalar(result)? - scalar(expected)?).abs() <= threshold {
                        correct += 1;
                    }
                }
            }
        }
        if total == 0 {
            return Ok(None);
        }
        Ok(Some(correct as f64 / total as f64))
    }
}

fn scalar(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("non-finite slot value {n}")),
        Value::String(s) => s
            .trim()
            .parse()
            .with_context(|| format!("parse slot value {s:?}")),
        other => Err(anyhow!("unexpected slot value {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_accuracy_line() {
        assert_eq!(parse_fixture_accuracy("...\nAccuracy: 0.92\n"), Some(0.92));
        assert_eq!(parse_fixture_accuracy("Accuracy:1"), Some(1.0));
        assert_eq!(parse_fixture_accuracy("Accuracy: 0.5."), Some(0.5));
    }

    #[test]
    fn slots_passed_fallback() {
        assert_eq!(parse_fixture_accuracy("Slots passed: 3/4"), Some(0.75));
        assert_eq!(parse_fixture_accuracy("Slots passed: 0/0"), None);
        assert_eq!(parse_fixture_accuracy("nothing useful"), None);
    }

    #[test]
    fn out_of_range_accuracy_is_rejected() {
        assert_eq!(parse_fixture_accuracy("Accuracy: 92"), None);
        assert_eq!(parse_output_accuracy("accuracy: 1.5"), None);
    }

    #[test]
    fn output_scan_is_case_tolerant() {
        assert_eq!(parse_output_accuracy("final accuracy: 0.31"), Some(0.31));
        assert_eq!(parse_fixture_accuracy("final accuracy: 0.31"), None);
    }

    #[test]
    fn classifies_build_failures_by_marker() {
        assert_eq!(
            classify_validator_failure("CMake Error at CMakeLists.txt:3"),
            FailureKind::Build
        );
        assert_eq!(
            classify_validator_failure("yourSolution.cpp:12: undefined reference to `foo'"),
            FailureKind::Build
        );
        assert_eq!(
            classify_validator_failure("Segmentation fault (core dumped)"),
            FailureKind::Runtime
        );
    }

    #[test]
    fn slot_accuracy_uses_threshold_precedence() {
        let report = ValidatorReport::parse(
            r#"{
              "testcases": [
                {
                  "error_threshold": 0.5,
                  "runs": [
                    {"result": [1.0, 2.0], "expected_output": [1.4, 2.6]},
                    {"error_threshold": 0.001, "result": [1.0], "expected_output": [1.01]}
                  ]
                },
                {
                  "runs": [
                    {"result": ["0.005", 3], "expected_output": [0.0, 3.5]}
                  ]
                }
              ]
            }"#,
        )
        .expect("parse");
        // Correct slots: 1.0~1.4 (0.5), 0.005~0.0 (default 0.01) => 2 of 5.
        assert_eq!(report.slot_accuracy().expect("accuracy"), Some(0.4));
    }

    #[test]
    fn slot_accuracy_without_slots_is_none() {
        let report = ValidatorReport::parse(r#"{"testcases": []}"#).expect("parse");
        assert_eq!(report.slot_accuracy().expect("accuracy"), None);
    }

    #[test]
    fn malformed_slot_is_error() {
        let report = ValidatorReport::parse(
            r#"{"testcases": [{"runs": [{"result": [null], "expected_output": [1.0]}]}]}"#,
        )
        .expect("parse");
        assert!(report.slot_accuracy().is_err());
    }
}
