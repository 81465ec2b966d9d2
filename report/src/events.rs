//! Per-loop records read back from session event logs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rdloop::core::types::{Attempt, Decision, Stage};
use rdloop::io::event_log::{EVENTS_FILE, Event, read_events};
use serde::Deserialize;
use tracing::debug;

/// Payload of a `loop_<i>.record.trace` event (other fields are ignored).
#[derive(Debug, Deserialize)]
struct TraceRecord {
    attempt: Attempt,
    decision: Decision,
}

/// One recorded iteration of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopRow {
    pub session: String,
    pub loop_idx: u32,
    /// `None` when execute never ran (rejected implementation).
    pub build_ok: Option<bool>,
    pub run_ok: Option<bool>,
    pub accuracy: Option<f64>,
    pub passed: bool,
    pub plan: String,
}

impl LoopRow {
    fn from_record(session: &str, loop_idx: u32, record: TraceRecord) -> Self {
        let outcome = record.attempt.outcome.as_ref();
        Self {
            session: session.to_string(),
            loop_idx,
            build_ok: outcome.map(|o| o.build_succeeded),
            run_ok: outcome.map(|o| o.run_succeeded),
            accuracy: record.attempt.accuracy(),
            passed: record.decision.passed,
            plan: record.attempt.plan,
        }
    }
}

/// Label for a session directory: its final path component.
pub fn session_label(session_dir: &Path) -> String {
    session_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| session_dir.display().to_string())
}

/// Rows for every session, in argument order then loop order, plus warnings
/// for sessions or events that could not be read.
pub fn load_sessions(session_dirs: &[PathBuf]) -> (Vec<LoopRow>, Vec<String>) {
    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for dir in session_dirs {
        match load_session(dir) {
            Ok((session_rows, session_warnings)) => {
                rows.extend(session_rows);
                warnings.extend(session_warnings);
            }
            Err(err) => warnings.push(format!("skip {}: {err:#}", dir.display())),
        }
    }
    (rows, warnings)
}

/// Rows of one session. A loop recorded more than once (after a resume)
/// keeps its last record.
pub fn load_session(session_dir: &Path) -> Result<(Vec<LoopRow>, Vec<String>)> {
    let path = session_dir.join(EVENTS_FILE);
    let events = read_events(&path).with_context(|| format!("load {}", path.display()))?;
    let label = session_label(session_dir);
    debug!(session = %label, events = events.len(), "session events read");
    Ok(rows_from_events(&label, &events))
}

pub fn rows_from_events(session: &str, events: &[Event]) -> (Vec<LoopRow>, Vec<String>) {
    let mut latest: BTreeMap<u32, LoopRow> = BTreeMap::new();
    let mut warnings = Vec::new();
    for event in events {
        if event.stage != Some(Stage::Record) || event.kind() != "trace" {
            continue;
        }
        let Some(loop_idx) = event.loop_idx else {
            continue;
        };
        match serde_json::from_value::<TraceRecord>(event.payload.clone()) {
            Ok(record) => {
                latest.insert(loop_idx, LoopRow::from_record(session, loop_idx, record));
            }
            Err(err) => warnings.push(format!("{session}: skip {} ({err})", event.tag)),
        }
    }
    (latest.into_values().collect(), warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdloop::core::types::RunOutcome;
    use rdloop::io::event_log::EventLog;
    use serde_json::json;

    fn decision(passed: bool) -> Decision {
        Decision {
            passed,
            rationale: "r".to_string(),
            causing_error: None,
        }
    }

    fn scored(loop_idx: u32, plan: &str, accuracy: f64) -> Attempt {
        let mut attempt = Attempt::new(loop_idx, plan);
        attempt.outcome = Some(RunOutcome {
            build_succeeded: true,
            run_succeeded: true,
            accuracy: Some(accuracy),
            combined_output: String::new(),
            error_text: String::new(),
        });
        attempt
    }

    fn record(log: &EventLog, attempt: &Attempt, passed: bool) {
        log.record_stage(
            attempt.loop_idx,
            Stage::Record,
            "trace",
            &json!({"index": 0, "attempt": attempt, "decision": decision(passed)}),
        )
        .expect("record");
    }

    #[test]
    fn last_record_per_loop_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(temp.path()).expect("open");
        log.record_run("settings", &json!({})).expect("settings");
        record(&log, &scored(1, "b", 0.4), false);
        record(&log, &scored(0, "a", 0.3), false);
        record(&log, &scored(1, "b again", 0.9), true);
        log.record_stage(0, Stage::Judge, "decision", &decision(false))
            .expect("decision");

        let (rows, warnings) = load_session(temp.path()).expect("load");
        assert!(warnings.is_empty());
        let loops: Vec<u32> = rows.iter().map(|r| r.loop_idx).collect();
        assert_eq!(loops, vec![0, 1]);
        assert_eq!(rows[1].plan, "b again");
        assert_eq!(rows[1].accuracy, Some(0.9));
        assert!(rows[1].passed);
    }

    #[test]
    fn rejected_attempt_has_no_run_columns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(temp.path()).expect("open");
        record(&log, &Attempt::new(0, "plan"), false);

        let (rows, _) = load_session(temp.path()).expect("load");
        assert_eq!(rows[0].build_ok, None);
        assert_eq!(rows[0].run_ok, None);
        assert_eq!(rows[0].accuracy, None);
    }

    #[test]
    fn bad_payloads_and_sessions_become_warnings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = temp.path().join("s1");
        let log = EventLog::open(&session).expect("open");
        log.record_stage(0, Stage::Record, "trace", &json!({"attempt": 3}))
            .expect("record");

        let (rows, warnings) =
            load_sessions(&[session.clone(), temp.path().join("missing")]);
        assert!(rows.is_empty());
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("s1: skip loop_0.record.trace"));
        assert!(warnings[1].starts_with("skip "));
    }
}
