//! Append-only JSON Lines event log (`<session>/events.jsonl`).
//!
//! Events are product output, always written and unaffected by `RUST_LOG`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::types::Stage;

pub const EVENTS_FILE: &str = "events.jsonl";

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// `loop_<i>.<stage>.<kind>` for stage events, a bare name for run events.
    pub tag: String,
    pub loop_idx: Option<u32>,
    pub stage: Option<Stage>,
    /// RFC 3339 UTC.
    pub timestamp: String,
    pub payload: Value,
}

impl Event {
    /// The `<kind>` suffix of a stage tag, or the whole tag for run events.
    pub fn kind(&self) -> &str {
        self.tag.rsplit('.').next().unwrap_or(&self.tag)
    }
}

pub fn stage_tag(loop_idx: u32, stage: Stage, kind: &str) -> String {
    format!("loop_{loop_idx}.{stage}.{kind}")
}

/// Event log writer shared by concurrently running iterations.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl EventLog {
    /// Open `<session_dir>/events.jsonl` for appending.
    pub fn open(session_dir: &Path) -> Result<Self> {
        fs::create_dir_all(session_dir)
            .with_context(|| format!("create session dir {}", session_dir.display()))?;
        let path = session_dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open event log {}", path.display()))?;
        debug!(path = %path.display(), "event log opened");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a run-level event.
    pub fn record_run<T: Serialize>(&self, tag: &str, payload: &T) -> Result<()> {
        self.append(Event {
            tag: tag.to_string(),
            loop_idx: None,
            stage: None,
            timestamp: Utc::now().to_rfc3339(),
            payload: serde_json::to_value(payload).context("serialize event payload")?,
        })
    }

    /// Record an event produced by `stage` of iteration `loop_idx`.
    pub fn record_stage<T: Serialize>(
        &self,
        loop_idx: u32,
        stage: Stage,
        kind: &str,
        payload: &T,
    ) -> Result<()> {
        self.append(Event {
            tag: stage_tag(loop_idx, stage, kind),
            loop_idx: Some(loop_idx),
            stage: Some(stage),
            timestamp: Utc::now().to_rfc3339(),
            payload: serde_json::to_value(payload).context("serialize event payload")?,
        })
    }

    fn append(&self, event: Event) -> Result<()> {
        let mut line = serde_json::to_string(&event).context("serialize event")?;
        line.push('\n');
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush())
            .with_context(|| format!("append event {}", self.path.display()))?;
        debug!(tag = %event.tag, "event recorded");
        Ok(())
    }
}

/// Read every event from an event log file.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let file = File::open(path).with_context(|| format!("open event log {}", path.display()))?;
    let mut events = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn stage_tags_are_stable() {
        assert_eq!(
            stage_tag(3, Stage::Implement, "coded_attempt"),
            "loop_3.implement.coded_attempt"
        );
    }

    #[test]
    fn records_run_and_stage_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(temp.path()).expect("open");
        log.record_run("settings", &serde_json::json!({"max_loops": 2}))
            .expect("run event");
        log.record_stage(0, Stage::Propose, "plan", &"square it")
            .expect("stage event");

        let events = read_events(log.path()).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tag, "settings");
        assert_eq!(events[0].loop_idx, None);
        assert_eq!(events[0].kind(), "settings");
        assert_eq!(events[1].tag, "loop_0.propose.plan");
        assert_eq!(events[1].stage, Some(Stage::Propose));
        assert_eq!(events[1].kind(), "plan");
        assert_eq!(events[1].payload, serde_json::json!("square it"));
    }

    #[test]
    fn reopening_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        EventLog::open(temp.path())
            .expect("open")
            .record_run("a", &1)
            .expect("a");
        EventLog::open(temp.path())
            .expect("reopen")
            .record_run("b", &2)
            .expect("b");
        let events = read_events(&temp.path().join(EVENTS_FILE)).expect("read");
        let tags: Vec<&str> = events.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn concurrent_writers_never_split_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(EventLog::open(temp.path()).expect("open"));
        let handles: Vec<_> = (0..4u32)
            .map(|loop_idx| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..25 {
                        log.record_stage(loop_idx, Stage::Execute, "run_outcome", &"x".repeat(512))
                            .expect("record");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(read_events(log.path()).expect("read").len(), 100);
    }
}
