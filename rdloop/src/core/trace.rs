//! Append-only history of judged attempts.

use serde::{Deserialize, Serialize};

use crate::core::types::{Attempt, Decision};

/// One recorded (attempt, decision) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub attempt: Attempt,
    pub decision: Decision,
}

/// Ordered record of every attempt that reached the record stage.
///
/// Entries are never removed or rewritten. `dag_parent` holds one parent set
/// per entry; attempts are currently always recorded as roots, so every set
/// is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryTrace {
    entries: Vec<TraceEntry>,
    dag_parent: Vec<Vec<usize>>,
}

impl HistoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, attempt: Attempt, decision: Decision) {
        self.entries.push(TraceEntry { attempt, decision });
        self.dag_parent.push(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn parents(&self) -> &[Vec<usize>] {
        &self.dag_parent
    }

    /// Entry with the highest accuracy among those that have one, pass or
    /// fail. Ties go to the earliest entry.
    pub fn best_so_far(&self) -> Option<&TraceEntry> {
        let mut best: Option<(&TraceEntry, f64)> = None;
        for entry in &self.entries {
            let Some(accuracy) = entry.attempt.accuracy() else {
                continue;
            };
            if best.is_none_or(|(_, top)| accuracy > top) {
                best = Some((entry, accuracy));
            }
        }
        best.map(|(entry, _)| entry)
    }

    /// Last `n` entries in append order.
    pub fn recent_window(&self, n: usize) -> &[TraceEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn pass_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.decision.passed)
            .count()
    }
}
