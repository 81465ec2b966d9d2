//! Plain-text rendering of the per-loop table and summary.

use std::fmt::Write as _;

use rdloop::core::text::head_chars;

use crate::events::LoopRow;
use crate::summary::ReportSummary;

const PLAN_PREVIEW_CHARS: usize = 60;

fn flag(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "ok",
        Some(false) => "FAIL",
        None => "-",
    }
}

fn accuracy(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |a| format!("{a:.4}"))
}

pub fn render_table(rows: &[LoopRow]) -> String {
    let session_width = rows
        .iter()
        .map(|r| r.session.chars().count())
        .max()
        .unwrap_or(0)
        .max("session".len());
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<session_width$}  {:>4}  {:<5}  {:<5}  {:>8}  {:<8}  plan",
        "session", "loop", "build", "run", "accuracy", "decision"
    );
    for row in rows {
        let plan = row.plan.lines().next().unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<session_width$}  {:>4}  {:<5}  {:<5}  {:>8}  {:<8}  {}",
            row.session,
            row.loop_idx,
            flag(row.build_ok),
            flag(row.run_ok),
            accuracy(row.accuracy),
            if row.passed { "PASS" } else { "fail" },
            head_chars(plan, PLAN_PREVIEW_CHARS)
        );
    }
    out
}

pub fn render_summary(summary: &ReportSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "report: sessions={} loops={} passes={}",
        summary.sessions, summary.loops, summary.passes
    );
    let _ = writeln!(
        out,
        "report: build_ok={} run_ok={} rejected={}",
        summary.build_ok, summary.run_ok, summary.rejected
    );
    let _ = writeln!(
        out,
        "report: best_accuracy={} mean_accuracy={}",
        accuracy(summary.best_accuracy),
        accuracy(summary.mean_accuracy)
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::aggregate;

    fn rows() -> Vec<LoopRow> {
        vec![
            LoopRow {
                session: "log".to_string(),
                loop_idx: 0,
                build_ok: None,
                run_ok: None,
                accuracy: None,
                passed: false,
                plan: "Square it\nthen scale".to_string(),
            },
            LoopRow {
                session: "log".to_string(),
                loop_idx: 1,
                build_ok: Some(true),
                run_ok: Some(true),
                accuracy: Some(0.875),
                passed: true,
                plan: "x".repeat(100),
            },
        ]
    }

    #[test]
    fn table_has_one_line_per_loop() {
        let table = render_table(&rows());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("session"));
        assert!(lines[1].contains("Square it"));
        assert!(!lines[1].contains("then scale"));
        assert!(lines[2].contains("0.8750"));
        assert!(lines[2].contains("PASS"));
        assert!(lines[2].ends_with(&"x".repeat(PLAN_PREVIEW_CHARS)));
    }

    #[test]
    fn summary_lines() {
        let text = render_summary(&aggregate(&rows(), 1));
        assert!(text.contains("report: sessions=1 loops=2 passes=1"));
        assert!(text.contains("rejected=1"));
        assert!(text.contains("best_accuracy=0.8750"));
    }
}
