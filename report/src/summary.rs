use serde::Serialize;

use crate::events::LoopRow;

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub sessions: usize,
    pub loops: usize,
    pub passes: usize,
    pub build_ok: usize,
    pub run_ok: usize,
    /// Loops rejected before execute.
    pub rejected: usize,
    pub best_accuracy: Option<f64>,
    pub mean_accuracy: Option<f64>,
    pub accuracy_per_loop: Vec<LoopAccuracy>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct LoopAccuracy {
    pub session: String,
    pub loop_idx: u32,
    pub accuracy: Option<f64>,
}

pub fn aggregate(rows: &[LoopRow], sessions: usize) -> ReportSummary {
    let mut summary = ReportSummary {
        sessions,
        loops: rows.len(),
        ..ReportSummary::default()
    };
    let mut scored = 0usize;
    let mut total = 0.0;
    for row in rows {
        if row.passed {
            summary.passes += 1;
        }
        match row.build_ok {
            Some(true) => summary.build_ok += 1,
            Some(false) => {}
            None => summary.rejected += 1,
        }
        if row.run_ok == Some(true) {
            summary.run_ok += 1;
        }
        if let Some(accuracy) = row.accuracy {
            scored += 1;
            total += accuracy;
            if summary.best_accuracy.is_none_or(|best| accuracy > best) {
                summary.best_accuracy = Some(accuracy);
            }
        }
        summary.accuracy_per_loop.push(LoopAccuracy {
            session: row.session.clone(),
            loop_idx: row.loop_idx,
            accuracy: row.accuracy,
        });
    }
    summary.mean_accuracy = (scored > 0).then(|| total / scored as f64);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(loop_idx: u32, build_ok: Option<bool>, accuracy: Option<f64>, passed: bool) -> LoopRow {
        LoopRow {
            session: "log".to_string(),
            loop_idx,
            build_ok,
            run_ok: build_ok.map(|ok| ok && accuracy.is_some()),
            accuracy,
            passed,
            plan: format!("plan {loop_idx}"),
        }
    }

    #[test]
    fn aggregates_rows() {
        let rows = vec![
            row(0, None, None, false),
            row(1, Some(false), None, false),
            row(2, Some(true), Some(0.5), false),
            row(3, Some(true), Some(0.9), true),
        ];
        let summary = aggregate(&rows, 1);
        assert_eq!(summary.loops, 4);
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.build_ok, 2);
        assert_eq!(summary.run_ok, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.best_accuracy, Some(0.9));
        assert!((summary.mean_accuracy.expect("mean") - 0.7).abs() < 1e-9);
        assert_eq!(summary.accuracy_per_loop[2].accuracy, Some(0.5));
    }

    #[test]
    fn empty_rows_have_no_accuracy() {
        let summary = aggregate(&[], 0);
        assert_eq!(summary, ReportSummary::default());
    }
}
