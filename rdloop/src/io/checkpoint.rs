//! Per-stage checkpoints (`<session>/checkpoints/<loop>/<n>_<stage>.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::trace::HistoryTrace;
use crate::core::types::{IterationState, Stage};
use crate::io::config::LoopConfig;
use crate::io::write_atomic;

pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Session-wide counters carried across resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Iterations started so far (one past the highest loop index).
    pub loops_started: u32,
    /// Stages completed so far.
    pub stages_run: u64,
}

/// Snapshot written after `stage` of iteration `loop_idx` completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub loop_idx: u32,
    pub stage: Stage,
    pub config: LoopConfig,
    pub iteration: IterationState,
    pub trace: HistoryTrace,
    pub counters: RunCounters,
}

impl Checkpoint {
    /// Session directory a checkpoint file lives under.
    pub fn session_dir_of(path: &Path) -> Result<PathBuf> {
        path.parent()
            .and_then(Path::parent)
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("checkpoint path {} is not inside a session", path.display()))
    }
}

pub fn checkpoint_path(session_dir: &Path, loop_idx: u32, stage: Stage) -> PathBuf {
    session_dir
        .join(CHECKPOINTS_DIR)
        .join(loop_idx.to_string())
        .join(format!("{}_{}.json", stage.index(), stage))
}

/// Atomically write a checkpoint (temp file + rename).
pub fn write_checkpoint(session_dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf> {
    let path = checkpoint_path(session_dir, checkpoint.loop_idx, checkpoint.stage);
    debug!(path = %path.display(), loop_idx = checkpoint.loop_idx, stage = %checkpoint.stage, "writing checkpoint");
    let mut buf = serde_json::to_string_pretty(checkpoint).context("serialize checkpoint")?;
    buf.push('\n');
    write_atomic(&path, &buf)?;
    Ok(path)
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    debug!(path = %path.display(), "loading checkpoint");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    checkpoint
        .config
        .validate()
        .with_context(|| format!("invalid config in checkpoint {}", path.display()))?;
    Ok(checkpoint)
}

/// Remove checkpoints newer than (`loop_idx`, `stage`): later stages of the
/// same loop and every later loop. Returns the number of files removed.
pub fn checkout(session_dir: &Path, loop_idx: u32, stage: Stage) -> Result<usize> {
    let root = session_dir.join(CHECKPOINTS_DIR);
    if !root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(&root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", root.display()))?;
        let Some(entry_loop) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let dir = entry.path();
        if entry_loop > loop_idx {
            removed += count_files(&dir)?;
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        } else if entry_loop == loop_idx {
            for later in Stage::ALL.iter().filter(|s| s.index() > stage.index()) {
                let path = checkpoint_path(session_dir, loop_idx, *later);
                if path.exists() {
                    fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
                    removed += 1;
                }
            }
        }
    }
    info!(loop_idx, stage = %stage, removed, "checked out checkpoint");
    Ok(removed)
}

fn count_files(dir: &Path) -> Result<usize> {
    Ok(fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Attempt, Decision};

    fn checkpoint(loop_idx: u32, stage: Stage) -> Checkpoint {
        let mut trace = HistoryTrace::new();
        trace.append(
            Attempt::new(0, "earlier"),
            Decision {
                passed: false,
                rationale: "r".to_string(),
                causing_error: None,
            },
        );
        Checkpoint {
            loop_idx,
            stage,
            config: LoopConfig::default(),
            iteration: IterationState::new(Attempt::new(loop_idx, "plan")),
            trace,
            counters: RunCounters {
                loops_started: loop_idx + 1,
                stages_run: 7,
            },
        }
    }

    #[test]
    fn checkpoint_paths_are_stable() {
        let path = checkpoint_path(Path::new("log"), 4, Stage::Execute);
        assert_eq!(path, Path::new("log/checkpoints/4/2_execute.json"));
        assert_eq!(
            Checkpoint::session_dir_of(&path).expect("session"),
            Path::new("log")
        );
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cp = checkpoint(1, Stage::Implement);
        let path = write_checkpoint(temp.path(), &cp).expect("write");
        assert!(path.ends_with("checkpoints/1/1_implement.json"));
        assert_eq!(load_checkpoint(&path).expect("load"), cp);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn checkout_drops_later_stages_and_loops() {
        let temp = tempfile::tempdir().expect("tempdir");
        for loop_idx in 0..3 {
            for stage in Stage::ALL {
                write_checkpoint(temp.path(), &checkpoint(loop_idx, stage)).expect("write");
            }
        }
        let removed = checkout(temp.path(), 1, Stage::Implement).expect("checkout");
        assert_eq!(removed, 3 + 5);
        assert!(checkpoint_path(temp.path(), 0, Stage::Record).exists());
        assert!(checkpoint_path(temp.path(), 1, Stage::Implement).exists());
        assert!(!checkpoint_path(temp.path(), 1, Stage::Execute).exists());
        assert!(!temp.path().join("checkpoints/2").exists());
    }

    #[test]
    fn load_rejects_garbage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.json");
        fs::write(&path, "{}").expect("write");
        assert!(load_checkpoint(&path).is_err());
    }
}
