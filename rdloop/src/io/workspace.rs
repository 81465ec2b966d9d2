//! Per-attempt workspace directories.
//!
//! Every attempt gets a fresh directory; nothing is shared or reused across
//! attempts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::debug;

/// An isolated workspace owned by one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Absolute path to the workspace root.
    pub root: PathBuf,
    /// Directory name (challenge, loop index, timestamp, random suffix).
    pub name: String,
}

/// Create an empty workspace under `base_dir`.
pub fn create_workspace(base_dir: &Path, challenge: &str, loop_idx: u32) -> Result<Workspace> {
    fs::create_dir_all(base_dir)
        .with_context(|| format!("create workspace dir {}", base_dir.display()))?;
    let base_dir = base_dir
        .canonicalize()
        .with_context(|| format!("resolve {}", base_dir.display()))?;

    let name = build_workspace_name(challenge, loop_idx, &generate_timestamp(), &short_id(6));
    let root = base_dir.join(&name);
    fs::create_dir(&root).with_context(|| format!("create workspace root {}", root.display()))?;
    debug!(root = %root.display(), "workspace created");
    Ok(Workspace { root, name })
}

pub fn build_workspace_name(challenge: &str, loop_idx: u32, timestamp: &str, short_id: &str) -> String {
    format!("{challenge}_loop{loop_idx}_{timestamp}_{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Lowercase alphanumeric id of `len` characters.
pub fn short_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect::<String>()
        .to_lowercase()
}

/// Copy every regular file directly under `src` into `dst`, skipping names
/// that already exist in `dst`.
pub fn copy_files_no_overwrite(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", src.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let dest = dst.join(entry.file_name());
        if dest.exists() {
            continue;
        }
        fs::copy(&path, &dest)
            .with_context(|| format!("copy {} to {}", path.display(), dest.display()))?;
        copied += 1;
    }
    Ok(copied)
}

/// Write `files` (name -> contents) into `dir`, replacing existing files.
pub fn write_files(dir: &Path, files: &BTreeMap<String, String>) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for (name, contents) in files {
        let path = dir.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// Write `files` into `dir` only where no file of that name exists yet.
pub fn write_files_no_overwrite(dir: &Path, files: &BTreeMap<String, String>) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for (name, contents) in files {
        let path = dir.join(name);
        if path.exists() {
            continue;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// Point `link` at `target`, replacing whatever `link` was before.
pub fn replace_dir_link(link: &Path, target: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(link) {
        if meta.is_dir() && !meta.file_type().is_symlink() {
            fs::remove_dir_all(link).with_context(|| format!("remove {}", link.display()))?;
        } else {
            fs::remove_file(link).with_context(|| format!("remove {}", link.display()))?;
        }
    }
    let target = target
        .canonicalize()
        .with_context(|| format!("resolve {}", target.display()))?;
    symlink_dir(&target, link)
        .with_context(|| format!("link {} -> {}", link.display(), target.display()))
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
