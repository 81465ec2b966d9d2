//! Loop configuration loaded from a TOML file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Settings for one orchestrator run (TOML).
///
/// Missing fields take the defaults below. The value is built once and passed
/// by reference; nothing reads settings from globals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Challenge directory (`challenge.md`, `templates/`, `tests/`).
    pub challenge_dir: PathBuf,

    /// Event log and checkpoints are written here.
    pub session_dir: PathBuf,

    /// Per-attempt workspaces are created under this directory.
    pub workspace_dir: PathBuf,

    /// Total iterations to run before stopping.
    pub max_loops: u32,

    /// Iterations allowed in flight at once.
    pub max_parallel: usize,

    /// Accuracy at or above this passes.
    pub accuracy_threshold: f64,

    /// Recent trace entries shown to the propose stage.
    pub history_window: usize,

    pub sandbox: SandboxConfig,
    pub patch: PatchConfig,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub build_timeout_secs: u64,
    pub run_timeout_secs: u64,
    /// Per-stream cap on captured container output.
    pub output_limit_bytes: usize,
    /// Container CLI binary (`docker`, `podman`, ...).
    pub container_bin: String,
    pub image_prefix: String,
    /// Image used to build and score externally-validated challenges.
    pub validator_image: String,
    /// Where template files land inside a self-contained workspace.
    pub template_subdir: String,
    /// Project folder handed to the validator.
    pub build_dir: String,
    pub testcase_file: String,
    /// Mount point of a fixture directory inside the container.
    pub fixture_mount: String,
    /// Mount point of the workspace inside the validator container.
    pub workspace_mount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchConfig {
    /// Template file whose method body is replaced.
    pub solution_file: String,
    /// Header scanned for the identifier table.
    pub header_file: String,
    pub method: String,
    /// Fence tag of the code block taken from generation output.
    pub code_fence: String,
    /// Words that make an untagged fenced block acceptable.
    pub marker_vocabulary: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a prompt on stdin and prints the completion.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            challenge_dir: PathBuf::from("challenge"),
            session_dir: PathBuf::from("log"),
            workspace_dir: PathBuf::from("workspaces"),
            max_loops: 20,
            max_parallel: 1,
            accuracy_threshold: 0.8,
            history_window: 3,
            sandbox: SandboxConfig::default(),
            patch: PatchConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            build_timeout_secs: 600,
            run_timeout_secs: 600,
            output_limit_bytes: 1_000_000,
            container_bin: "docker".to_string(),
            image_prefix: "rdloop".to_string(),
            validator_image: "yashalabinc/fherma-validator".to_string(),
            template_subdir: "templates/openfhe".to_string(),
            build_dir: "app_build".to_string(),
            testcase_file: "test_case.json".to_string(),
            fixture_mount: "/data".to_string(),
            workspace_mount: "/fherma".to_string(),
        }
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            solution_file: "yourSolution.cpp".to_string(),
            header_file: "yourSolution.h".to_string(),
            method: "eval".to_string(),
            code_fence: "cpp".to_string(),
            marker_vocabulary: ["EvalMult", "EvalAdd", "m_cc", "m_InputC", "Ciphertext"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: ["codex", "exec", "-"].into_iter().map(str::to_string).collect(),
            timeout_secs: 600,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl SandboxConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_loops == 0 {
            return Err(anyhow!("max_loops must be > 0"));
        }
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.accuracy_threshold) {
            return Err(anyhow!(
                "accuracy_threshold must be within [0, 1], got {}",
                self.accuracy_threshold
            ));
        }
        if self.sandbox.build_timeout_secs == 0 || self.sandbox.run_timeout_secs == 0 {
            return Err(anyhow!("sandbox timeouts must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        for (field, value) in [
            ("sandbox.container_bin", &self.sandbox.container_bin),
            ("sandbox.image_prefix", &self.sandbox.image_prefix),
            ("sandbox.validator_image", &self.sandbox.validator_image),
            ("sandbox.template_subdir", &self.sandbox.template_subdir),
            ("sandbox.build_dir", &self.sandbox.build_dir),
            ("sandbox.testcase_file", &self.sandbox.testcase_file),
            ("patch.solution_file", &self.patch.solution_file),
            ("patch.header_file", &self.patch.header_file),
            ("patch.method", &self.patch.method),
            ("patch.code_fence", &self.patch.code_fence),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} must not be empty"));
            }
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(dir) = &overrides.challenge_dir {
            self.challenge_dir = dir.clone();
        }
        if let Some(dir) = &overrides.session_dir {
            self.session_dir = dir.clone();
        }
        if let Some(loops) = overrides.max_loops {
            self.max_loops = loops;
        }
        if let Some(parallel) = overrides.max_parallel {
            self.max_parallel = parallel;
        }
        if let Some(secs) = overrides.build_timeout_secs {
            self.sandbox.build_timeout_secs = secs;
        }
        if let Some(secs) = overrides.run_timeout_secs {
            self.sandbox.run_timeout_secs = secs;
        }
        if let Some(threshold) = overrides.accuracy_threshold {
            self.accuracy_threshold = threshold;
        }
    }
}

/// Individually overridable fields; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub challenge_dir: Option<PathBuf>,
    pub session_dir: Option<PathBuf>,
    pub max_loops: Option<u32>,
    pub max_parallel: Option<usize>,
    pub build_timeout_secs: Option<u64>,
    pub run_timeout_secs: Option<u64>,
    pub accuracy_threshold: Option<f64>,
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn nested_tables_override_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rdloop.toml");
        fs::write(&path, "max_parallel = 3\n\n[patch]\nmethod = \"solve\"\n").expect("write");
        let mut expected = LoopConfig::default();
        expected.max_parallel = 3;
        expected.patch.method = "solve".to_string();
        assert_eq!(load_config(&path).expect("load"), expected);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rdloop.toml");
        fs::write(
            &path,
            "max_loops = 5\n\n[sandbox]\nbuild_timeout_secs = 30\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_loops, 5);
        assert_eq!(cfg.sandbox.build_timeout_secs, 30);
        assert_eq!(cfg.sandbox.run_timeout_secs, 600);
        assert_eq!(cfg.patch, PatchConfig::default());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = LoopConfig::default();
        cfg.accuracy_threshold = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("accuracy_threshold"));
    }

    #[test]
    fn rejects_zero_parallelism_and_empty_command() {
        let mut cfg = LoopConfig::default();
        cfg.max_parallel = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = LoopConfig::default();
        cfg.generator.command = vec![" ".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut cfg = LoopConfig::default();
        cfg.apply(&ConfigOverrides {
            max_loops: Some(2),
            run_timeout_secs: Some(5),
            ..ConfigOverrides::default()
        });
        assert_eq!(cfg.max_loops, 2);
        assert_eq!(cfg.sandbox.run_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.sandbox.build_timeout_secs, 600);
        assert_eq!(cfg.max_parallel, 1);
    }
}
