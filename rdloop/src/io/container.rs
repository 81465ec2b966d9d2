//! Container runtime abstraction.
//!
//! The [`ContainerRuntime`] trait decouples the sandbox from the container
//! CLI. [`DockerRuntime`] shells out to a docker-compatible binary; tests use
//! scripted runtimes that return predetermined invocations.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;
use crate::io::workspace::short_id;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of one container CLI call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Combined stdout and stderr.
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl Invocation {
    pub fn finished(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code,
            timed_out: false,
        }
    }

    /// A call killed at its deadline; reported as exit status 1.
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            output: format!("command timed out after {}s", timeout.as_secs()),
            exit_code: 1,
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// A single `run` of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub image: String,
    pub mounts: Vec<Mount>,
    /// Arguments passed to the image entrypoint.
    pub args: Vec<String>,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
}

/// Build, run and remove container images.
///
/// `build` and `run` report failures and timeouts through [`Invocation`];
/// an `Err` means the runtime could not be invoked at all.
pub trait ContainerRuntime: Send + Sync {
    fn build(&self, context_dir: &Path, tag: &str, timeout: Duration) -> Result<Invocation>;
    fn run(&self, request: &RunRequest, timeout: Duration) -> Result<Invocation>;
    fn remove_image(&self, tag: &str) -> Result<()>;
}

/// Runtime that shells out to `docker` (or a compatible CLI).
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    bin: String,
    output_limit_bytes: usize,
}

impl DockerRuntime {
    pub fn new(bin: impl Into<String>, output_limit_bytes: usize) -> Self {
        Self {
            bin: bin.into(),
            output_limit_bytes,
        }
    }

    fn invoke(&self, args: &[String], timeout: Duration) -> Result<Invocation> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run {} {}", self.bin, args.first().map_or("", String::as_str)))?;
        if output.timed_out {
            warn!(
                timeout_secs = timeout.as_secs(),
                subcommand = args.first().map(String::as_str),
                "container command timed out"
            );
            return Ok(Invocation::timed_out(timeout));
        }
        Ok(Invocation::finished(output.exit_code(), output.combined()))
    }

    /// Killing the CLI client leaves the container running; remove it by name.
    fn remove_container(&self, name: &str) {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        match self.invoke(&args, CLEANUP_TIMEOUT) {
            Ok(invocation) if invocation.success() => debug!(container = name, "container removed"),
            Ok(invocation) => warn!(
                container = name,
                exit_code = invocation.exit_code,
                output = invocation.output.trim(),
                "container removal failed"
            ),
            Err(err) => warn!(container = name, err = %format!("{err:#}"), "container removal failed"),
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    #[instrument(skip_all, fields(tag = %tag, timeout_secs = timeout.as_secs()))]
    fn build(&self, context_dir: &Path, tag: &str, timeout: Duration) -> Result<Invocation> {
        info!(context = %context_dir.display(), "building image");
        let args = build_args(context_dir, tag);
        let invocation = self.invoke(&args, timeout)?;
        debug!(exit_code = invocation.exit_code, "build finished");
        Ok(invocation)
    }

    #[instrument(skip_all, fields(image = %request.image, timeout_secs = timeout.as_secs()))]
    fn run(&self, request: &RunRequest, timeout: Duration) -> Result<Invocation> {
        let name = format!("rdloop-run-{}", short_id(12));
        let invocation = self.invoke(&run_args(request, &name), timeout)?;
        if invocation.timed_out {
            self.remove_container(&name);
        }
        debug!(exit_code = invocation.exit_code, "run finished");
        Ok(invocation)
    }

    fn remove_image(&self, tag: &str) -> Result<()> {
        let args = vec!["rmi".to_string(), "-f".to_string(), tag.to_string()];
        let invocation = self.invoke(&args, CLEANUP_TIMEOUT)?;
        if !invocation.success() {
            return Err(anyhow!(
                "remove image {tag} failed (exit {}): {}",
                invocation.exit_code,
                invocation.output.trim()
            ));
        }
        Ok(())
    }
}

pub fn build_args(context_dir: &Path, tag: &str) -> Vec<String> {
    vec![
        "build".to_string(),
        "-t".to_string(),
        tag.to_string(),
        context_dir.display().to_string(),
    ]
}

/// `docker run` arguments for `request`, naming the container `name`.
pub fn run_args(request: &RunRequest, name: &str) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    if request.tty {
        args.push("-t".to_string());
    }
    args.push("--rm".to_string());
    args.push("--name".to_string());
    args.push(name.to_string());
    for mount in &request.mounts {
        let mut volume = format!("{}:{}", mount.host.display(), mount.target);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }
    args.push(request.image.clone());
    args.extend(request.args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_place_mounts_before_image() {
        let request = RunRequest {
            image: "yashalabinc/fherma-validator".to_string(),
            mounts: vec![Mount {
                host: PathBuf::from("/ws/relu"),
                target: "/fherma".to_string(),
                read_only: false,
            }],
            args: vec!["--project-folder=/fherma/app_build".to_string()],
            tty: true,
        };
        assert_eq!(
            run_args(&request, "rdloop-run-1"),
            vec![
                "run",
                "-t",
                "--rm",
                "--name",
                "rdloop-run-1",
                "-v",
                "/ws/relu:/fherma",
                "yashalabinc/fherma-validator",
                "--project-folder=/fherma/app_build",
            ]
        );
    }

    #[test]
    fn read_only_mounts_are_marked() {
        let request = RunRequest {
            image: "rdloop-relu-abc".to_string(),
            mounts: vec![Mount {
                host: PathBuf::from("/c/tests/case1"),
                target: "/data".to_string(),
                read_only: true,
            }],
            args: Vec::new(),
            tty: false,
        };
        let args = run_args(&request, "rdloop-run-2");
        assert!(args.contains(&"/c/tests/case1:/data:ro".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("rdloop-relu-abc"));
    }

    #[test]
    fn timed_out_invocation_is_failure() {
        let invocation = Invocation::timed_out(Duration::from_secs(600));
        assert!(!invocation.success());
        assert_eq!(invocation.exit_code, 1);
        assert_eq!(invocation.output, "command timed out after 600s");
    }

    #[cfg(unix)]
    #[test]
    fn missing_binary_is_error() {
        let runtime = DockerRuntime::new("/nonexistent/docker", 1000);
        let err = runtime
            .build(Path::new("."), "tag", Duration::from_secs(1))
            .unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }

    /// Fake CLI that logs its arguments and hangs when asked to run a
    /// `hang` image.
    #[cfg(unix)]
    fn logging_cli(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let bin = dir.join("fake-docker");
        let script = format!(
            "#!/bin/sh\necho \"$*\" >> '{}'\nif [ \"$1\" = run ] && [ \"$5\" = hang ]; then exec sleep 5; fi\n",
            log.display()
        );
        std::fs::write(&bin, script).expect("write script");
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        (bin, log)
    }

    #[cfg(unix)]
    fn request_for(image: &str) -> RunRequest {
        RunRequest {
            image: image.to_string(),
            mounts: Vec::new(),
            args: Vec::new(),
            tty: false,
        }
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_run_removes_its_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (bin, log) = logging_cli(temp.path());
        let runtime = DockerRuntime::new(bin.display().to_string(), 1000);

        let invocation = runtime
            .run(&request_for("hang"), Duration::from_millis(200))
            .expect("run");

        assert!(invocation.timed_out);
        let calls = std::fs::read_to_string(&log).expect("read log");
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2, "calls: {calls}");
        let name = lines[0]
            .strip_prefix("run --rm --name ")
            .and_then(|rest| rest.split_whitespace().next())
            .expect("container name");
        assert!(name.starts_with("rdloop-run-"));
        assert_eq!(lines[1], format!("rm -f {name}"));
    }

    #[cfg(unix)]
    #[test]
    fn finished_run_is_not_force_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (bin, log) = logging_cli(temp.path());
        let runtime = DockerRuntime::new(bin.display().to_string(), 1000);

        let invocation = runtime
            .run(&request_for("rdloop-relu-abc"), Duration::from_secs(10))
            .expect("run");

        assert!(invocation.success());
        let calls = std::fs::read_to_string(&log).expect("read log");
        assert_eq!(calls.lines().count(), 1, "calls: {calls}");
        assert!(calls.ends_with(" rdloop-relu-abc\n"));
    }
}
