//! Build and score one attempt inside containers.
//!
//! [`execute`] never returns an error: build failures, run failures,
//! timeouts, missing fixtures and runtime spawn failures are all encoded in
//! the returned [`RunOutcome`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::accuracy::{
    FailureKind, ValidatorReport, classify_validator_failure, parse_fixture_accuracy,
    parse_output_accuracy,
};
use crate::core::text::tail_chars;
use crate::core::types::{Attempt, ChallengeVariant, RunOutcome};
use crate::io::challenge::{Challenge, FIXTURES_DIR};
use crate::io::config::SandboxConfig;
use crate::io::container::{ContainerRuntime, Invocation, Mount, RunRequest};
use crate::io::workspace::{
    Workspace, copy_files_no_overwrite, replace_dir_link, short_id, write_files,
    write_files_no_overwrite,
};

const BUILD_ERROR_TAIL_CHARS: usize = 3000;
const FIXTURE_ERROR_TAIL_CHARS: usize = 800;
const RESULT_FILE: &str = "result.json";

/// Materialize `attempt` in `workspace`, then build and score it the way the
/// challenge variant prescribes.
#[instrument(skip_all, fields(loop_idx = attempt.loop_idx, variant = challenge.variant.as_str()))]
pub fn execute<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    workspace: &Workspace,
    challenge: &Challenge,
    attempt: &Attempt,
    config: &SandboxConfig,
) -> RunOutcome {
    let outcome = match challenge.variant {
        ChallengeVariant::SelfContained => {
            execute_self_contained(runtime, workspace, challenge, attempt, config)
        }
        ChallengeVariant::ExternallyValidated => {
            execute_externally_validated(runtime, workspace, challenge, attempt, config)
        }
    };
    info!(
        build_succeeded = outcome.build_succeeded,
        run_succeeded = outcome.run_succeeded,
        accuracy = ?outcome.accuracy,
        "sandbox finished"
    );
    outcome
}

/// Image tag `<prefix>-<challenge>-<random8>`, restricted to characters
/// container registries accept.
pub fn image_tag(prefix: &str, challenge: &str) -> String {
    let sanitize = |raw: &str| -> String {
        raw.to_lowercase()
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                    ch
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!("{}-{}-{}", sanitize(prefix), sanitize(challenge), short_id(8))
}

fn execute_self_contained<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    workspace: &Workspace,
    challenge: &Challenge,
    attempt: &Attempt,
    config: &SandboxConfig,
) -> RunOutcome {
    if let Err(err) = materialize_self_contained(workspace, challenge, attempt, config) {
        warn!(err = %format!("{err:#}"), "workspace setup failed");
        return RunOutcome::build_failure(String::new(), format!("workspace setup failed: {err:#}"));
    }

    let tag = image_tag(&config.image_prefix, &challenge.name);
    info!(tag = %tag, "building candidate image");
    let build = absorb(
        runtime.build(&workspace.root, &tag, config.build_timeout()),
        "container build",
    );
    if !build.success() {
        warn!(tag = %tag, exit_code = build.exit_code, timed_out = build.timed_out, "build failed");
        let error_text = format!(
            "container build failed (exit {}):\n{}",
            build.exit_code,
            tail_chars(&build.output, BUILD_ERROR_TAIL_CHARS)
        );
        return RunOutcome::build_failure(build.output, error_text);
    }

    let fixtures_dir = challenge.fixtures_dir();
    let fixtures = list_fixtures(&fixtures_dir);
    if fixtures.is_empty() {
        warn!(dir = %fixtures_dir.display(), "no fixtures to run");
        remove_image(runtime, &tag);
        return RunOutcome {
            build_succeeded: true,
            run_succeeded: false,
            accuracy: None,
            combined_output: build.output,
            error_text: format!("no fixture directories found in {}", fixtures_dir.display()),
        };
    }

    let mut run_succeeded = true;
    let mut accuracy_sum = 0.0;
    let mut outputs = Vec::with_capacity(fixtures.len());
    let mut errors = Vec::new();
    for fixture in &fixtures {
        let name = fixture
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(fixture = %name, "running fixture");
        let request = RunRequest {
            image: tag.clone(),
            mounts: vec![Mount {
                host: fixture.clone(),
                target: config.fixture_mount.clone(),
                read_only: true,
            }],
            args: Vec::new(),
            tty: false,
        };
        let run = absorb(runtime.run(&request, config.run_timeout()), "container run");
        if run.success() {
            match parse_fixture_accuracy(&run.output) {
                Some(accuracy) => accuracy_sum += accuracy,
                None => warn!(fixture = %name, "fixture output has no accuracy"),
            }
        } else {
            run_succeeded = false;
            errors.push(format!(
                "fixture {name} failed (exit {}):\n{}",
                run.exit_code,
                tail_chars(&run.output, FIXTURE_ERROR_TAIL_CHARS)
            ));
        }
        outputs.push(format!("=== {name} ===\n{}", run.output));
    }
    remove_image(runtime, &tag);

    // Failed and unparsable fixtures count toward the denominator.
    let accuracy = Some(accuracy_sum / fixtures.len() as f64);
    RunOutcome {
        build_succeeded: true,
        run_succeeded,
        accuracy,
        combined_output: outputs.join("\n\n"),
        error_text: errors.join("\n"),
    }
}

fn materialize_self_contained(
    workspace: &Workspace,
    challenge: &Challenge,
    attempt: &Attempt,
    config: &SandboxConfig,
) -> Result<()> {
    copy_files_no_overwrite(&challenge.root, &workspace.root)?;
    let template_dir = workspace.root.join(&config.template_subdir);
    write_files_no_overwrite(&template_dir, &challenge.templates)?;
    write_files(&template_dir, &attempt.files)
}

fn execute_externally_validated<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    workspace: &Workspace,
    challenge: &Challenge,
    attempt: &Attempt,
    config: &SandboxConfig,
) -> RunOutcome {
    let build_dir = workspace.root.join(&config.build_dir);
    if let Err(err) = materialize_externally_validated(workspace, &build_dir, challenge, attempt) {
        warn!(err = %format!("{err:#}"), "workspace setup failed");
        return RunOutcome::build_failure(String::new(), format!("workspace setup failed: {err:#}"));
    }

    let mount = config.workspace_mount.trim_end_matches('/');
    let request = RunRequest {
        image: config.validator_image.clone(),
        mounts: vec![Mount {
            host: workspace.root.clone(),
            target: config.workspace_mount.clone(),
            read_only: false,
        }],
        args: vec![
            format!("--project-folder={mount}/{}", config.build_dir),
            format!("--testcase={mount}/{FIXTURES_DIR}/{}", config.testcase_file),
        ],
        tty: true,
    };
    info!(image = %request.image, "running validator");
    let run = absorb(runtime.run(&request, config.run_timeout()), "validator run");

    if !run.success() {
        let tail = tail_chars(&run.output, BUILD_ERROR_TAIL_CHARS);
        let kind = classify_validator_failure(&run.output);
        warn!(exit_code = run.exit_code, ?kind, "validator failed");
        let (build_succeeded, error_text) = match kind {
            FailureKind::Build => (
                false,
                format!("validator build failed (exit {}):\n{tail}", run.exit_code),
            ),
            FailureKind::Runtime => (
                true,
                format!("validator run failed (exit {}):\n{tail}", run.exit_code),
            ),
        };
        return RunOutcome {
            build_succeeded,
            run_succeeded: false,
            accuracy: None,
            combined_output: run.output,
            error_text,
        };
    }

    let result_path = build_dir.join(RESULT_FILE);
    let accuracy = if result_path.is_file() {
        read_validator_accuracy(&result_path).unwrap_or_else(|err| {
            warn!(path = %result_path.display(), err = %format!("{err:#}"), "unreadable validator result");
            None
        })
    } else {
        debug!("no validator result file, scanning output");
        parse_output_accuracy(&run.output)
    };
    RunOutcome {
        build_succeeded: true,
        run_succeeded: true,
        accuracy,
        combined_output: run.output,
        error_text: String::new(),
    }
}

fn materialize_externally_validated(
    workspace: &Workspace,
    build_dir: &Path,
    challenge: &Challenge,
    attempt: &Attempt,
) -> Result<()> {
    write_files(build_dir, &challenge.templates)?;
    write_files(build_dir, &attempt.files)?;
    let fixtures_dir = challenge.fixtures_dir();
    replace_dir_link(&workspace.root.join(FIXTURES_DIR), &fixtures_dir)
        .with_context(|| format!("link fixtures {}", fixtures_dir.display()))
}

fn read_validator_accuracy(path: &Path) -> Result<Option<f64>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    ValidatorReport::parse(&contents)?.slot_accuracy()
}

/// Fixture directories under `dir`, sorted by name. A missing or unreadable
/// directory yields none.
fn list_fixtures(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut fixtures: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    fixtures.sort();
    fixtures
}

/// Turn a runtime invocation error into a failed invocation.
fn absorb(result: Result<Invocation>, what: &str) -> Invocation {
    result.unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "{what} could not be started");
        Invocation::finished(1, format!("{what} could not be started: {err:#}"))
    })
}

fn remove_image<R: ContainerRuntime + ?Sized>(runtime: &R, tag: &str) {
    if let Err(err) = runtime.remove_image(tag) {
        warn!(tag, err = %format!("{err:#}"), "image removal failed");
    }
}
