//! Test doubles for the generator and container runtime, plus on-disk
//! challenge fixtures.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::container::{ContainerRuntime, Invocation, RunRequest};
use crate::io::generator::Generator;

pub const SOLUTION_TEMPLATE: &str = r#"#include "yourSolution.h"

void CKKSTaskSolver::eval() {
    // TODO: implement
}
"#;

pub const HEADER_TEMPLATE: &str = r#"#pragma once
#include "openfhe.h"

using namespace lbcrypto;

class CKKSTaskSolver {
public:
    void eval();

private:
    CryptoContext<DCRTPoly> m_cc;
    PublicKey<DCRTPoly> m_PublicKey;
    Ciphertext<DCRTPoly> m_InputC;
    Ciphertext<DCRTPoly> m_OutputC;
};
"#;

/// Generator that replays canned responses in order and records prompts.
/// Fails once the responses run out.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// `(system, user)` pairs seen so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, system: &str, user: &str) -> Result<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((system.to_string(), user.to_string()));
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted generator exhausted"))
    }
}

/// A call observed by [`ScriptedRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Build { context: PathBuf, tag: String },
    Run(RunRequest),
    RemoveImage(String),
}

/// Scripted reply to one runtime call.
#[derive(Debug, Clone)]
pub enum Reply {
    Done(Invocation),
    /// Also write `contents` to `relative` under the first mount.
    Writes {
        invocation: Invocation,
        relative: PathBuf,
        contents: String,
    },
    /// The call itself fails, as if the runtime binary were missing.
    Fails(String),
}

/// Container runtime replaying queued replies. Calls beyond the queue
/// succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    builds: Mutex<VecDeque<Reply>>,
    runs: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<RuntimeCall>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_build(&self, reply: Reply) -> &Self {
        lock(&self.builds).push_back(reply);
        self
    }

    pub fn push_run(&self, reply: Reply) -> &Self {
        lock(&self.runs).push_back(reply);
        self
    }

    /// Successful run printing `output`.
    pub fn push_run_output(&self, output: &str) -> &Self {
        self.push_run(Reply::Done(Invocation::finished(0, output)))
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Run(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::RemoveImage(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn build(&self, context_dir: &Path, tag: &str, _timeout: Duration) -> Result<Invocation> {
        lock(&self.calls).push(RuntimeCall::Build {
            context: context_dir.to_path_buf(),
            tag: tag.to_string(),
        });
        let reply = lock(&self.builds).pop_front();
        replay(reply, Some(context_dir))
    }

    fn run(&self, request: &RunRequest, _timeout: Duration) -> Result<Invocation> {
        lock(&self.calls).push(RuntimeCall::Run(request.clone()));
        let reply = lock(&self.runs).pop_front();
        replay(reply, request.mounts.first().map(|m| m.host.as_path()))
    }

    fn remove_image(&self, tag: &str) -> Result<()> {
        lock(&self.calls).push(RuntimeCall::RemoveImage(tag.to_string()));
        Ok(())
    }
}

fn replay(reply: Option<Reply>, host: Option<&Path>) -> Result<Invocation> {
    match reply {
        None => Ok(Invocation::finished(0, "")),
        Some(Reply::Done(invocation)) => Ok(invocation),
        Some(Reply::Writes {
            invocation,
            relative,
            contents,
        }) => {
            let host = host.ok_or_else(|| anyhow!("scripted write without a mount"))?;
            let path = host.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
            Ok(invocation)
        }
        Some(Reply::Fails(message)) => Err(anyhow!(message)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Challenge directory in a temp dir, named `name`.
#[derive(Debug)]
pub struct ChallengeFixture {
    _temp: TempDir,
    root: PathBuf,
}

impl ChallengeFixture {
    /// Challenge with its own Dockerfile and one fixture, `tests/case1`.
    pub fn self_contained(name: &str) -> Result<Self> {
        let fixture = Self::with_description(
            name,
            &format!("# {name}\n\nChallenge type: Black Box\n\nApproximate {name} on encrypted input.\n"),
        )?;
        fixture.write("Dockerfile", "FROM openfhe-base\nCOPY . /app\nRUN make -C /app\n")?;
        fixture.add_fixture("case1")?;
        Ok(fixture)
    }

    /// Challenge scored by the validator image against `tests/test_case.json`.
    pub fn externally_validated(name: &str) -> Result<Self> {
        let fixture = Self::with_description(
            name,
            &format!("# {name}\n\nChallenge type: White Box\n\nEvaluate {name} homomorphically.\n"),
        )?;
        fixture.write(
            "tests/test_case.json",
            "{\"testcases\": [{\"error_threshold\": 0.01}]}\n",
        )?;
        Ok(fixture)
    }

    fn with_description(name: &str, description: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = temp.path().join(name);
        let fixture = Self { _temp: temp, root };
        fixture.write("challenge.md", description)?;
        fixture.write("templates/openfhe/yourSolution.cpp", SOLUTION_TEMPLATE)?;
        fixture.write("templates/openfhe/yourSolution.h", HEADER_TEMPLATE)?;
        Ok(fixture)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write `contents` to `relative` inside the challenge directory.
    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Add a fixture directory `tests/<name>` with an input file.
    pub fn add_fixture(&self, name: &str) -> Result<PathBuf> {
        self.write(&format!("tests/{name}/input.txt"), "0.5 -0.5 1.0\n")?;
        Ok(self.root.join("tests").join(name))
    }

    pub fn remove_fixtures(&self) -> Result<()> {
        let dir = self.root.join("tests");
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        Ok(())
    }
}
