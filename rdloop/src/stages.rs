//! Propose and implement stages.
//!
//! Both stages call the generator. Implement turns its output into a patched
//! solution file, or rejects the attempt with a [`CoderError`] that the loop
//! records instead of executing.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{BlockExtractor, json_block};
use crate::core::patch::{BodyPatcher, PatchError};
use crate::core::trace::HistoryTrace;
use crate::core::types::{Attempt, ChallengeVariant};
use crate::io::challenge::Challenge;
use crate::io::config::LoopConfig;
use crate::io::generator::Generator;
use crate::io::prompt::{CodePromptInputs, PROPOSE_SYSTEM, PromptEngine, code_system};

pub const CONFIG_FILE: &str = "config.json";

/// Reasons an attempt is rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoderError {
    #[error("algorithm plan is empty")]
    EmptyPlan,
    #[error("no {0} template found in challenge")]
    MissingTemplate(String),
    #[error("generation output contained no ```{0} code block")]
    MissingCodeBlock(String),
    #[error("code injection failed: {0}")]
    Patch(#[from] PatchError),
}

/// Result of the implement stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ImplementOutcome {
    /// The attempt with its patch and generated files filled in.
    Coded(Attempt),
    /// Execute is skipped and the attempt is judged as failed.
    Rejected(CoderError),
}

/// Prompt rendering, extraction and patching for one challenge.
pub struct Stages<'a> {
    challenge: &'a Challenge,
    config: &'a LoopConfig,
    prompts: PromptEngine,
    patcher: BodyPatcher,
    extractor: BlockExtractor,
}

impl<'a> Stages<'a> {
    pub fn new(challenge: &'a Challenge, config: &'a LoopConfig) -> Self {
        Self {
            challenge,
            config,
            prompts: PromptEngine::new(),
            patcher: BodyPatcher::new(&config.patch.method),
            extractor: BlockExtractor::new(&config.patch.code_fence, &config.patch.marker_vocabulary),
        }
    }

    /// Ask for an algorithm plan informed by recent history.
    #[instrument(skip_all, fields(loop_idx = loop_idx))]
    pub fn propose<G: Generator + ?Sized>(
        &self,
        generator: &G,
        loop_idx: u32,
        trace: &HistoryTrace,
    ) -> anyhow::Result<Attempt> {
        let prompt =
            self.prompts
                .render_propose(self.challenge, trace, self.config.history_window)?;
        let plan = generator.generate(PROPOSE_SYSTEM, &prompt)?;
        info!(plan_chars = plan.chars().count(), "plan proposed");
        Ok(Attempt::new(loop_idx, plan.trim()))
    }

    /// Generate the method body for `attempt.plan` and patch it into the
    /// solution template.
    ///
    /// Generation failures are errors; everything attributable to the plan,
    /// the template or the generated text is a [`ImplementOutcome::Rejected`].
    #[instrument(skip_all, fields(loop_idx = attempt.loop_idx))]
    pub fn implement<G: Generator + ?Sized>(
        &self,
        generator: &G,
        attempt: &Attempt,
        trace: &HistoryTrace,
    ) -> anyhow::Result<ImplementOutcome> {
        let patch = &self.config.patch;
        if attempt.plan.trim().is_empty() {
            return Ok(reject(CoderError::EmptyPlan));
        }
        let Some(template) = self
            .challenge
            .templates
            .get(&patch.solution_file)
            .filter(|t| !t.trim().is_empty())
        else {
            return Ok(reject(CoderError::MissingTemplate(
                patch.solution_file.clone(),
            )));
        };

        let prompt = self.prompts.render_code(
            self.challenge,
            trace,
            &CodePromptInputs {
                plan: &attempt.plan,
                solution_file: &patch.solution_file,
                method: &patch.method,
                fence: self.extractor.kind(),
            },
        )?;
        let response = generator.generate(&code_system(&patch.method), &prompt)?;

        let Some(code) = self.extractor.extract(&response) else {
            return Ok(reject(CoderError::MissingCodeBlock(
                self.extractor.kind().to_string(),
            )));
        };
        let body = self.patcher.strip_wrapper(&code);
        let patched = match self.patcher.inject_body(template, &format!("\n{body}\n")) {
            Ok(patched) => patched,
            Err(err) => return Ok(reject(err.into())),
        };

        let mut coded = attempt.clone();
        coded.inject_file(patch.solution_file.clone(), patched);
        if self.challenge.variant == ChallengeVariant::ExternallyValidated {
            match json_block(&response) {
                Some(Ok(config)) => {
                    debug!("generated {CONFIG_FILE} accepted");
                    coded.inject_file(CONFIG_FILE, config);
                }
                Some(Err(err)) => warn!(err = %err, "ignoring unparsable json block"),
                None => {}
            }
        }
        info!(body_lines = body.lines().count(), "body injected");
        coded.patch = Some(body);
        Ok(ImplementOutcome::Coded(coded))
    }
}

fn reject(err: CoderError) -> ImplementOutcome {
    warn!(err = %err, "implementation rejected");
    ImplementOutcome::Rejected(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ChallengeFixture, ScriptedGenerator};

    fn load(fixture: &ChallengeFixture, config: &LoopConfig) -> Challenge {
        Challenge::load(fixture.path(), config).expect("load")
    }

    #[test]
    fn propose_trims_plan() {
        let fixture = ChallengeFixture::self_contained("relu").expect("fixture");
        let config = LoopConfig::default();
        let challenge = load(&fixture, &config);
        let generator = ScriptedGenerator::new(["  use a degree-3 polynomial  \n"]);
        let attempt = Stages::new(&challenge, &config)
            .propose(&generator, 2, &HistoryTrace::new())
            .expect("propose");
        assert_eq!(attempt.loop_idx, 2);
        assert_eq!(attempt.plan, "use a degree-3 polynomial");
        assert!(generator.prompts()[0].0.contains("OpenFHE"));
    }

    #[test]
    fn implement_patches_solution_file() {
        let fixture = ChallengeFixture::self_contained("relu").expect("fixture");
        let config = LoopConfig::default();
        let challenge = load(&fixture, &config);
        let generator = ScriptedGenerator::new([
            "Here you go:\n```cpp\nvoid CKKSTaskSolver::eval() {\n    m_OutputC = m_cc->EvalMult(m_InputC, m_InputC);\n}\n```",
        ]);
        let outcome = Stages::new(&challenge, &config)
            .implement(&generator, &Attempt::new(0, "square"), &HistoryTrace::new())
            .expect("implement");
        let ImplementOutcome::Coded(attempt) = outcome else {
            panic!("expected coded attempt");
        };
        assert_eq!(
            attempt.patch.as_deref(),
            Some("m_OutputC = m_cc->EvalMult(m_InputC, m_InputC);")
        );
        let solution = &attempt.files["yourSolution.cpp"];
        assert!(solution.contains(
            "void CKKSTaskSolver::eval() {\nm_OutputC = m_cc->EvalMult(m_InputC, m_InputC);\n}"
        ));
        assert!(!attempt.files.contains_key(CONFIG_FILE));
    }

    #[test]
    fn missing_code_block_is_rejected() {
        let fixture = ChallengeFixture::self_contained("relu").expect("fixture");
        let config = LoopConfig::default();
        let challenge = load(&fixture, &config);
        let generator = ScriptedGenerator::new(["I would square the input."]);
        let outcome = Stages::new(&challenge, &config)
            .implement(&generator, &Attempt::new(0, "square"), &HistoryTrace::new())
            .expect("implement");
        assert_eq!(
            outcome,
            ImplementOutcome::Rejected(CoderError::MissingCodeBlock("cpp".to_string()))
        );
    }

    #[test]
    fn empty_plan_is_rejected_without_generation() {
        let fixture = ChallengeFixture::self_contained("relu").expect("fixture");
        let config = LoopConfig::default();
        let challenge = load(&fixture, &config);
        let generator = ScriptedGenerator::new(Vec::<String>::new());
        let outcome = Stages::new(&challenge, &config)
            .implement(&generator, &Attempt::new(0, "   "), &HistoryTrace::new())
            .expect("implement");
        assert_eq!(outcome, ImplementOutcome::Rejected(CoderError::EmptyPlan));
        assert!(generator.prompts().is_empty());
    }

    #[test]
    fn missing_template_is_rejected() {
        let fixture = ChallengeFixture::self_contained("relu").expect("fixture");
        let mut config = LoopConfig::default();
        config.patch.solution_file = "solution.cpp".to_string();
        let challenge = load(&fixture, &config);
        let generator = ScriptedGenerator::new(["```cpp\nx;\n```"]);
        let outcome = Stages::new(&challenge, &config)
            .implement(&generator, &Attempt::new(0, "plan"), &HistoryTrace::new())
            .expect("implement");
        assert_eq!(
            outcome,
            ImplementOutcome::Rejected(CoderError::MissingTemplate("solution.cpp".to_string()))
        );
    }

    #[test]
    fn externally_validated_accepts_config_block() {
        let fixture = ChallengeFixture::externally_validated("sign").expect("fixture");
        let config = LoopConfig::default();
        let challenge = load(&fixture, &config);
        let generator = ScriptedGenerator::new([
            "```cpp\nm_OutputC = m_InputC;\n```\n```json\n{\"indexes\": [1]}\n```",
        ]);
        let outcome = Stages::new(&challenge, &config)
            .implement(&generator, &Attempt::new(0, "identity"), &HistoryTrace::new())
            .expect("implement");
        let ImplementOutcome::Coded(attempt) = outcome else {
            panic!("expected coded attempt");
        };
        assert_eq!(attempt.files[CONFIG_FILE], "{\n  \"indexes\": [\n    1\n  ]\n}");
    }

    #[test]
    fn generation_failure_is_error() {
        let fixture = ChallengeFixture::self_contained("relu").expect("fixture");
        let config = LoopConfig::default();
        let challenge = load(&fixture, &config);
        let generator = ScriptedGenerator::new(Vec::<String>::new());
        let result = Stages::new(&challenge, &config).implement(
            &generator,
            &Attempt::new(0, "plan"),
            &HistoryTrace::new(),
        );
        assert!(result.is_err());
    }
}
