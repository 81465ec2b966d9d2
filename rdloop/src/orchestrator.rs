//! Five-stage experiment loop: propose, implement, execute, judge, record.
//!
//! Iterations run on scoped threads behind a [`Throttle`]. Every completed
//! stage is written to the event log and checkpointed, so a session can be
//! resumed from any stage boundary.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::judge::judge;
use crate::core::trace::HistoryTrace;
use crate::core::types::{Attempt, Decision, IterationState, Stage};
use crate::io::challenge::{Challenge, Identifiers};
use crate::io::checkpoint::{
    Checkpoint, RunCounters, checkout, load_checkpoint, write_checkpoint,
};
use crate::io::config::LoopConfig;
use crate::io::container::ContainerRuntime;
use crate::io::event_log::EventLog;
use crate::io::generator::Generator;
use crate::io::workspace::create_workspace;
use crate::sandbox;
use crate::stages::{ImplementOutcome, Stages};
use crate::throttle::Throttle;

/// Per-invocation stopping rules on top of `max_loops`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    /// Iterations to start in this invocation, never past `max_loops`.
    pub loop_n: Option<u32>,
    /// Stages to run in this invocation before stopping.
    pub step_n: Option<u64>,
}

/// What a finished invocation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Trace length, including entries restored from a checkpoint.
    pub recorded: usize,
    pub passes: usize,
    pub best_accuracy: Option<f64>,
    /// Stages run by this invocation.
    pub stages_run: u64,
    /// True when `step_n` ran out before the loop budget.
    pub step_limited: bool,
}

impl RunSummary {
    pub fn solved(&self) -> bool {
        self.passes > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationEnd {
    Recorded,
    StepLimited,
}

#[derive(Serialize)]
struct ChallengeEvent<'a> {
    name: &'a str,
    variant: &'a str,
    fingerprint: &'a str,
    templates: Vec<&'a str>,
    identifiers: &'a Identifiers,
}

#[derive(Serialize)]
struct RejectedEvent<'a> {
    error: &'a str,
}

#[derive(Serialize)]
struct RecordEvent<'a> {
    index: usize,
    attempt: &'a Attempt,
    decision: &'a Decision,
    best_accuracy: Option<f64>,
    passes: usize,
    trace: &'a HistoryTrace,
}

#[derive(Serialize)]
struct ResumeEvent<'a> {
    checkpoint: &'a str,
    loop_idx: u32,
    stage: Stage,
}

/// Drives iterations for one challenge.
pub struct Orchestrator<'a, G: ?Sized, R: ?Sized> {
    config: &'a LoopConfig,
    challenge: &'a Challenge,
    generator: &'a G,
    runtime: &'a R,
    stages: Stages<'a>,
    events: EventLog,
    throttle: Throttle,
    trace: Mutex<HistoryTrace>,
    loops_started: AtomicU32,
    session_stages: AtomicU64,
    stages_run: AtomicU64,
    step_limit: Option<u64>,
    halted: AtomicBool,
    step_limited: AtomicBool,
}

impl<'a, G, R> Orchestrator<'a, G, R>
where
    G: Generator + ?Sized,
    R: ContainerRuntime + ?Sized,
{
    pub fn new(
        config: &'a LoopConfig,
        challenge: &'a Challenge,
        generator: &'a G,
        runtime: &'a R,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            challenge,
            generator,
            runtime,
            stages: Stages::new(challenge, config),
            events: EventLog::open(&config.session_dir)?,
            throttle: Throttle::new(config.max_parallel),
            trace: Mutex::new(HistoryTrace::new()),
            loops_started: AtomicU32::new(0),
            session_stages: AtomicU64::new(0),
            stages_run: AtomicU64::new(0),
            step_limit: None,
            halted: AtomicBool::new(false),
            step_limited: AtomicBool::new(false),
        })
    }

    /// Run a fresh session from loop 0.
    #[instrument(skip_all, fields(challenge = %self.challenge.name))]
    pub fn run(mut self, limits: RunLimits) -> Result<RunSummary> {
        self.step_limit = limits.step_n;
        self.record_session_start()?;
        let end = limits
            .loop_n
            .map_or(self.config.max_loops, |n| n.min(self.config.max_loops));
        info!(loops = end, max_parallel = self.config.max_parallel, "starting session");
        self.drive(None, 0, end)
    }

    /// Continue a session from a checkpoint: finish the checkpointed
    /// iteration from its next stage, then start new iterations.
    #[instrument(skip_all, fields(challenge = %self.challenge.name, loop_idx = checkpoint.loop_idx, stage = %checkpoint.stage))]
    pub fn resume(mut self, checkpoint: Checkpoint, limits: RunLimits) -> Result<RunSummary> {
        self.step_limit = limits.step_n;
        self.trace = Mutex::new(checkpoint.trace);
        self.session_stages = AtomicU64::new(checkpoint.counters.stages_run);
        let first = checkpoint
            .counters
            .loops_started
            .max(checkpoint.loop_idx + 1);
        self.loops_started = AtomicU32::new(first);
        let end = limits.loop_n.map_or(self.config.max_loops, |n| {
            first.saturating_add(n).min(self.config.max_loops)
        });
        self.events.record_run(
            "resume",
            &ResumeEvent {
                checkpoint: &format!("{}/{}", checkpoint.loop_idx, checkpoint.stage),
                loop_idx: checkpoint.loop_idx,
                stage: checkpoint.stage,
            },
        )?;
        info!(next_loop = first, end, "resuming session");
        let pending = following(checkpoint.stage, &checkpoint.iteration)
            .map(|stage| (checkpoint.loop_idx, checkpoint.iteration, stage));
        self.drive(pending, first, end)
    }

    fn record_session_start(&self) -> Result<()> {
        self.events.record_run("settings", self.config)?;
        self.events.record_run(
            "challenge",
            &ChallengeEvent {
                name: &self.challenge.name,
                variant: self.challenge.variant.as_str(),
                fingerprint: &self.challenge.fingerprint,
                templates: self.challenge.templates.keys().map(String::as_str).collect(),
                identifiers: &self.challenge.identifiers,
            },
        )
    }

    fn drive(
        &self,
        pending: Option<(u32, IterationState, Stage)>,
        first_loop: u32,
        end_loop: u32,
    ) -> Result<RunSummary> {
        let results: Vec<(u32, Result<IterationEnd>)> = thread::scope(|scope| {
            let mut handles = Vec::new();
            if let Some((loop_idx, state, stage)) = pending {
                let permit = self.throttle.acquire();
                handles.push((
                    loop_idx,
                    scope.spawn(move || {
                        let _permit = permit;
                        self.iteration(loop_idx, Some(state), stage)
                    }),
                ));
            }
            for loop_idx in first_loop..end_loop {
                let permit = self.throttle.acquire();
                if self.halted.load(Ordering::SeqCst) {
                    break;
                }
                self.loops_started.fetch_max(loop_idx + 1, Ordering::SeqCst);
                handles.push((
                    loop_idx,
                    scope.spawn(move || {
                        let _permit = permit;
                        self.iteration(loop_idx, None, Stage::Propose)
                    }),
                ));
            }
            handles
                .into_iter()
                .map(|(loop_idx, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("iteration thread panicked")));
                    (loop_idx, result)
                })
                .collect()
        });

        let mut first_error = None;
        for (loop_idx, result) in results {
            match result {
                Ok(IterationEnd::Recorded) => {}
                Ok(IterationEnd::StepLimited) => debug!(loop_idx, "iteration left unfinished"),
                Err(err) => {
                    error!(loop_idx, err = %format!("{err:#}"), "iteration aborted");
                    first_error.get_or_insert(err.context(format!("loop {loop_idx} aborted")));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let trace = self.trace_snapshot();
        let summary = RunSummary {
            recorded: trace.len(),
            passes: trace.pass_count(),
            best_accuracy: trace.best_so_far().and_then(|entry| entry.attempt.accuracy()),
            stages_run: self.stages_run.load(Ordering::SeqCst),
            step_limited: self.step_limited.load(Ordering::SeqCst),
        };
        info!(
            recorded = summary.recorded,
            passes = summary.passes,
            best_accuracy = ?summary.best_accuracy,
            "session finished"
        );
        Ok(summary)
    }

    /// Run one iteration from `from` through record.
    ///
    /// Any error aborts the iteration without a trace entry and stops new
    /// iterations from starting.
    fn iteration(
        &self,
        loop_idx: u32,
        state: Option<IterationState>,
        from: Stage,
    ) -> Result<IterationEnd> {
        let result = self.run_stages(loop_idx, state, from);
        if result.is_err() {
            self.halted.store(true, Ordering::SeqCst);
        }
        result
    }

    #[instrument(skip_all, fields(loop_idx = loop_idx))]
    fn run_stages(
        &self,
        loop_idx: u32,
        mut state: Option<IterationState>,
        from: Stage,
    ) -> Result<IterationEnd> {
        let mut next = Some(from);
        while let Some(stage) = next {
            if !self.take_step() {
                info!(%stage, "step limit reached");
                return Ok(IterationEnd::StepLimited);
            }
            debug!(%stage, "stage started");
            let (current, snapshot) = self
                .run_stage(loop_idx, stage, state.take())
                .with_context(|| format!("{stage} stage"))?;
            let session_stages = self.session_stages.fetch_add(1, Ordering::SeqCst) + 1;
            write_checkpoint(
                &self.config.session_dir,
                &Checkpoint {
                    loop_idx,
                    stage,
                    config: self.config.clone(),
                    iteration: current.clone(),
                    trace: snapshot,
                    counters: RunCounters {
                        loops_started: self.loops_started.load(Ordering::SeqCst),
                        stages_run: session_stages,
                    },
                },
            )?;
            next = following(stage, &current);
            state = Some(current);
        }
        Ok(IterationEnd::Recorded)
    }

    /// Run `stage` and return the updated state with the trace to checkpoint.
    fn run_stage(
        &self,
        loop_idx: u32,
        stage: Stage,
        state: Option<IterationState>,
    ) -> Result<(IterationState, HistoryTrace)> {
        match stage {
            Stage::Propose => {
                let snapshot = self.trace_snapshot();
                let attempt = self.stages.propose(self.generator, loop_idx, &snapshot)?;
                self.events
                    .record_stage(loop_idx, stage, "plan", &attempt.plan)?;
                Ok((IterationState::new(attempt), snapshot))
            }
            Stage::Implement => {
                let mut state = require(state, stage)?;
                let snapshot = self.trace_snapshot();
                match self
                    .stages
                    .implement(self.generator, &state.attempt, &snapshot)?
                {
                    ImplementOutcome::Coded(attempt) => {
                        self.events
                            .record_stage(loop_idx, stage, "coded_attempt", &attempt)?;
                        state.attempt = attempt;
                    }
                    ImplementOutcome::Rejected(err) => {
                        let error = err.to_string();
                        self.events.record_stage(
                            loop_idx,
                            stage,
                            "rejected",
                            &RejectedEvent { error: &error },
                        )?;
                        state.rejection = Some(error);
                    }
                }
                Ok((state, snapshot))
            }
            Stage::Execute => {
                let mut state = require(state, stage)?;
                let workspace = create_workspace(
                    &self.config.workspace_dir,
                    &self.challenge.name,
                    loop_idx,
                )?;
                let outcome = sandbox::execute(
                    self.runtime,
                    &workspace,
                    self.challenge,
                    &state.attempt,
                    &self.config.sandbox,
                );
                self.events
                    .record_stage(loop_idx, stage, "run_outcome", &outcome)?;
                state.attempt.outcome = Some(outcome);
                Ok((state, self.trace_snapshot()))
            }
            Stage::Judge => {
                let mut state = require(state, stage)?;
                let snapshot = self.trace_snapshot();
                let decision = match (&state.rejection, &state.attempt.outcome) {
                    (Some(error), _) => Decision::from_error(error),
                    (None, Some(outcome)) => {
                        judge(outcome, self.config.accuracy_threshold, &snapshot)
                    }
                    (None, None) => return Err(anyhow!("execute produced no run outcome")),
                };
                info!(passed = decision.passed, "attempt judged");
                self.events
                    .record_stage(loop_idx, stage, "decision", &decision)?;
                state.decision = Some(decision);
                Ok((state, snapshot))
            }
            Stage::Record => {
                let state = require(state, stage)?;
                let decision = state
                    .decision
                    .clone()
                    .ok_or_else(|| anyhow!("no decision to record"))?;
                let snapshot = {
                    let mut trace = self.lock_trace();
                    trace.append(state.attempt.clone(), decision.clone());
                    trace.clone()
                };
                let best_accuracy = snapshot
                    .best_so_far()
                    .and_then(|entry| entry.attempt.accuracy());
                let passes = snapshot.pass_count();
                info!(
                    recorded = snapshot.len(),
                    passes,
                    best_accuracy = ?best_accuracy,
                    "attempt recorded"
                );
                self.events.record_stage(
                    loop_idx,
                    stage,
                    "trace",
                    &RecordEvent {
                        index: snapshot.len() - 1,
                        attempt: &state.attempt,
                        decision: &decision,
                        best_accuracy,
                        passes,
                        trace: &snapshot,
                    },
                )?;
                Ok((state, snapshot))
            }
        }
    }

    fn take_step(&self) -> bool {
        let Some(limit) = self.step_limit else {
            self.stages_run.fetch_add(1, Ordering::SeqCst);
            return true;
        };
        let taken = self
            .stages_run
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |run| {
                (run < limit).then_some(run + 1)
            })
            .is_ok();
        if !taken {
            self.step_limited.store(true, Ordering::SeqCst);
            self.halted.store(true, Ordering::SeqCst);
        }
        taken
    }

    fn lock_trace(&self) -> std::sync::MutexGuard<'_, HistoryTrace> {
        self.trace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trace_snapshot(&self) -> HistoryTrace {
        self.lock_trace().clone()
    }
}

/// Stage after `stage`; a rejected implementation skips execute.
fn following(stage: Stage, state: &IterationState) -> Option<Stage> {
    match stage {
        Stage::Implement if state.rejection.is_some() => Some(Stage::Judge),
        _ => stage.next(),
    }
}

fn require(state: Option<IterationState>, stage: Stage) -> Result<IterationState> {
    state.ok_or_else(|| anyhow!("no iteration state before the {stage} stage"))
}

/// Load a checkpoint for resuming, pointing its config at the session the
/// file lives in. With `checkout`, newer checkpoints are removed first.
pub fn prepare_resume(path: &Path, checkout_later: bool) -> Result<Checkpoint> {
    let mut checkpoint = load_checkpoint(path)?;
    let session_dir = Checkpoint::session_dir_of(path)?;
    if checkpoint.config.session_dir != session_dir {
        warn!(
            recorded = %checkpoint.config.session_dir.display(),
            actual = %session_dir.display(),
            "checkpoint moved, using its current session directory"
        );
        checkpoint.config.session_dir = session_dir;
    }
    if checkout_later {
        checkout(
            &checkpoint.config.session_dir,
            checkpoint.loop_idx,
            checkpoint.stage,
        )?;
        checkpoint.counters.loops_started = checkpoint.loop_idx + 1;
    }
    Ok(checkpoint)
}
