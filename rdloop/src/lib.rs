//! Iterative research loop for homomorphic-encryption challenges.
//!
//! Each iteration proposes an algorithm, implements it by patching a method
//! body into the challenge template, builds and scores it inside containers,
//! judges the result against a threshold and records it in a history trace
//! that informs the next proposal.
//!
//! - **[`core`]**: Pure logic (patching, extraction, accuracy parsing,
//!   judging, the history trace). No I/O.
//! - **[`io`]**: Side effects (config, challenge loading, workspaces,
//!   containers, generation, events, checkpoints).
//!
//! [`stages`], [`sandbox`] and [`orchestrator`] wire the two together.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod sandbox;
pub mod stages;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod throttle;
