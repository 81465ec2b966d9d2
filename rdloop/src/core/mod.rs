//! Deterministic, pure logic shared by the loop.
//!
//! Core modules perform no I/O. They operate on in-memory values and return
//! deterministic outputs suitable for tests.

pub mod accuracy;
pub mod extract;
pub mod judge;
pub mod patch;
pub mod text;
pub mod trace;
pub mod types;
