//! Deterministic, pure logic for flow compilation and patch analysis.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod normalize;
pub mod patch;
pub mod runtime_policy;
pub mod safety;
pub mod schedule;
pub mod template;
pub mod types;
