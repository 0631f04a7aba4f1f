//! Declarative agent flows and a safe patch-apply pipeline.
//!
//! A mode document describes a multi-step workflow as a graph of role-based
//! steps. This crate validates that graph, levels it for parallel execution,
//! and plans one job per step with its resolved runtime policy and rendered
//! prompts. The resulting patch is applied through a pipeline that checks,
//! backs up, applies, verifies, and rolls back on failure.
//!
//! - **[`core`]**: Pure, deterministic logic (normalization, scheduling, policy
//!   resolution, templates, diff analysis, safety checks). No I/O.
//! - **[`io`]**: Side-effecting operations (mode files, config, processes,
//!   git, backups).
//!
//! [`compile`] and [`apply`] coordinate the two to implement CLI commands.

pub mod apply;
pub mod compile;
pub mod core;
pub mod exit_codes;
pub mod flow;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
