//! Side-effecting helpers: filesystem, child processes, and git.

pub mod backup;
pub mod command;
pub mod config;
pub mod git;
pub mod mode;
pub mod process;
pub mod prompt;
