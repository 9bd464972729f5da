//! I/O adapters: tracker, agents, processes, git, and on-disk artifacts.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod context;
pub mod failure_report;
pub mod git;
pub mod memory;
pub mod process;
pub mod run_log;
pub mod tracker;
