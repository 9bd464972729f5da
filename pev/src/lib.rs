//! Predict-execute-verify engine for agent-driven issue workflows.
//!
//! A trigger is handled in one deterministic cycle: a pure transition machine
//! decides a batch of actions, a predictor folds the same actions into the set
//! of acceptable outcome trees, the runner applies the actions, and the
//! comparator checks the refreshed real tree against the candidates. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (machine, predictors, comparator).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (tracker, agents, processes, git, run
//!   logs). Isolated behind traits to enable in-memory replay in tests.
//!
//! Orchestration modules ([`runner`], [`grooming`], [`cycle`]) couple core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod cycle;
pub mod error;
pub mod exit_codes;
pub mod grooming;
pub mod io;
pub mod logging;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
