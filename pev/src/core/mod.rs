//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod action;
pub mod agent_output;
pub mod body;
pub mod compare;
pub mod context;
pub mod guards;
pub mod history;
pub mod machine;
pub mod patch;
pub mod predict;
pub mod predictors;
pub mod tree;
