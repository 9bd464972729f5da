//! Typed failures that callers recover from `anyhow::Error` via `downcast_ref`.

use thiserror::Error;

use crate::core::compare::CandidateDiff;

/// An action document failed validation before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaValidationError {
    #[error("unknown action type '{type_name}'")]
    UnknownType { type_name: String },
    #[error("action {kind} failed schema validation:\n- {}", .messages.join("\n- "))]
    Invalid { kind: String, messages: Vec<String> },
    #[error("malformed action: {message}")]
    Malformed { message: String },
}

/// The predictor produced more candidates than the fork ceiling allows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("prediction overflow: {count} candidates exceed limit {limit} at action #{index} ({kind})")]
pub struct PredictionOverflow {
    pub count: usize,
    pub limit: usize,
    pub index: usize,
    pub kind: String,
}

/// Real post-execution state matched none of the predicted candidates.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("verification mismatch against {candidates} candidate(s){}", best_summary(.best.as_ref()))]
pub struct VerificationMismatch {
    pub candidates: usize,
    pub best: Option<CandidateDiff>,
    pub retrigger_mismatch: bool,
}

fn best_summary(best: Option<&CandidateDiff>) -> String {
    match best {
        Some(best) => format!(
            "; closest candidate #{} differs in {} field(s): {}",
            best.index,
            best.diffs.len(),
            best.diffs
                .iter()
                .map(|diff| diff.path.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        None => String::new(),
    }
}
