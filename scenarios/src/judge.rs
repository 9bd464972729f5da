//! Check evaluation and outcome recording.
//!
//! Evaluates case checks against the cycle outcome and the final tracker
//! state, recording what was expected next to what was observed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use pev::core::action::ActionKind;
use pev::core::context::ProjectStatus;
use pev::core::machine::MachineState;
use pev::cycle::CycleOutcome;
use pev::io::tracker::TrackerState;

use crate::case::Check;

/// Collected check outcomes for a run.
#[derive(Debug, Serialize, Deserialize)]
pub struct Judgment {
    pub checks: Vec<CheckOutcome>,
}

impl Judgment {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(CheckOutcome::passed)
    }
}

/// Result of evaluating a single check.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckOutcome {
    FinalState {
        expected: MachineState,
        actual: Option<MachineState>,
        passed: bool,
    },
    ActionsInclude {
        missing: Vec<ActionKind>,
        passed: bool,
    },
    ActionsExclude {
        present: Vec<ActionKind>,
        passed: bool,
    },
    Verified {
        passed: bool,
    },
    ExitCode {
        expected: i32,
        actual: i32,
        passed: bool,
    },
    Status {
        issue: u64,
        expected: Option<ProjectStatus>,
        actual: Option<ProjectStatus>,
        passed: bool,
    },
    HasLabel {
        issue: u64,
        label: String,
        passed: bool,
    },
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        match self {
            CheckOutcome::FinalState { passed, .. }
            | CheckOutcome::ActionsInclude { passed, .. }
            | CheckOutcome::ActionsExclude { passed, .. }
            | CheckOutcome::Verified { passed }
            | CheckOutcome::ExitCode { passed, .. }
            | CheckOutcome::Status { passed, .. }
            | CheckOutcome::HasLabel { passed, .. } => *passed,
        }
    }

    /// Stable label for pass-rate aggregation.
    pub fn label(&self) -> String {
        match self {
            CheckOutcome::FinalState { expected, .. } => format!("final_state({expected})"),
            CheckOutcome::ActionsInclude { .. } => "actions_include".to_string(),
            CheckOutcome::ActionsExclude { .. } => "actions_exclude".to_string(),
            CheckOutcome::Verified { .. } => "verified".to_string(),
            CheckOutcome::ExitCode { expected, .. } => format!("exit_code({expected})"),
            CheckOutcome::Status { issue, .. } => format!("status(#{issue})"),
            CheckOutcome::HasLabel { issue, label, .. } => format!("has_label(#{issue}, {label})"),
        }
    }
}

/// What a replay produced: the cycle outcome (absent when the cycle errored),
/// the exit code, and the final tracker state.
pub struct Observed<'a> {
    pub outcome: Option<&'a CycleOutcome>,
    pub exit_code: i32,
    pub state: &'a TrackerState,
}

/// Evaluate all checks.
#[instrument(skip_all, fields(check_count = checks.len()))]
pub fn run_checks(checks: &[Check], observed: &Observed<'_>) -> Judgment {
    let kinds: Vec<ActionKind> = observed
        .outcome
        .map(|outcome| outcome.actions.iter().map(|action| action.kind()).collect())
        .unwrap_or_default();

    let outcomes = checks
        .iter()
        .map(|check| {
            let outcome = evaluate(check, observed, &kinds);
            debug!(check = %outcome.label(), passed = outcome.passed(), "check result");
            outcome
        })
        .collect();
    Judgment { checks: outcomes }
}

fn evaluate(check: &Check, observed: &Observed<'_>, kinds: &[ActionKind]) -> CheckOutcome {
    match check {
        Check::FinalState { state } => {
            let actual = observed.outcome.map(|outcome| outcome.final_state);
            CheckOutcome::FinalState {
                expected: *state,
                actual,
                passed: actual == Some(*state),
            }
        }
        Check::ActionsInclude { kinds: wanted } => {
            let missing: Vec<ActionKind> = wanted
                .iter()
                .filter(|kind| !kinds.contains(kind))
                .copied()
                .collect();
            CheckOutcome::ActionsInclude {
                passed: observed.outcome.is_some() && missing.is_empty(),
                missing,
            }
        }
        Check::ActionsExclude { kinds: unwanted } => {
            let present: Vec<ActionKind> = unwanted
                .iter()
                .filter(|kind| kinds.contains(kind))
                .copied()
                .collect();
            CheckOutcome::ActionsExclude {
                passed: observed.outcome.is_some() && present.is_empty(),
                present,
            }
        }
        Check::Verified => CheckOutcome::Verified {
            passed: observed.outcome.is_some_and(CycleOutcome::verified),
        },
        Check::ExitCode { code } => CheckOutcome::ExitCode {
            expected: *code,
            actual: observed.exit_code,
            passed: observed.exit_code == *code,
        },
        Check::Status { issue, status } => {
            let actual = observed.state.items.get(issue).and_then(|item| item.status);
            CheckOutcome::Status {
                issue: *issue,
                expected: *status,
                actual,
                passed: observed.state.items.contains_key(issue) && actual == *status,
            }
        }
        Check::HasLabel { issue, label } => CheckOutcome::HasLabel {
            issue: *issue,
            label: label.clone(),
            passed: observed
                .state
                .items
                .get(issue)
                .is_some_and(|item| item.labels.contains(label)),
        },
    }
}

pub fn write_judgment(path: &Path, judgment: &Judgment) -> Result<()> {
    let contents = serde_json::to_string_pretty(judgment).context("serialize checks")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
