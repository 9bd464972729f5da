//! Orchestration for a single predict-execute-verify cycle.
//!
//! Fetch from truth, decide, predict, execute, fetch again, verify. Nothing
//! survives across cycles except what the tracker holds.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tracing::{info, instrument, warn};

use crate::core::action::{Action, ActionKind};
use crate::core::compare::{Verification, compare};
use crate::core::context::Context;
use crate::core::history::{rebase_entry, success_entry};
use crate::core::machine::{MachineState, run_machine};
use crate::core::predict::predict;
use crate::core::tree::PredictableStateTree;
use crate::exit_codes;
use crate::io::agent::AgentExecutor;
use crate::io::config::PevConfig;
use crate::io::context::{build_context, extract_tree};
use crate::io::run_log::{RunMeta, RunWriteRequest, write_run};
use crate::io::tracker::{Tracker, TriggerEvent};
use crate::runner::{ExecutionReport, Runner, RunnerOptions, ScopedClients, StopReason, remaining_budget};

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub runner: RunnerOptions,
    /// Wall-clock bound for the whole cycle.
    pub timeout: Duration,
    /// Write per-run artifacts under `<log_dir>/<run-id>/` when set.
    pub log_dir: Option<PathBuf>,
}

impl CycleOptions {
    pub fn from_config(config: &PevConfig) -> Self {
        Self {
            runner: RunnerOptions::from_config(config),
            timeout: Duration::from_secs(config.cycle_timeout_secs),
            log_dir: None,
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub context: Context,
    pub final_state: MachineState,
    pub trace: Vec<MachineState>,
    pub actions: Vec<Action>,
    pub candidates: Vec<PredictableStateTree>,
    pub report: ExecutionReport,
    /// Post-execution tree; absent for dry runs and failed batches.
    pub actual: Option<PredictableStateTree>,
    pub verification: Option<Verification>,
    pub exit_code: i32,
}

impl CycleOutcome {
    pub fn run_id(&self) -> &str {
        &self.context.run_id
    }

    pub fn verified(&self) -> bool {
        self.verification.as_ref().is_some_and(|v| v.pass)
    }
}

/// Plan without executing: context, machine outcome, and candidates.
#[derive(Debug, Clone)]
pub struct Plan {
    pub context: Context,
    pub tree: PredictableStateTree,
    pub final_state: MachineState,
    pub trace: Vec<MachineState>,
    pub actions: Vec<Action>,
    pub candidates: Vec<PredictableStateTree>,
}

/// Fetch context and tree, run the machine, and predict its outcomes.
#[instrument(skip_all, fields(issue = event.issue_number, trigger = %event.kind))]
pub fn plan_cycle<T: Tracker>(tracker: &T, event: &TriggerEvent, config: &PevConfig) -> Result<Plan> {
    let context = build_context(tracker, event, config)?;
    let tree = extract_tree(tracker, context.issue.number)?;
    let outcome = run_machine(&context);
    info!(
        final_state = %outcome.final_state,
        actions = outcome.actions.len(),
        "machine decided"
    );
    let candidates = predict(&outcome.actions, &tree, &context, outcome.final_state)?;
    Ok(Plan {
        context,
        tree,
        final_state: outcome.final_state,
        trace: outcome.trace,
        actions: outcome.actions,
        candidates,
    })
}

/// Execute one full cycle for `event`.
///
/// Execution failures are reported through the outcome's exit code; only
/// invalid input, schema errors, prediction overflow, and timeouts return
/// `Err`.
#[instrument(skip_all, fields(issue = event.issue_number, trigger = %event.kind))]
pub fn run_cycle<T: Tracker>(
    clients: ScopedClients<'_, T>,
    agent: &dyn AgentExecutor,
    event: &TriggerEvent,
    config: &PevConfig,
    options: &CycleOptions,
) -> Result<CycleOutcome> {
    let start = Instant::now();
    let deadline = start + options.timeout;

    let plan = plan_cycle(clients.code, event, config)?;
    remaining_budget(deadline)?;

    let runner_options = RunnerOptions {
        deadline: Some(deadline),
        ..options.runner.clone()
    };
    let report = Runner::new(clients, agent, &plan.context, &runner_options).execute(&plan.actions)?;

    let mut actual = None;
    let mut verification = None;
    if !report.dry_run && !report.failed() {
        record_history(clients.code, &plan, &report)?;
        remaining_budget(deadline)?;
        let tree = extract_tree(clients.code, plan.context.issue.number)?;
        let retrigger_expected = plan
            .actions
            .iter()
            .any(|action| action.kind() == ActionKind::Retrigger);
        let result = compare(&plan.candidates, &tree);
        let verdict = Verification::new(result, retrigger_expected, report.retrigger_executed);
        if let Some(mismatch) = verdict.mismatch(plan.candidates.len()) {
            warn!(%mismatch, "verification failed");
        } else {
            info!(matched = ?verdict.result.matched_index, "verification passed");
        }
        actual = Some(tree);
        verification = Some(verdict);
    }

    let exit_code = exit_code(&report, verification.as_ref());
    let outcome = CycleOutcome {
        context: plan.context,
        final_state: plan.final_state,
        trace: plan.trace,
        actions: plan.actions,
        candidates: plan.candidates,
        report,
        actual,
        verification,
        exit_code,
    };

    if let Some(log_dir) = &options.log_dir {
        let meta = RunMeta {
            run_id: outcome.context.run_id.clone(),
            issue_number: outcome.context.issue.number,
            trigger: outcome.context.trigger.to_string(),
            final_state: outcome.final_state,
            trace: outcome.trace.clone(),
            dry_run: outcome.report.dry_run,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        let paths = write_run(&RunWriteRequest {
            log_dir,
            meta: &meta,
            context: &outcome.context,
            actions: &outcome.actions,
            candidates: &outcome.candidates,
            report: &outcome.report,
            actual: outcome.actual.as_ref(),
            verification: outcome.verification.as_ref(),
        })
        .context("write run log")?;
        info!(dir = %paths.dir.display(), "run log written");
    }

    Ok(outcome)
}

/// Append the row the prediction expects after a successful batch.
fn record_history<T: Tracker>(tracker: &T, plan: &Plan, report: &ExecutionReport) -> Result<()> {
    let entry = if report.stop == Some(StopReason::Rebased) {
        let position = plan
            .actions
            .iter()
            .position(|action| action.kind() == ActionKind::CreateBranch)
            .unwrap_or(plan.actions.len().saturating_sub(1));
        let prefix_end = (position + 1).min(plan.actions.len());
        Some(rebase_entry(&plan.context, &plan.actions[..prefix_end]))
    } else {
        success_entry(plan.final_state, &plan.actions, &plan.context)
    };
    if let Some(entry) = entry {
        let appended = tracker
            .append_history(plan.context.issue.number, entry)
            .context("append cycle history")?;
        if !appended {
            info!("history row already present");
        }
    }
    Ok(())
}

/// Failed beats mismatch beats blocked beats ok.
fn exit_code(report: &ExecutionReport, verification: Option<&Verification>) -> i32 {
    if report.failed() {
        return exit_codes::FAILED;
    }
    if verification.is_some_and(|v| !v.pass) {
        return exit_codes::MISMATCH;
    }
    report.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::TriggerKind;
    use crate::core::predictors::labels;
    use crate::io::agent::MockOutputs;
    use crate::test_support::{REVIEWER, tracker_with_issue};
    use serde_json::json;

    fn options() -> CycleOptions {
        CycleOptions::from_config(&PevConfig::default())
    }

    /// A triage cycle with questions lands on the questions candidate.
    #[test]
    fn triage_cycle_verifies() {
        let code = tracker_with_issue(7, "Add export");
        let review = code.with_identity(REVIEWER);
        let mut mocks = MockOutputs::default();
        mocks.insert(
            "triage",
            json!({"labels": ["enhancement"], "requirements": ["CSV export"], "questions": ["Which columns?"]}),
        );
        let event = TriggerEvent::new(TriggerKind::IssueTriage, 7);
        let outcome = run_cycle(
            ScopedClients::new(&code, &review),
            &mocks,
            &event,
            &PevConfig::default(),
            &options(),
        )
        .expect("cycle");

        assert_eq!(outcome.final_state, MachineState::Triaging);
        assert_eq!(outcome.candidates.len(), 2);
        assert!(outcome.verified(), "{:?}", outcome.verification);
        assert_eq!(outcome.exit_code, exit_codes::OK);
        let item = code.item(7).expect("item");
        assert!(item.labels.contains(labels::TRIAGED));
        assert_eq!(item.body.history.len(), 1);
    }

    /// Dry runs execute nothing and skip verification.
    #[test]
    fn dry_run_skips_verification() {
        let code = tracker_with_issue(7, "Add export");
        let review = code.with_identity(REVIEWER);
        let mut opts = options();
        opts.runner.dry_run = true;
        let event = TriggerEvent::new(TriggerKind::IssueTriage, 7);
        let outcome = run_cycle(
            ScopedClients::new(&code, &review),
            &MockOutputs::default(),
            &event,
            &PevConfig::default(),
            &opts,
        )
        .expect("cycle");

        assert!(outcome.verification.is_none());
        assert_eq!(outcome.exit_code, exit_codes::OK);
        let item = code.item(7).expect("item");
        assert!(item.labels.is_empty());
        assert_eq!(item.status, None);
    }

    /// A failed agent call fails the cycle without verifying.
    #[test]
    fn agent_failure_exits_failed() {
        let code = tracker_with_issue(7, "Add export");
        let review = code.with_identity(REVIEWER);
        let event = TriggerEvent::new(TriggerKind::IssueTriage, 7);
        let outcome = run_cycle(
            ScopedClients::new(&code, &review),
            &MockOutputs::default(),
            &event,
            &PevConfig::default(),
            &options(),
        )
        .expect("cycle");

        assert!(outcome.report.failed());
        assert!(outcome.verification.is_none());
        assert_eq!(outcome.exit_code, exit_codes::FAILED);
    }

    #[test]
    fn run_log_is_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let code = tracker_with_issue(7, "Add export");
        let review = code.with_identity(REVIEWER);
        let mut opts = options();
        opts.log_dir = Some(temp.path().to_path_buf());
        opts.runner.dry_run = true;
        let mut event = TriggerEvent::new(TriggerKind::IssueTriage, 7);
        event.run_id = Some("run-9".to_string());
        run_cycle(
            ScopedClients::new(&code, &review),
            &MockOutputs::default(),
            &event,
            &PevConfig::default(),
            &opts,
        )
        .expect("cycle");

        let dir = temp.path().join("run-9");
        assert!(dir.join("meta.json").exists());
        assert!(dir.join("candidates.json").exists());
        assert!(!dir.join("verification.json").exists());
    }

    #[test]
    fn mismatch_outranks_block() {
        let report = ExecutionReport {
            stop: Some(StopReason::Blocked),
            ..ExecutionReport::default()
        };
        let failing = Verification::new(
            crate::core::compare::VerifyResult {
                pass: false,
                matched_index: None,
                best: None,
            },
            false,
            false,
        );
        assert_eq!(exit_code(&report, Some(&failing)), exit_codes::MISMATCH);
        assert_eq!(exit_code(&report, None), exit_codes::BLOCKED);
    }
}
