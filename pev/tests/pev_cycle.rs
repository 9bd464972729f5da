//! Cycle-level tests: full predict-execute-verify runs against an in-memory
//! tracker with scripted agent outputs.
//!
//! Each test seeds a tracker state, runs one trigger through `run_cycle`, and
//! checks both the engine's verdict and the resulting system of record.

use std::collections::BTreeSet;

use serde_json::json;

use pev::core::action::ActionKind;
use pev::core::agent_output::GroomingRole;
use pev::core::context::{CiResult, PrState, ProjectStatus, TriggerKind};
use pev::core::machine::MachineState;
use pev::cycle::{CycleOptions, CycleOutcome, run_cycle};
use pev::exit_codes;
use pev::io::agent::MockOutputs;
use pev::io::config::{FailureReportConfig, PevConfig};
use pev::io::failure_report::{FailureDetails, FailureReport, file_failure_report};
use pev::io::memory::MemoryTracker;
use pev::io::tracker::{BranchRecord, ItemRecord, PrRecord, Tracker, TrackerState, TriggerEvent};
use pev::runner::{ScopedClients, StopReason};
use pev::test_support::{BOT, REVIEWER, tracker_with_phases};

const ISSUE: u64 = 42;
const PR: u64 = 50;
const BRANCH: &str = "pev/issue-42";

fn assigned_issue() -> ItemRecord {
    let mut item = ItemRecord::new(ISSUE, "Fix login");
    item.assignees = BTreeSet::from([BOT.to_string()]);
    item
}

/// Issue in progress with a pushed branch and an open draft PR.
fn issue_with_pr(state: &mut TrackerState) {
    let mut item = assigned_issue();
    item.status = Some(ProjectStatus::InProgress);
    item.iteration = 2;
    item.failures = 1;
    item.branch = Some(BRANCH.to_string());
    item.pr = Some(PR);
    state.insert_item(item);
    state.branches.insert(
        BRANCH.to_string(),
        BranchRecord {
            name: BRANCH.to_string(),
            base: "main".to_string(),
            behind_base: false,
            pushes: 1,
        },
    );
    state.pull_requests.insert(
        PR,
        PrRecord {
            number: PR,
            issue_number: ISSUE,
            title: "Fix login".to_string(),
            head_ref: BRANCH.to_string(),
            base_ref: "main".to_string(),
            is_draft: true,
            state: PrState::Open,
            author: BOT.to_string(),
            requested_reviewers: BTreeSet::new(),
        },
    );
}

fn tracker(state: TrackerState) -> MemoryTracker {
    MemoryTracker::new(BOT, state)
}

fn run(
    code: &MemoryTracker,
    mocks: &MockOutputs,
    event: &TriggerEvent,
    options: &CycleOptions,
) -> CycleOutcome {
    let review = code.with_identity(REVIEWER);
    run_cycle(
        ScopedClients::new(code, &review),
        mocks,
        event,
        &PevConfig::default(),
        options,
    )
    .expect("cycle")
}

fn options() -> CycleOptions {
    CycleOptions::from_config(&PevConfig::default())
}

fn kinds(outcome: &CycleOutcome) -> Vec<ActionKind> {
    outcome.actions.iter().map(|action| action.kind()).collect()
}

/// First assignment: branch, iteration, agent, push, draft PR, then a
/// verified success row.
#[test]
fn first_iteration_opens_draft_pr() {
    let mut state = TrackerState::default();
    state.insert_item(assigned_issue());
    let code = tracker(state);
    let mut mocks = MockOutputs::default();
    mocks.insert("iterate", json!({"summary": "Wired the login form"}));

    let outcome = run(
        &code,
        &mocks,
        &TriggerEvent::new(TriggerKind::IssueAssigned, ISSUE),
        &options(),
    );

    assert_eq!(outcome.final_state, MachineState::Iterating);
    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(outcome.exit_code, exit_codes::OK);

    let item = code.item(ISSUE).expect("item");
    assert_eq!(item.status, Some(ProjectStatus::InProgress));
    assert_eq!(item.iteration, 1);
    assert_eq!(item.body.agent_notes.len(), 1);
    assert!(item.body.history[0].action.contains("Opened draft PR"));
    let pr = code.pull_request(item.pr.expect("pr linked")).expect("pr");
    assert!(pr.is_draft);
    assert_eq!(pr.head_ref, BRANCH);
}

/// CI failure below the retry limit: record failure, bump iteration, fix-ci.
#[test]
fn ci_failure_runs_fix_ci() {
    let mut state = TrackerState::default();
    issue_with_pr(&mut state);
    let code = tracker(state);
    let mut mocks = MockOutputs::default();
    mocks.insert("fix-ci", json!({"summary": "Fixed flaky assertion"}));
    let mut event = TriggerEvent::new(TriggerKind::CiCompleted, ISSUE);
    event.ci_result = Some(CiResult::Failure);

    let outcome = run(&code, &mocks, &event, &options());

    assert_eq!(outcome.final_state, MachineState::IteratingFix);
    let kinds = kinds(&outcome);
    let increment = kinds
        .iter()
        .position(|kind| *kind == ActionKind::IncrementIteration)
        .expect("increment");
    assert_eq!(kinds[increment + 1], ActionKind::RunAgent);
    assert!(outcome.verified(), "{:#?}", outcome.verification);

    let item = code.item(ISSUE).expect("item");
    assert_eq!(item.failures, 2);
    assert_eq!(item.iteration, 3);
    let state = code.snapshot().expect("state");
    assert_eq!(state.branches[BRANCH].pushes, 2);
}

/// Triage without questions matches the second (no-questions) candidate.
#[test]
fn triage_matches_the_observed_fork() {
    let mut state = TrackerState::default();
    state.insert_item(ItemRecord::new(ISSUE, "Fix login"));
    let code = tracker(state);
    let mut mocks = MockOutputs::default();
    mocks.insert(
        "triage",
        json!({"labels": ["bug"], "requirements": ["- Login accepts SSO users"]}),
    );

    let outcome = run(
        &code,
        &mocks,
        &TriggerEvent::new(TriggerKind::IssueOpened, ISSUE),
        &options(),
    );

    assert_eq!(outcome.candidates.len(), 2);
    let verification = outcome.verification.as_ref().expect("verified");
    assert!(verification.pass);
    assert_eq!(verification.result.matched_index, Some(1));
    let item = code.item(ISSUE).expect("item");
    assert!(item.labels.contains("bug"));
    assert!(item.body.questions.is_empty());
}

/// Grooming round on a fresh issue with each role answering `output(role)`.
fn groom(output: impl Fn(GroomingRole) -> serde_json::Value) -> (MemoryTracker, CycleOutcome) {
    let mut state = TrackerState::default();
    state.insert_item(ItemRecord::new(ISSUE, "Add search"));
    let code = tracker(state);
    let mut mocks = MockOutputs::default();
    for role in GroomingRole::ALL {
        mocks.insert(role.mock_key(), output(role));
    }
    let outcome = run(
        &code,
        &mocks,
        &TriggerEvent::new(TriggerKind::IssueGroom, ISSUE),
        &options(),
    );
    (code, outcome)
}

fn matched_index(outcome: &CycleOutcome) -> Option<usize> {
    outcome
        .verification
        .as_ref()
        .and_then(|verification| verification.result.matched_index)
}

/// All roles ready: the first candidate holds, including the new open todos.
#[test]
fn grooming_ready_verifies() {
    let (code, outcome) = groom(|_| json!({"ready": true, "todos": ["Write the handler"]}));

    assert_eq!(outcome.final_state, MachineState::Grooming);
    assert_eq!(outcome.candidates.len(), 3);
    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(matched_index(&outcome), Some(0));
    assert_eq!(outcome.exit_code, exit_codes::OK);

    let item = code.item(ISSUE).expect("item");
    assert_eq!(item.status, Some(ProjectStatus::Ready));
    assert!(item.labels.contains("groomed"));
    assert_eq!(item.body.todo_stats().unchecked_non_manual, 1);
}

/// Empty todo lists still leave one fallback todo, which the candidate allows.
#[test]
fn grooming_ready_without_todos_verifies() {
    let (code, outcome) = groom(|_| json!({"ready": true}));

    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(matched_index(&outcome), Some(0));
    assert_eq!(code.item(ISSUE).expect("item").body.todos.len(), 1);
}

#[test]
fn grooming_questions_match_needs_info() {
    let (code, outcome) = groom(|role| match role {
        GroomingRole::Qa => json!({"questions": ["Which browsers matter?"]}),
        _ => json!({"ready": true}),
    });

    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(matched_index(&outcome), Some(1));
    let item = code.item(ISSUE).expect("item");
    assert!(item.labels.contains("needs-info"));
    assert_eq!(item.body.question_stats().unanswered, 1);
}

#[test]
fn grooming_split_matches_needs_split() {
    let (code, outcome) = groom(|role| match role {
        GroomingRole::Engineer => json!({"recommendSplit": true}),
        _ => json!({"ready": true}),
    });

    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(matched_index(&outcome), Some(2));
    let item = code.item(ISSUE).expect("item");
    assert!(item.labels.contains("needs-split"));
    assert_eq!(item.status, None);
}

/// At max retries a CI failure blocks the item and never calls the agent.
#[test]
fn circuit_breaker_blocks_item() {
    let mut state = TrackerState::default();
    issue_with_pr(&mut state);
    if let Some(item) = state.items.get_mut(&ISSUE) {
        item.failures = 5;
    }
    let code = tracker(state);
    let mut event = TriggerEvent::new(TriggerKind::CiCompleted, ISSUE);
    event.ci_result = Some(CiResult::Failure);

    let outcome = run(&code, &MockOutputs::default(), &event, &options());

    assert_eq!(outcome.final_state, MachineState::Blocked);
    assert!(!kinds(&outcome).contains(&ActionKind::RunAgent));
    assert_eq!(outcome.report.stop, Some(StopReason::Blocked));
    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(outcome.exit_code, exit_codes::BLOCKED);

    let item = code.item(ISSUE).expect("item");
    assert_eq!(item.status, Some(ProjectStatus::Blocked));
    assert!(item.assignees.is_empty());
}

/// Review actions run as the reviewer identity, never as the PR author.
#[test]
fn review_runs_under_review_scope() {
    let mut state = TrackerState::default();
    issue_with_pr(&mut state);
    let code = tracker(state);
    let mut mocks = MockOutputs::default();
    mocks.insert("review", json!({"decision": "approved", "body": "LGTM"}));

    let outcome = run(
        &code,
        &mocks,
        &TriggerEvent::new(TriggerKind::PrReviewRequested, ISSUE),
        &options(),
    );

    assert_eq!(outcome.final_state, MachineState::PrReviewing);
    assert!(outcome.verified(), "{:#?}", outcome.verification);
    let state = code.snapshot().expect("state");
    assert_eq!(state.reviews.len(), 1);
    assert_eq!(state.reviews[0].reviewer, REVIEWER);
    assert!(
        state
            .audit
            .iter()
            .filter(|entry| entry.operation.starts_with("submit_review"))
            .all(|entry| entry.identity == REVIEWER)
    );
}

/// An existing stale branch is rebased; the batch stops and verifies against
/// the rebase candidate.
#[test]
fn stale_branch_is_rebased() {
    let mut state = TrackerState::default();
    state.insert_item(assigned_issue());
    state.branches.insert(
        BRANCH.to_string(),
        BranchRecord {
            name: BRANCH.to_string(),
            base: "main".to_string(),
            behind_base: true,
            pushes: 0,
        },
    );
    let code = tracker(state);

    let outcome = run(
        &code,
        &MockOutputs::default(),
        &TriggerEvent::new(TriggerKind::IssueAssigned, ISSUE),
        &options(),
    );

    assert_eq!(outcome.report.stop, Some(StopReason::Rebased));
    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(outcome.exit_code, exit_codes::BLOCKED);
    let item = code.item(ISSUE).expect("item");
    assert_eq!(item.iteration, 0);
    assert!(item.body.history[0].action.contains("Rebased"));
    let state = code.snapshot().expect("state");
    assert!(!state.branches[BRANCH].behind_base);
}

/// Starting an orchestration moves parent and first phase to in progress.
#[test]
fn orchestration_starts_first_phase() {
    let code = tracker_with_phases(100, &[101, 102]);

    let outcome = run(
        &code,
        &MockOutputs::default(),
        &TriggerEvent::new(TriggerKind::IssueOrchestrate, 100),
        &options(),
    );

    assert_eq!(outcome.final_state, MachineState::OrchestrationRunning);
    assert_eq!(
        kinds(&outcome),
        vec![
            ActionKind::UpdateProjectStatus,
            ActionKind::UpdateProjectStatus,
            ActionKind::AppendHistory,
        ]
    );
    assert!(outcome.verified(), "{:#?}", outcome.verification);
    assert_eq!(
        code.item(101).expect("phase").status,
        Some(ProjectStatus::InProgress)
    );
    assert_eq!(
        code.item(102).expect("phase").status,
        Some(ProjectStatus::Ready)
    );
}

#[test]
fn dry_run_leaves_state_untouched() {
    let mut state = TrackerState::default();
    state.insert_item(assigned_issue());
    let code = tracker(state.clone());
    let mut opts = options();
    opts.runner.dry_run = true;

    let outcome = run(
        &code,
        &MockOutputs::default(),
        &TriggerEvent::new(TriggerKind::IssueAssigned, ISSUE),
        &opts,
    );

    assert!(outcome.report.dry_run);
    assert!(outcome.verification.is_none());
    assert_eq!(code.snapshot().expect("state"), state);
}

/// A failed push fails the cycle; the failure report is filed once and
/// commented on for the next failure.
#[test]
fn failed_push_files_one_failure_report() {
    let mut state = TrackerState::default();
    state.insert_item(assigned_issue());
    let code = tracker(state);
    code.fail_operation("push_branch").expect("inject");
    let mut mocks = MockOutputs::default();
    mocks.insert("iterate", json!({"summary": "Wired the login form"}));
    let event = TriggerEvent::new(TriggerKind::IssueAssigned, ISSUE);

    let outcome = run(&code, &mocks, &event, &options());
    assert!(outcome.report.failed());
    assert!(outcome.verification.is_none());
    assert_eq!(outcome.exit_code, exit_codes::FAILED);
    let pr_records = outcome
        .report
        .records
        .iter()
        .filter(|record| record.kind == ActionKind::CreatePr)
        .count();
    assert_eq!(pr_records, 0, "batch halts at the failed push");

    let config = FailureReportConfig::default();
    let details = FailureDetails {
        issue_number: ISSUE,
        trigger: event.kind.as_str(),
        run_id: outcome.run_id(),
        run_url: None,
        error: "push_branch failed",
    };
    let first = file_failure_report(&code, &config, &details).expect("first report");
    let second = file_failure_report(&code, &config, &details).expect("second report");
    let FailureReport::Created(number) = first else {
        panic!("expected a new record, got {first:?}");
    };
    assert_eq!(second, FailureReport::Commented(number));
}
