//! Pure transition machine: `(context) -> (final state, actions)`.
//!
//! Routing states own an ordered guard list whose last entry always matches.
//! Every other state is final. Entering a state appends its entry actions to
//! an accumulator that is threaded through the run by value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::action::{Action, CloseReason, LogLevel};
use crate::core::agent_output::AgentMode;
use crate::core::context::{Context, ItemLifecycle, ProjectStatus, ReviewDecision, TriggerKind};
use crate::core::guards;

/// Upper bound on routing hops before the run is declared broken.
pub const MAX_STEPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineState {
    Detecting,
    Triaging,
    Grooming,
    Iterating,
    IteratingFix,
    Reviewing,
    PrReviewing,
    PrResponding,
    PrRespondingHuman,
    AwaitingMerge,
    OrchestrationRunning,
    OrchestrationWaiting,
    OrchestrationComplete,
    ProcessingCi,
    ProcessingReview,
    Commenting,
    Blocked,
    Error,
    Done,
    Reset,
    Pivot,
    LoggingMergeQueue,
    LoggingDeployment,
    Logging,
}

impl MachineState {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Detecting => "detecting",
            MachineState::Triaging => "triaging",
            MachineState::Grooming => "grooming",
            MachineState::Iterating => "iterating",
            MachineState::IteratingFix => "iterating-fix",
            MachineState::Reviewing => "reviewing",
            MachineState::PrReviewing => "pr-reviewing",
            MachineState::PrResponding => "pr-responding",
            MachineState::PrRespondingHuman => "pr-responding-human",
            MachineState::AwaitingMerge => "awaiting-merge",
            MachineState::OrchestrationRunning => "orchestration-running",
            MachineState::OrchestrationWaiting => "orchestration-waiting",
            MachineState::OrchestrationComplete => "orchestration-complete",
            MachineState::ProcessingCi => "processing-ci",
            MachineState::ProcessingReview => "processing-review",
            MachineState::Commenting => "commenting",
            MachineState::Blocked => "blocked",
            MachineState::Error => "error",
            MachineState::Done => "done",
            MachineState::Reset => "reset",
            MachineState::Pivot => "pivot",
            MachineState::LoggingMergeQueue => "logging-merge-queue",
            MachineState::LoggingDeployment => "logging-deployment",
            MachineState::Logging => "logging",
        }
    }

    pub fn is_routing(self) -> bool {
        matches!(
            self,
            MachineState::Detecting | MachineState::ProcessingCi | MachineState::ProcessingReview
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one single-shot machine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineOutcome {
    pub final_state: MachineState,
    pub actions: Vec<Action>,
    /// Every state entered, starting with `detecting`.
    pub trace: Vec<MachineState>,
}

type Guard = fn(&Context) -> bool;

const WORK_TRIGGERS: &[TriggerKind] = &[
    TriggerKind::IssueAssigned,
    TriggerKind::IssueEdited,
    TriggerKind::IssueOrchestrate,
    TriggerKind::IssueReopened,
];

fn always(_: &Context) -> bool {
    true
}

fn on_merge_queue(ctx: &Context) -> bool {
    guards::trigger_is(
        ctx,
        &[TriggerKind::MergeQueueEntered, TriggerKind::MergeQueueFailed],
    )
}

fn on_deploy(ctx: &Context) -> bool {
    guards::trigger_is(ctx, &[TriggerKind::DeployedStage, TriggerKind::DeployedProd])
}

fn on_reset(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::IssueReset
}

fn on_close_or_merge(ctx: &Context) -> bool {
    guards::trigger_is(ctx, &[TriggerKind::IssueClosed, TriggerKind::PrMerged])
}

fn on_pivot(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::IssuePivot
}

fn on_comment(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::IssueComment
}

fn on_triage(ctx: &Context) -> bool {
    guards::trigger_is(ctx, &[TriggerKind::IssueTriage, TriggerKind::IssueOpened])
}

fn on_groom(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::IssueGroom
}

fn blocked_without_resume(ctx: &Context) -> bool {
    guards::is_blocked(ctx) && !guards::is_resume_trigger(ctx)
}

fn orchestration_last_phase_complete(ctx: &Context) -> bool {
    let Some((index, _)) = guards::current_phase(ctx) else {
        return false;
    };
    guards::phase_complete(ctx)
        && !guards::orchestration_not_started(ctx)
        && ctx.sub_issues[index + 1..].iter().all(|sub| sub.is_finished())
}

fn orchestration_phase_complete(ctx: &Context) -> bool {
    guards::phase_complete(ctx) && !guards::orchestration_not_started(ctx)
}

fn on_ci(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::CiCompleted
}

fn on_review_submitted(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::PrReviewSubmitted
}

fn on_review_requested(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::PrReviewRequested && guards::has_pr(ctx)
}

fn on_pr_response(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::PrResponse && guards::has_pr(ctx)
}

fn on_pr_human_response(ctx: &Context) -> bool {
    ctx.trigger == TriggerKind::PrHumanResponse && guards::has_pr(ctx)
}

fn on_resume_assigned(ctx: &Context) -> bool {
    guards::is_resume_trigger(ctx) && guards::bot_assigned(ctx)
}

fn on_work_circuit_open(ctx: &Context) -> bool {
    guards::trigger_is(ctx, WORK_TRIGGERS) && guards::circuit_open(ctx)
}

fn on_work_ready_for_review(ctx: &Context) -> bool {
    guards::trigger_is(ctx, WORK_TRIGGERS)
        && guards::bot_assigned(ctx)
        && guards::has_pr(ctx)
        && ctx.issue.todos.total > 0
        && guards::todos_done(ctx)
}

fn on_work_assigned(ctx: &Context) -> bool {
    guards::trigger_is(ctx, WORK_TRIGGERS) && guards::bot_assigned(ctx)
}

fn informational(ctx: &Context) -> bool {
    guards::trigger_is(
        ctx,
        &[
            TriggerKind::PrOpened,
            TriggerKind::PrPush,
            TriggerKind::PrClosed,
            TriggerKind::PrReadyForReview,
            TriggerKind::MergeQueueRemoved,
            TriggerKind::IssueAssigned,
            TriggerKind::IssueEdited,
            TriggerKind::IssueOrchestrate,
            TriggerKind::IssueReopened,
            TriggerKind::IssueRetry,
            TriggerKind::IssueUnblock,
        ],
    )
}

fn ci_missing(ctx: &Context) -> bool {
    ctx.ci_result.is_none()
}

fn ci_failed_circuit_open(ctx: &Context) -> bool {
    guards::ci_failed(ctx) && guards::circuit_open(ctx)
}

fn ci_passed_todos_done(ctx: &Context) -> bool {
    guards::ci_passed(ctx) && guards::todos_done(ctx)
}

fn review_approved(ctx: &Context) -> bool {
    ctx.review_decision == Some(ReviewDecision::Approved) && guards::has_pr(ctx)
}

fn review_needs_response(ctx: &Context) -> bool {
    matches!(
        ctx.review_decision,
        Some(ReviewDecision::ChangesRequested) | Some(ReviewDecision::Commented)
    ) && guards::has_pr(ctx)
}

const DETECTING: &[(Guard, MachineState)] = &[
    (on_merge_queue, MachineState::LoggingMergeQueue),
    (on_deploy, MachineState::LoggingDeployment),
    (on_reset, MachineState::Reset),
    (on_close_or_merge, MachineState::Done),
    (guards::is_done, MachineState::Done),
    (on_pivot, MachineState::Pivot),
    (on_comment, MachineState::Commenting),
    (on_triage, MachineState::Triaging),
    (on_groom, MachineState::Grooming),
    (blocked_without_resume, MachineState::Blocked),
    (guards::all_phases_finished, MachineState::OrchestrationComplete),
    (guards::orchestration_not_started, MachineState::OrchestrationRunning),
    (orchestration_last_phase_complete, MachineState::OrchestrationComplete),
    (orchestration_phase_complete, MachineState::OrchestrationRunning),
    (guards::is_orchestration, MachineState::OrchestrationWaiting),
    (on_ci, MachineState::ProcessingCi),
    (on_review_submitted, MachineState::ProcessingReview),
    (on_review_requested, MachineState::PrReviewing),
    (on_pr_response, MachineState::PrResponding),
    (on_pr_human_response, MachineState::PrRespondingHuman),
    (on_resume_assigned, MachineState::Iterating),
    (on_work_circuit_open, MachineState::Blocked),
    (on_work_ready_for_review, MachineState::Reviewing),
    (on_work_assigned, MachineState::Iterating),
    (informational, MachineState::Logging),
    (always, MachineState::Error),
];

const PROCESSING_CI: &[(Guard, MachineState)] = &[
    (ci_missing, MachineState::Error),
    (ci_failed_circuit_open, MachineState::Blocked),
    (guards::ci_failed, MachineState::IteratingFix),
    (ci_passed_todos_done, MachineState::Reviewing),
    (guards::ci_passed, MachineState::Iterating),
    (always, MachineState::Logging),
];

const PROCESSING_REVIEW: &[(Guard, MachineState)] = &[
    (review_approved, MachineState::AwaitingMerge),
    (review_needs_response, MachineState::PrResponding),
    (always, MachineState::Error),
];

fn routes(state: MachineState) -> &'static [(Guard, MachineState)] {
    match state {
        MachineState::Detecting => DETECTING,
        MachineState::ProcessingCi => PROCESSING_CI,
        MachineState::ProcessingReview => PROCESSING_REVIEW,
        _ => &[],
    }
}

/// Next state from `state`, or `None` when `state` is final.
pub fn transition(state: MachineState, ctx: &Context) -> Option<MachineState> {
    routes(state)
        .iter()
        .find(|(guard, _)| guard(ctx))
        .map(|(_, next)| *next)
}

/// Run the machine from `detecting` to a final state.
pub fn run_machine(ctx: &Context) -> MachineOutcome {
    let mut state = MachineState::Detecting;
    let mut trace = vec![state];
    let mut actions = Vec::new();

    for _ in 0..MAX_STEPS {
        match transition(state, ctx) {
            Some(next) => {
                state = next;
                trace.push(next);
                actions = entry_actions(next, ctx, actions);
            }
            None => {
                return MachineOutcome {
                    final_state: state,
                    actions,
                    trace,
                };
            }
        }
    }

    trace.push(MachineState::Error);
    MachineOutcome {
        final_state: MachineState::Error,
        actions: entry_actions(MachineState::Error, ctx, Vec::new()),
        trace,
    }
}

fn status(issue_number: u64, status: ProjectStatus) -> Action {
    Action::UpdateProjectStatus {
        issue_number,
        status: Some(status),
    }
}

fn history(ctx: &Context, issue_number: u64, phase: String, message: String) -> Action {
    Action::AppendHistory {
        issue_number,
        iteration: ctx.issue.iteration,
        phase,
        message,
        commit_sha: None,
        run_link: ctx.run_url.clone(),
    }
}

fn log(level: LogLevel, message: String) -> Action {
    Action::Log { level, message }
}

fn run_agent(ctx: &Context, mode: AgentMode) -> Action {
    Action::RunAgent {
        issue_number: ctx.issue.number,
        mode,
        artifact: Some(mode.as_str().to_string()),
    }
}

fn apply_iterate(ctx: &Context, mode: AgentMode) -> Action {
    Action::ApplyIterateOutput {
        issue_number: ctx.issue.number,
        mode,
        artifact: Some(mode.as_str().to_string()),
    }
}

fn push_branch(ctx: &Context) -> Action {
    let branch_name = match &ctx.pr {
        Some(pr) => pr.head_ref.clone(),
        None => ctx.branch_name(),
    };
    Action::PushBranch {
        issue_number: ctx.issue.number,
        branch_name,
    }
}

fn ensure_in_progress(ctx: &Context, actions: &mut Vec<Action>) {
    if ctx.issue.status != Some(ProjectStatus::InProgress) {
        actions.push(status(ctx.issue.number, ProjectStatus::InProgress));
    }
}

/// Append the entry actions of `state` to `acc`.
pub fn entry_actions(state: MachineState, ctx: &Context, mut acc: Vec<Action>) -> Vec<Action> {
    let number = ctx.issue.number;
    let bot = ctx.config.bot_username.clone();
    match state {
        MachineState::Detecting | MachineState::ProcessingReview => {}
        MachineState::ProcessingCi => {
            if guards::ci_passed(ctx) && ctx.issue.failures > 0 {
                acc.push(Action::ClearFailures {
                    issue_number: number,
                });
            }
        }
        MachineState::Triaging => {
            acc.push(run_agent(ctx, AgentMode::Triage));
            acc.push(Action::ApplyTriageOutput {
                issue_number: number,
                artifact: Some(AgentMode::Triage.as_str().to_string()),
            });
        }
        MachineState::Grooming => {
            acc.push(Action::RunGrooming {
                issue_number: number,
                roles: ctx.config.grooming_roles.clone(),
            });
        }
        MachineState::Iterating => {
            if guards::is_resume_trigger(ctx) && ctx.issue.failures > 0 {
                acc.push(Action::ClearFailures {
                    issue_number: number,
                });
            }
            ensure_in_progress(ctx, &mut acc);
            if !ctx.issue.has_branch {
                acc.push(Action::CreateBranch {
                    issue_number: number,
                    branch_name: ctx.branch_name(),
                    base_branch: ctx.config.base_branch.clone(),
                });
            }
            acc.push(Action::IncrementIteration {
                issue_number: number,
            });
            acc.push(run_agent(ctx, AgentMode::Iterate));
            acc.push(apply_iterate(ctx, AgentMode::Iterate));
            acc.push(push_branch(ctx));
            if ctx.pr.is_none() {
                acc.push(Action::CreatePr {
                    issue_number: number,
                    branch_name: ctx.branch_name(),
                    base_branch: ctx.config.base_branch.clone(),
                    title: ctx.issue.title.clone(),
                    draft: true,
                });
            }
        }
        MachineState::IteratingFix => {
            acc.push(Action::RecordFailure {
                issue_number: number,
            });
            ensure_in_progress(ctx, &mut acc);
            acc.push(Action::IncrementIteration {
                issue_number: number,
            });
            acc.push(run_agent(ctx, AgentMode::FixCi));
            acc.push(apply_iterate(ctx, AgentMode::FixCi));
            acc.push(push_branch(ctx));
        }
        MachineState::Reviewing => {
            match &ctx.pr {
                None => acc.push(Action::CreatePr {
                    issue_number: number,
                    branch_name: ctx.branch_name(),
                    base_branch: ctx.config.base_branch.clone(),
                    title: ctx.issue.title.clone(),
                    draft: false,
                }),
                Some(pr) if pr.is_draft => acc.push(Action::MarkPrReady {
                    pr_number: pr.number,
                }),
                Some(_) => {}
            }
            acc.push(status(number, ProjectStatus::InReview));
            if let Some(pr) = &ctx.pr {
                acc.push(Action::RequestReview {
                    pr_number: pr.number,
                    reviewer: ctx.config.reviewer_username.clone(),
                });
            }
            acc.push(Action::Retrigger {
                issue_number: number,
                trigger: TriggerKind::PrReviewRequested,
            });
        }
        MachineState::PrReviewing => {
            if let Some(pr) = &ctx.pr {
                acc.push(run_agent(ctx, AgentMode::Review));
                acc.push(Action::SubmitReview {
                    pr_number: pr.number,
                    artifact: Some(AgentMode::Review.as_str().to_string()),
                });
            }
        }
        MachineState::PrResponding | MachineState::PrRespondingHuman => {
            let mode = if state == MachineState::PrResponding {
                AgentMode::PrResponse
            } else {
                AgentMode::PrHumanResponse
            };
            if let Some(pr) = &ctx.pr
                && !pr.is_draft
            {
                acc.push(Action::ConvertPrToDraft {
                    pr_number: pr.number,
                });
            }
            ensure_in_progress(ctx, &mut acc);
            acc.push(Action::IncrementIteration {
                issue_number: number,
            });
            acc.push(run_agent(ctx, mode));
            acc.push(apply_iterate(ctx, mode));
            acc.push(push_branch(ctx));
        }
        MachineState::AwaitingMerge => {
            if let Some(pr) = &ctx.pr {
                acc.push(Action::MergePr {
                    pr_number: pr.number,
                });
            }
        }
        MachineState::OrchestrationRunning => orchestration_running(ctx, &bot, &mut acc),
        MachineState::OrchestrationWaiting => {
            if let Some((index, sub)) = guards::current_phase(ctx) {
                if sub.status != Some(ProjectStatus::InProgress) {
                    acc.push(status(sub.number, ProjectStatus::InProgress));
                }
                if !sub.assignees.contains(&bot) {
                    acc.push(Action::AssignUser {
                        issue_number: sub.number,
                        username: bot.clone(),
                    });
                }
                acc.push(log(
                    LogLevel::Info,
                    format!(
                        "#{number}: waiting on phase {} of {} (#{})",
                        index + 1,
                        ctx.sub_issues.len(),
                        sub.number
                    ),
                ));
            }
        }
        MachineState::OrchestrationComplete => {
            if let Some((_, sub)) = guards::current_phase(ctx) {
                acc.push(status(sub.number, ProjectStatus::Done));
                acc.push(Action::CloseIssue {
                    issue_number: sub.number,
                    reason: CloseReason::Completed,
                });
            }
            let total = ctx.sub_issues.len();
            acc.push(status(number, ProjectStatus::Done));
            acc.push(Action::CloseIssue {
                issue_number: number,
                reason: CloseReason::Completed,
            });
            acc.push(history(
                ctx,
                number,
                total.to_string(),
                format!("✅ All {total} phases complete"),
            ));
        }
        MachineState::Blocked => {
            if guards::is_blocked(ctx) {
                acc.push(log(
                    LogLevel::Info,
                    format!("#{number} is already blocked; ignoring {}", ctx.trigger),
                ));
                acc.push(Action::Stop {
                    reason: "already blocked".to_string(),
                });
            } else {
                if ctx.bot_assigned() {
                    acc.push(Action::UnassignUser {
                        issue_number: number,
                        username: bot,
                    });
                }
                acc.push(status(number, ProjectStatus::Blocked));
                let reason = format!(
                    "{} failures reached max retries ({})",
                    ctx.issue.failures, ctx.config.max_retries
                );
                acc.push(history(
                    ctx,
                    number,
                    ctx.phase_label(),
                    format!("⛔ Blocked: {reason}"),
                ));
                acc.push(Action::Block {
                    issue_number: number,
                    reason,
                });
            }
        }
        MachineState::Done => {
            let already_done = ctx.issue.status == Some(ProjectStatus::Done)
                && ctx.issue.lifecycle == ItemLifecycle::Closed;
            if already_done {
                acc.push(log(
                    LogLevel::Info,
                    format!("#{number} is already done; ignoring {}", ctx.trigger),
                ));
                acc.push(Action::Stop {
                    reason: "already done".to_string(),
                });
            } else {
                if ctx.issue.status != Some(ProjectStatus::Done) {
                    acc.push(status(number, ProjectStatus::Done));
                }
                if ctx.issue.lifecycle == ItemLifecycle::Open {
                    acc.push(Action::CloseIssue {
                        issue_number: number,
                        reason: CloseReason::Completed,
                    });
                }
                let message = match (&ctx.pr, ctx.trigger) {
                    (Some(pr), TriggerKind::PrMerged) => format!("✅ Merged PR #{}", pr.number),
                    _ => "✅ Done".to_string(),
                };
                acc.push(history(ctx, number, ctx.phase_label(), message));
            }
        }
        MachineState::Reset => {
            acc.push(status(number, ProjectStatus::Backlog));
            if ctx.bot_assigned() {
                acc.push(Action::UnassignUser {
                    issue_number: number,
                    username: bot,
                });
            }
            if ctx.issue.failures > 0 {
                acc.push(Action::ClearFailures {
                    issue_number: number,
                });
            }
            if ctx.issue.lifecycle == ItemLifecycle::Closed {
                acc.push(Action::ReopenIssue {
                    issue_number: number,
                });
            }
        }
        MachineState::Pivot => acc.push(run_agent(ctx, AgentMode::Pivot)),
        MachineState::Commenting => {
            if let Some(comment_id) = ctx.comment_id {
                acc.push(Action::AddReaction {
                    subject_id: comment_id,
                    content: "eyes".to_string(),
                });
            }
            acc.push(run_agent(ctx, AgentMode::Comment));
        }
        MachineState::LoggingMergeQueue | MachineState::LoggingDeployment => {
            let message = match ctx.trigger {
                TriggerKind::MergeQueueEntered => "🚦 Entered merge queue",
                TriggerKind::MergeQueueFailed => "❌ Failed in merge queue",
                TriggerKind::DeployedStage => "🚀 Deployed to stage",
                TriggerKind::DeployedProd => "🚀 Deployed to production",
                _ => "📝 Event recorded",
            };
            acc.push(history(ctx, number, ctx.phase_label(), message.to_string()));
            acc.push(log(LogLevel::Info, format!("#{number}: {}", ctx.trigger)));
        }
        MachineState::Logging => {
            acc.push(log(
                LogLevel::Info,
                format!("#{number}: no work for {}", ctx.trigger),
            ));
        }
        MachineState::Error => {
            let reason = format!("no transition for {} on #{number}", ctx.trigger);
            acc.push(log(LogLevel::Error, reason.clone()));
            acc.push(Action::Block {
                issue_number: number,
                reason,
            });
        }
    }
    acc
}

fn orchestration_running(ctx: &Context, bot: &str, acc: &mut Vec<Action>) {
    let number = ctx.issue.number;
    let total = ctx.sub_issues.len();
    let Some((index, current)) = guards::current_phase(ctx) else {
        return;
    };

    if guards::orchestration_not_started(ctx) {
        acc.push(status(number, ProjectStatus::InProgress));
        acc.push(status(current.number, ProjectStatus::InProgress));
        acc.push(history(
            ctx,
            number,
            (index + 1).to_string(),
            format!("🚀 Started orchestration: {total} phases"),
        ));
        return;
    }

    acc.push(status(current.number, ProjectStatus::Done));
    acc.push(Action::CloseIssue {
        issue_number: current.number,
        reason: CloseReason::Completed,
    });
    let next = ctx.sub_issues[index + 1..]
        .iter()
        .enumerate()
        .find(|(_, sub)| !sub.is_finished())
        .map(|(offset, sub)| (index + 1 + offset, sub));
    if let Some((next_index, next)) = next {
        acc.push(status(next.number, ProjectStatus::InProgress));
        acc.push(Action::AssignUser {
            issue_number: next.number,
            username: bot.to_string(),
        });
        acc.push(history(
            ctx,
            number,
            (next_index + 1).to_string(),
            format!(
                "⏭️ Phase {} complete, starting phase {} of {total}",
                index + 1,
                next_index + 1
            ),
        ));
        acc.push(Action::Retrigger {
            issue_number: next.number,
            trigger: TriggerKind::IssueAssigned,
        });
    }
}
