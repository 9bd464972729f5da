//! Per-action predicted effects.
//!
//! A predictor returns the set of diffs the action may produce on its target.
//! One diff is a deterministic effect; several diffs mean the real outcome
//! depends on an agent decision and the candidate set forks.

use crate::core::action::Action;
use crate::core::context::{BodySection, Context, ItemLifecycle, PrState, ProjectStatus};
use crate::core::patch::{ItemPatch, PrPatch};
use crate::core::tree::{AgentNote, HistoryEntry, ItemState};

/// Read-only inputs available to every predictor.
pub struct PredictEnv<'a> {
    pub ctx: &'a Context,
}

/// Labels applied by triage and grooming outcomes.
pub mod labels {
    pub const TRIAGED: &str = "triaged";
    pub const GROOMED: &str = "groomed";
    pub const NEEDS_INFO: &str = "needs-info";
    pub const NEEDS_SPLIT: &str = "needs-split";
}

/// Predicted diffs for `action` on `target`; `None` is the identity.
pub fn predict_action(
    action: &Action,
    target: &ItemState,
    env: &PredictEnv<'_>,
) -> Option<Vec<ItemPatch>> {
    let one = |patch: ItemPatch| Some(vec![patch]);
    match action {
        Action::UpdateProjectStatus { status, .. } => one(ItemPatch::new().status(*status)),
        Action::IncrementIteration { .. } => one(ItemPatch::new().iteration(target.iteration + 1)),
        Action::RecordFailure { .. } => one(ItemPatch::new().failures(target.failures + 1)),
        Action::ClearFailures { .. } => one(ItemPatch::new().failures(0)),
        Action::AddLabel { label, .. } => one(ItemPatch::new().add_label(label.clone())),
        Action::RemoveLabel { label, .. } => one(ItemPatch::new().remove_label(label.clone())),
        Action::AssignUser { username, .. } => one(ItemPatch::new().add_assignee(username.clone())),
        Action::UnassignUser { username, .. } => {
            one(ItemPatch::new().remove_assignee(username.clone()))
        }
        Action::AppendHistory {
            iteration,
            phase,
            message,
            commit_sha,
            run_link,
            ..
        } => one(ItemPatch::new().history(HistoryEntry {
            iteration: *iteration,
            phase: phase.clone(),
            action: message.clone(),
            commit_sha: commit_sha.clone(),
            run_link: run_link.clone(),
        })),
        Action::UpsertSection { section, .. } => one(ItemPatch::new().section(*section, true)),
        Action::CloseIssue { .. } => one(ItemPatch::new().lifecycle(ItemLifecycle::Closed)),
        Action::ReopenIssue { .. } => one(ItemPatch::new().lifecycle(ItemLifecycle::Open)),
        Action::CreateBranch { .. } => one(ItemPatch::new().has_branch(true)),
        Action::CreatePr { draft, .. } => one(ItemPatch::new().has_branch(true).pr(PrPatch {
            is_draft: Some(*draft),
            state: Some(PrState::Open),
        })),
        Action::MarkPrReady { .. } => one(ItemPatch::new().pr(PrPatch {
            is_draft: Some(false),
            state: None,
        })),
        Action::ConvertPrToDraft { .. } => one(ItemPatch::new().pr(PrPatch {
            is_draft: Some(true),
            state: None,
        })),
        Action::MergePr { .. } => one(ItemPatch::new().pr(PrPatch {
            is_draft: Some(false),
            state: Some(PrState::Merged),
        })),
        Action::ApplyTriageOutput { .. } => {
            let triaged = || {
                ItemPatch::new()
                    .add_label(labels::TRIAGED)
                    .section(BodySection::Requirements, true)
            };
            Some(vec![triaged().questions(true), triaged().questions(false)])
        }
        Action::ApplyIterateOutput { .. } => one(ItemPatch::new().agent_note(AgentNote {
            run_id: env.ctx.run_id.clone(),
            summary: String::new(),
            commit_sha: None,
        })),
        Action::RunGrooming { .. } => Some(vec![
            ItemPatch::new()
                .add_label(labels::GROOMED)
                .remove_label(labels::NEEDS_INFO)
                .status(Some(ProjectStatus::Ready))
                .section(BodySection::Approach, true)
                .todos(true),
            ItemPatch::new()
                .add_label(labels::NEEDS_INFO)
                .questions(true),
            ItemPatch::new()
                .add_label(labels::GROOMED)
                .add_label(labels::NEEDS_SPLIT),
        ]),
        Action::PushBranch { .. }
        | Action::DeleteBranch { .. }
        | Action::RequestReview { .. }
        | Action::SubmitReview { .. }
        | Action::RunAgent { .. }
        | Action::AddReaction { .. }
        | Action::Retrigger { .. }
        | Action::Log { .. }
        | Action::Stop { .. }
        | Action::Block { .. } => None,
    }
}
