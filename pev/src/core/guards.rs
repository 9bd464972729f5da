//! Side-effect-free predicates over [`Context`].

use crate::core::context::{CiResult, Context, ItemLifecycle, ProjectStatus, SubIssue, TriggerKind};

pub fn circuit_open(ctx: &Context) -> bool {
    ctx.issue.failures >= ctx.config.max_retries
}

pub fn ci_failed(ctx: &Context) -> bool {
    ctx.ci_result == Some(CiResult::Failure)
}

pub fn ci_passed(ctx: &Context) -> bool {
    ctx.ci_result == Some(CiResult::Success)
}

pub fn has_pr(ctx: &Context) -> bool {
    ctx.pr.is_some()
}

pub fn bot_assigned(ctx: &Context) -> bool {
    ctx.bot_assigned()
}

/// An item with sub-items is driven phase by phase.
pub fn is_orchestration(ctx: &Context) -> bool {
    !ctx.sub_issues.is_empty()
}

/// First phase that is neither done nor closed.
pub fn current_phase(ctx: &Context) -> Option<(usize, &SubIssue)> {
    ctx.sub_issues
        .iter()
        .enumerate()
        .find(|(_, sub)| !sub.is_finished())
}

pub fn all_phases_finished(ctx: &Context) -> bool {
    is_orchestration(ctx) && current_phase(ctx).is_none()
}

/// The parent has not been started yet: no status beyond ready.
pub fn orchestration_not_started(ctx: &Context) -> bool {
    is_orchestration(ctx)
        && matches!(
            ctx.issue.status,
            None | Some(ProjectStatus::Backlog) | Some(ProjectStatus::Ready)
        )
}

/// Current phase has every non-manual todo checked.
pub fn phase_complete(ctx: &Context) -> bool {
    current_phase(ctx).is_some_and(|(_, sub)| sub.todos_complete())
}

pub fn is_done(ctx: &Context) -> bool {
    ctx.issue.status == Some(ProjectStatus::Done) || ctx.issue.lifecycle == ItemLifecycle::Closed
}

pub fn is_blocked(ctx: &Context) -> bool {
    ctx.issue.status == Some(ProjectStatus::Blocked)
}

pub fn todos_done(ctx: &Context) -> bool {
    ctx.issue.todos.unchecked_non_manual == 0
}

/// Triggers that explicitly ask to resume after a stop.
pub fn is_resume_trigger(ctx: &Context) -> bool {
    matches!(ctx.trigger, TriggerKind::IssueRetry | TriggerKind::IssueUnblock)
}

pub fn trigger_is(ctx: &Context, kinds: &[TriggerKind]) -> bool {
    kinds.contains(&ctx.trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, sub_issue};

    #[test]
    fn circuit_opens_at_max_retries() {
        let mut ctx = context(TriggerKind::CiCompleted);
        ctx.config.max_retries = 3;
        ctx.issue.failures = 2;
        assert!(!circuit_open(&ctx));
        ctx.issue.failures = 3;
        assert!(circuit_open(&ctx));
    }

    /// The current phase skips closed and done sub-items.
    #[test]
    fn current_phase_is_first_unfinished() {
        let mut ctx = context(TriggerKind::IssueOrchestrate);
        let mut first = sub_issue(101, Some(ProjectStatus::Done));
        first.lifecycle = ItemLifecycle::Closed;
        ctx.sub_issues = vec![first, sub_issue(102, Some(ProjectStatus::InProgress))];
        let (index, sub) = current_phase(&ctx).expect("phase");
        assert_eq!(index, 1);
        assert_eq!(sub.number, 102);
    }

    #[test]
    fn phase_complete_ignores_manual_todos() {
        let mut ctx = context(TriggerKind::IssueOrchestrate);
        let mut sub = sub_issue(101, Some(ProjectStatus::InProgress));
        sub.todos.total = 3;
        sub.todos.completed = 2;
        sub.todos.unchecked_non_manual = 0;
        ctx.sub_issues = vec![sub];
        assert!(phase_complete(&ctx));
    }

    #[test]
    fn not_started_requires_children() {
        let ctx = context(TriggerKind::IssueOrchestrate);
        assert!(!orchestration_not_started(&ctx));
    }
}
