//! Test-only builders for contexts, trees, and in-memory trackers.

use std::collections::BTreeSet;

use crate::core::agent_output::GroomingRole;
use crate::core::context::{
    Context, ContextConfig, IssueContext, ItemLifecycle, ProjectStatus, QuestionStats,
    SectionFlags, SubIssue, TodoStats, TriggerKind,
};
use crate::core::tree::{BodyState, ItemState, PrSnapshot, PredictableStateTree};
use crate::io::memory::MemoryTracker;
use crate::io::tracker::{ItemRecord, TrackerState};

pub const BOT: &str = "pev-bot";
pub const REVIEWER: &str = "pev-reviewer";

/// Context for open issue #42 ("Fix login") with no status, labels, or PR.
pub fn context(trigger: TriggerKind) -> Context {
    Context {
        trigger,
        run_id: "run-1".to_string(),
        run_url: Some("https://ci.example/runs/1".to_string()),
        issue: IssueContext {
            number: 42,
            title: "Fix login".to_string(),
            lifecycle: ItemLifecycle::Open,
            status: None,
            labels: BTreeSet::new(),
            assignees: BTreeSet::new(),
            iteration: 0,
            failures: 0,
            sections: SectionFlags::default(),
            todos: TodoStats::default(),
            questions: QuestionStats::default(),
            branch: None,
            has_branch: false,
        },
        parent: None,
        sub_issues: Vec::new(),
        pr: None,
        ci_result: None,
        ci_run_url: None,
        review_decision: None,
        comment_id: None,
        config: ContextConfig {
            max_retries: 5,
            bot_username: BOT.to_string(),
            reviewer_username: REVIEWER.to_string(),
            base_branch: "main".to_string(),
            grooming_roles: GroomingRole::ALL.to_vec(),
        },
    }
}

pub fn sub_issue(number: u64, status: Option<ProjectStatus>) -> SubIssue {
    SubIssue {
        number,
        title: format!("Phase {number}"),
        lifecycle: ItemLifecycle::Open,
        status,
        assignees: BTreeSet::new(),
        todos: TodoStats::default(),
    }
}

/// Open item with default fields.
pub fn item(id: u64) -> ItemState {
    ItemState {
        id,
        ..ItemState::default()
    }
}

/// Comparison tree mirroring `ctx` (root only).
pub fn tree_for(ctx: &Context) -> PredictableStateTree {
    let issue = &ctx.issue;
    PredictableStateTree {
        root: ItemState {
            id: issue.number,
            lifecycle: issue.lifecycle,
            status: issue.status,
            iteration: issue.iteration,
            failures: issue.failures,
            labels: issue.labels.clone(),
            assignees: issue.assignees.clone(),
            has_branch: issue.has_branch,
            has_pr: ctx.pr.is_some(),
            pr: ctx.pr.as_ref().map(|pr| PrSnapshot {
                is_draft: pr.is_draft,
                state: pr.state,
            }),
            body: BodyState {
                sections: issue.sections,
                todos: issue.todos,
                questions: issue.questions,
                history: Vec::new(),
                agent_notes: Vec::new(),
                expects_open_todos: false,
            },
        },
        children: Vec::new(),
    }
}

/// Tracker holding one open issue, acting as the bot.
pub fn tracker_with_issue(number: u64, title: &str) -> MemoryTracker {
    let mut state = TrackerState::default();
    state.insert_item(ItemRecord::new(number, title));
    MemoryTracker::new(BOT, state)
}

/// Parent `number` with ready phases `phases`, acting as the bot.
pub fn tracker_with_phases(number: u64, phases: &[u64]) -> MemoryTracker {
    let mut state = TrackerState::default();
    let mut parent = ItemRecord::new(number, "Epic");
    parent.sub_issues = phases.to_vec();
    state.insert_item(parent);
    for phase in phases {
        let mut child = ItemRecord::new(*phase, format!("Phase {phase}"));
        child.parent = Some(number);
        child.status = Some(ProjectStatus::Ready);
        state.insert_item(child);
    }
    MemoryTracker::new(BOT, state)
}
