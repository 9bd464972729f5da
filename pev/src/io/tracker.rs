//! Issue-tracker and git-host seam.
//!
//! The [`Tracker`] trait is the only way the engine touches the system of
//! record. Implementations must make every operation idempotent or safely
//! re-entrant: a cycle may be re-run after partial failure.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::context::{
    BodySection, CiResult, ItemLifecycle, PrState, ProjectStatus, QuestionStats, ReviewDecision,
    SectionFlags, TodoStats, TriggerKind,
};
use crate::core::tree::{AgentNote, HistoryEntry};

/// Externally supplied trigger payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub issue_number: u64,
    #[serde(default)]
    pub ci_result: Option<CiResult>,
    #[serde(default)]
    pub ci_run_url: Option<String>,
    #[serde(default)]
    pub review_decision: Option<ReviewDecision>,
    #[serde(default)]
    pub comment_id: Option<u64>,
    #[serde(default)]
    pub run_url: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, issue_number: u64) -> Self {
        Self {
            kind,
            issue_number,
            ci_result: None,
            ci_run_url: None,
            review_decision: None,
            comment_id: None,
            run_url: None,
            run_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionItem {
    pub text: String,
    #[serde(default)]
    pub answered: bool,
}

/// Structured item body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BodyRecord {
    pub sections: BTreeMap<BodySection, String>,
    pub todos: Vec<TodoItem>,
    pub questions: Vec<QuestionItem>,
    pub history: Vec<HistoryEntry>,
    pub agent_notes: Vec<AgentNote>,
}

impl BodyRecord {
    pub fn section_flags(&self) -> SectionFlags {
        let mut flags = SectionFlags::from_sections(
            self.sections
                .iter()
                .filter(|(_, content)| !content.trim().is_empty())
                .map(|(section, _)| *section),
        );
        if !self.todos.is_empty() {
            flags.set(BodySection::Todos, true);
        }
        if !self.questions.is_empty() {
            flags.set(BodySection::Questions, true);
        }
        if !self.agent_notes.is_empty() {
            flags.set(BodySection::AgentNotes, true);
        }
        if !self.history.is_empty() {
            flags.set(BodySection::IterationHistory, true);
        }
        flags
    }

    pub fn todo_stats(&self) -> TodoStats {
        let completed = self.todos.iter().filter(|todo| todo.checked).count();
        let unchecked_non_manual = self
            .todos
            .iter()
            .filter(|todo| !todo.checked && !todo.manual)
            .count();
        TodoStats {
            total: count(self.todos.len()),
            completed: count(completed),
            unchecked_non_manual: count(unchecked_non_manual),
        }
    }

    pub fn question_stats(&self) -> QuestionStats {
        let unanswered = self.questions.iter().filter(|q| !q.answered).count();
        QuestionStats {
            total: count(self.questions.len()),
            unanswered: count(unanswered),
        }
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub lifecycle: ItemLifecycle,
    #[serde(default)]
    pub status: Option<ProjectStatus>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub parent: Option<u64>,
    /// Ordered phases.
    #[serde(default)]
    pub sub_issues: Vec<u64>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub pr: Option<u64>,
    #[serde(default)]
    pub body: BodyRecord,
}

impl ItemRecord {
    pub fn new(number: u64, title: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            lifecycle: ItemLifecycle::Open,
            status: None,
            labels: BTreeSet::new(),
            assignees: BTreeSet::new(),
            iteration: 0,
            failures: 0,
            parent: None,
            sub_issues: Vec::new(),
            branch: None,
            pr: None,
            body: BodyRecord::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrRecord {
    pub number: u64,
    pub issue_number: u64,
    pub title: String,
    pub head_ref: String,
    pub base_ref: String,
    pub is_draft: bool,
    pub state: PrState,
    pub author: String,
    #[serde(default)]
    pub requested_reviewers: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub name: String,
    pub base: String,
    /// Base has moved since the branch was cut.
    #[serde(default)]
    pub behind_base: bool,
    #[serde(default)]
    pub pushes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub pr_number: u64,
    pub reviewer: String,
    pub decision: ReviewDecision,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRecord {
    pub subject_id: u64,
    pub content: String,
    pub by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub issue_number: u64,
    pub trigger: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub issue_number: u64,
    pub body: String,
    pub by: String,
}

/// Which credential performed which mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub identity: String,
    pub operation: String,
}

/// Serializable system-of-record snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerState {
    pub items: BTreeMap<u64, ItemRecord>,
    pub pull_requests: BTreeMap<u64, PrRecord>,
    pub branches: BTreeMap<String, BranchRecord>,
    pub dispatches: Vec<DispatchRecord>,
    pub reactions: Vec<ReactionRecord>,
    pub reviews: Vec<ReviewRecord>,
    pub comments: Vec<CommentRecord>,
    pub audit: Vec<AuditEntry>,
    /// Operation names (e.g. `push_branch`) that fail when attempted.
    pub fail_operations: BTreeSet<String>,
}

impl TrackerState {
    /// Next free number shared by items and pull requests.
    pub fn next_number(&self) -> u64 {
        let max_item = self.items.keys().next_back().copied().unwrap_or(0);
        let max_pr = self.pull_requests.keys().next_back().copied().unwrap_or(0);
        max_item.max(max_pr) + 1
    }

    pub fn insert_item(&mut self, item: ItemRecord) {
        self.items.insert(item.number, item);
    }
}

/// Outcome of creating a branch that may already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    Created,
    Existed { behind: bool },
}

/// Operations the engine performs against the system of record.
///
/// All methods take `&self`: implementations hold their own synchronization so
/// that code- and review-scoped handles may share one backend.
pub trait Tracker {
    /// Credential identity this handle acts as.
    fn identity(&self) -> &str;

    fn item(&self, number: u64) -> Result<ItemRecord>;
    fn pull_request(&self, number: u64) -> Result<PrRecord>;
    fn branch_exists(&self, name: &str) -> Result<bool>;

    fn set_status(&self, number: u64, status: Option<ProjectStatus>) -> Result<()>;
    /// Returns the new iteration count.
    fn increment_iteration(&self, number: u64) -> Result<u32>;
    /// Returns the new failure count.
    fn record_failure(&self, number: u64) -> Result<u32>;
    fn clear_failures(&self, number: u64) -> Result<()>;
    fn add_label(&self, number: u64, label: &str) -> Result<()>;
    fn remove_label(&self, number: u64, label: &str) -> Result<()>;
    fn assign(&self, number: u64, username: &str) -> Result<()>;
    fn unassign(&self, number: u64, username: &str) -> Result<()>;
    /// Returns `false` when an identical row already exists.
    fn append_history(&self, number: u64, entry: HistoryEntry) -> Result<bool>;
    fn upsert_section(&self, number: u64, section: BodySection, content: &str) -> Result<()>;
    fn add_questions(&self, number: u64, questions: &[String]) -> Result<()>;
    fn add_todos(&self, number: u64, todos: &[String]) -> Result<()>;
    /// Checks matching todos; returns how many changed.
    fn check_todos(&self, number: u64, texts: &[String]) -> Result<u32>;
    fn add_agent_note(&self, number: u64, note: AgentNote) -> Result<()>;
    fn set_lifecycle(&self, number: u64, lifecycle: ItemLifecycle) -> Result<()>;

    fn create_branch(&self, number: u64, name: &str, base: &str) -> Result<BranchOutcome>;
    fn rebase_branch(&self, name: &str) -> Result<()>;
    fn push_branch(&self, name: &str) -> Result<()>;
    fn delete_branch(&self, name: &str) -> Result<()>;

    /// Idempotent per head branch: an open PR for `branch` is returned as is.
    fn create_pr(
        &self,
        number: u64,
        branch: &str,
        base: &str,
        title: &str,
        draft: bool,
    ) -> Result<u64>;
    fn set_pr_draft(&self, pr_number: u64, draft: bool) -> Result<()>;
    fn request_review(&self, pr_number: u64, reviewer: &str) -> Result<()>;
    fn submit_review(&self, pr_number: u64, decision: ReviewDecision, body: &str) -> Result<()>;
    fn merge_pr(&self, pr_number: u64) -> Result<()>;

    fn add_reaction(&self, subject_id: u64, content: &str) -> Result<()>;
    fn dispatch(&self, number: u64, trigger: TriggerKind) -> Result<()>;

    fn find_open_issue_by_title(&self, title: &str) -> Result<Option<u64>>;
    fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64>;
    fn comment(&self, number: u64, body: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_stats_count_manual_todos_separately() {
        let body = BodyRecord {
            todos: vec![
                TodoItem {
                    text: "a".to_string(),
                    checked: true,
                    manual: false,
                },
                TodoItem {
                    text: "b".to_string(),
                    checked: false,
                    manual: true,
                },
                TodoItem {
                    text: "c".to_string(),
                    checked: false,
                    manual: false,
                },
            ],
            ..BodyRecord::default()
        };
        let stats = body.todo_stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.unchecked_non_manual, 1);
        assert!(body.section_flags().has_todos);
    }

    /// Blank sections do not count as present.
    #[test]
    fn blank_sections_are_absent() {
        let mut body = BodyRecord::default();
        body.sections
            .insert(BodySection::Requirements, "  ".to_string());
        body.sections
            .insert(BodySection::Description, "text".to_string());
        let flags = body.section_flags();
        assert!(!flags.has_requirements);
        assert!(flags.has_description);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = TrackerState::default();
        let mut item = ItemRecord::new(3, "Fix login");
        item.body
            .sections
            .insert(BodySection::Description, "broken".to_string());
        state.insert_item(item);
        let json = serde_json::to_string(&state).expect("serialize");
        let back: TrackerState = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, state);
        assert_eq!(back.next_number(), 4);
    }
}
