//! Typed diffs applied to [`ItemState`] during prediction.
//!
//! A patch is the typed form of a deep-merge: set-valued fields carry explicit
//! add/remove operators, nested records recurse, scalars overwrite. Unset
//! fields leave the target untouched.

use std::collections::BTreeSet;

use crate::core::context::{BodySection, ItemLifecycle, PrState, ProjectStatus};
use crate::core::tree::{AgentNote, HistoryEntry, ItemState, PrSnapshot};

/// Element-wise set patch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListPatch {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl ListPatch {
    /// Removals apply before additions.
    pub fn apply_to(&self, set: &mut BTreeSet<String>) {
        for value in &self.remove {
            set.remove(value);
        }
        for value in &self.add {
            set.insert(value.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrPatch {
    pub is_draft: Option<bool>,
    pub state: Option<PrState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BodyPatch {
    pub sections: Vec<(BodySection, bool)>,
    /// `Some(true)` expects at least one unanswered question.
    pub questions_open: Option<bool>,
    /// `Some(true)` expects at least one new unchecked, non-manual todo.
    pub todos_open: Option<bool>,
    pub history: Vec<HistoryEntry>,
    pub agent_notes: Vec<AgentNote>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemPatch {
    pub lifecycle: Option<ItemLifecycle>,
    /// Outer `None` leaves the status alone; `Some(None)` clears it.
    pub status: Option<Option<ProjectStatus>>,
    pub iteration: Option<u32>,
    pub failures: Option<u32>,
    pub labels: ListPatch,
    pub assignees: ListPatch,
    pub has_branch: Option<bool>,
    pub has_pr: Option<bool>,
    pub pr: Option<PrPatch>,
    pub body: BodyPatch,
}

impl ItemPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle(mut self, lifecycle: ItemLifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn status(mut self, status: Option<ProjectStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn failures(mut self, failures: u32) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn add_label(mut self, label: impl Into<String>) -> Self {
        self.labels.add.push(label.into());
        self
    }

    pub fn remove_label(mut self, label: impl Into<String>) -> Self {
        self.labels.remove.push(label.into());
        self
    }

    pub fn add_assignee(mut self, user: impl Into<String>) -> Self {
        self.assignees.add.push(user.into());
        self
    }

    pub fn remove_assignee(mut self, user: impl Into<String>) -> Self {
        self.assignees.remove.push(user.into());
        self
    }

    pub fn has_branch(mut self, present: bool) -> Self {
        self.has_branch = Some(present);
        self
    }

    pub fn pr(mut self, patch: PrPatch) -> Self {
        self.has_pr = Some(true);
        self.pr = Some(patch);
        self
    }

    pub fn section(mut self, section: BodySection, present: bool) -> Self {
        self.body.sections.push((section, present));
        self
    }

    pub fn questions(mut self, present: bool) -> Self {
        self.body.questions_open = Some(present);
        self.section(BodySection::Questions, present)
    }

    pub fn todos(mut self, present: bool) -> Self {
        self.body.todos_open = Some(present);
        self.section(BodySection::Todos, present)
    }

    pub fn history(mut self, entry: HistoryEntry) -> Self {
        self.body.history.push(entry);
        self
    }

    pub fn agent_note(mut self, note: AgentNote) -> Self {
        self.body.agent_notes.push(note);
        self
    }

    /// Deep-merge this patch into `target`.
    pub fn apply_to(&self, target: &mut ItemState) {
        if let Some(lifecycle) = self.lifecycle {
            target.lifecycle = lifecycle;
        }
        if let Some(status) = self.status {
            target.status = status;
        }
        if let Some(iteration) = self.iteration {
            target.iteration = iteration;
        }
        if let Some(failures) = self.failures {
            target.failures = failures;
        }
        self.labels.apply_to(&mut target.labels);
        self.assignees.apply_to(&mut target.assignees);
        if let Some(has_branch) = self.has_branch {
            target.has_branch = has_branch;
        }
        if let Some(has_pr) = self.has_pr {
            target.has_pr = has_pr;
        }
        if let Some(pr) = &self.pr {
            let snapshot = target.pr.get_or_insert(PrSnapshot {
                is_draft: false,
                state: PrState::Open,
            });
            if let Some(is_draft) = pr.is_draft {
                snapshot.is_draft = is_draft;
            }
            if let Some(state) = pr.state {
                snapshot.state = state;
            }
        }

        let body = &mut target.body;
        for (section, present) in &self.body.sections {
            body.sections.set(*section, *present);
        }
        if self.body.questions_open == Some(true) {
            body.questions.unanswered = body.questions.unanswered.max(1);
            body.questions.total = body.questions.total.max(body.questions.unanswered);
        }
        if self.body.todos_open == Some(true) {
            let todos = &mut body.todos;
            todos.unchecked_non_manual = todos.unchecked_non_manual.max(1);
            todos.total = todos
                .total
                .max(todos.completed + todos.unchecked_non_manual);
            body.expects_open_todos = true;
        }
        body.history.extend(self.body.history.iter().cloned());
        body.agent_notes.extend(self.body.agent_notes.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Set operators patch element-wise; scalars overwrite; history appends.
    #[test]
    fn apply_merges_each_field_kind() {
        let mut item = ItemState {
            id: 1,
            labels: ["bug".to_string(), "stale".to_string()].into_iter().collect(),
            iteration: 2,
            ..ItemState::default()
        };
        item.body.history.push(HistoryEntry::new(1, "-", "first"));

        ItemPatch::new()
            .add_label("triaged")
            .remove_label("stale")
            .iteration(3)
            .status(Some(ProjectStatus::InProgress))
            .history(HistoryEntry::new(3, "-", "second"))
            .apply_to(&mut item);

        let labels: Vec<&str> = item.labels.iter().map(String::as_str).collect();
        assert_eq!(labels, vec!["bug", "triaged"]);
        assert_eq!(item.iteration, 3);
        assert_eq!(item.status, Some(ProjectStatus::InProgress));
        assert_eq!(item.body.history.len(), 2);
    }

    /// `status(None)` clears the status, an untouched patch leaves it alone.
    #[test]
    fn status_clear_is_distinct_from_unset() {
        let mut item = ItemState {
            status: Some(ProjectStatus::Ready),
            ..ItemState::default()
        };
        ItemPatch::new().apply_to(&mut item);
        assert_eq!(item.status, Some(ProjectStatus::Ready));
        ItemPatch::new().status(None).apply_to(&mut item);
        assert_eq!(item.status, None);
    }

    /// An open-todo expectation raises both counters and marks the floor.
    #[test]
    fn todos_patch_expects_unchecked_todo() {
        let mut item = ItemState::default();
        item.body.todos.total = 2;
        item.body.todos.completed = 2;
        ItemPatch::new().todos(true).apply_to(&mut item);
        assert!(item.body.sections.has_todos);
        assert!(item.body.expects_open_todos);
        assert_eq!(item.body.todos.unchecked_non_manual, 1);
        assert_eq!(item.body.todos.unchecked(), 1);
        assert_eq!(item.body.todos.total, 3);
    }

    #[test]
    fn pr_patch_creates_snapshot() {
        let mut item = ItemState::default();
        ItemPatch::new()
            .pr(PrPatch {
                is_draft: Some(true),
                state: None,
            })
            .apply_to(&mut item);
        assert!(item.has_pr);
        assert_eq!(
            item.pr,
            Some(PrSnapshot {
                is_draft: true,
                state: PrState::Open
            })
        );
    }
}
