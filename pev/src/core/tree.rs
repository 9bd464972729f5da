//! Comparison-oriented snapshot of an item and its sub-items.
//!
//! The tree is deliberately reduced: it carries only the fields the predictor
//! can reason about and the comparator can check with a well-defined tolerance.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::context::{ItemLifecycle, PrState, ProjectStatus, QuestionStats, SectionFlags, TodoStats};

/// Root item plus its ordered children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictableStateTree {
    pub root: ItemState,
    #[serde(default)]
    pub children: Vec<ItemState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    pub id: u64,
    #[serde(rename = "lifecycleState")]
    pub lifecycle: ItemLifecycle,
    pub status: Option<ProjectStatus>,
    pub iteration: u32,
    pub failures: u32,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    pub has_branch: bool,
    pub has_pr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrSnapshot>,
    #[serde(default)]
    pub body: BodyState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrSnapshot {
    pub is_draft: bool,
    pub state: PrState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BodyState {
    pub sections: SectionFlags,
    #[serde(rename = "todoStats")]
    pub todos: TodoStats,
    #[serde(rename = "questionStats")]
    pub questions: QuestionStats,
    #[serde(rename = "historyEntries")]
    pub history: Vec<HistoryEntry>,
    pub agent_notes: Vec<AgentNote>,
    /// Set on candidates that expect new open todos; turns the unchecked
    /// counters into floors.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub expects_open_todos: bool,
}

/// One row of the item's iteration history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub iteration: u32,
    pub phase: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_link: Option<String>,
}

impl HistoryEntry {
    pub fn new(iteration: u32, phase: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            iteration,
            phase: phase.into(),
            action: action.into(),
            commit_sha: None,
            run_link: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNote {
    pub run_id: String,
    pub summary: String,
    /// Commit the run produced, when it reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

impl PredictableStateTree {
    /// Clone with every history list emptied.
    ///
    /// Prediction asserts only newly predicted history; existing rows are never
    /// re-verified.
    pub fn for_prediction(&self) -> Self {
        let mut tree = self.clone();
        tree.root.body.history.clear();
        for child in &mut tree.children {
            child.body.history.clear();
        }
        tree
    }

    pub fn node(&self, id: u64) -> Option<&ItemState> {
        if self.root.id == id {
            return Some(&self.root);
        }
        self.children.iter().find(|child| child.id == id)
    }

    /// Resolve an action target; `None` means the root.
    pub fn node_mut(&mut self, id: Option<u64>) -> Option<&mut ItemState> {
        match id {
            None => Some(&mut self.root),
            Some(id) if id == self.root.id => Some(&mut self.root),
            Some(id) => self.children.iter_mut().find(|child| child.id == id),
        }
    }
}
