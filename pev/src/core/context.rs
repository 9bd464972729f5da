//! Read-only invocation context consumed by the transition machine.
//!
//! A [`Context`] is built fresh from the system of record at the start of every
//! invocation and is never mutated afterwards. Everything the machine decides is
//! a pure function of this value.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Discrete trigger kinds delivered by the external event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    IssueOpened,
    IssueAssigned,
    IssueEdited,
    IssueClosed,
    IssueReopened,
    IssueTriage,
    IssueGroom,
    IssueComment,
    IssueOrchestrate,
    IssueReset,
    IssuePivot,
    IssueRetry,
    IssueUnblock,
    PrOpened,
    PrPush,
    PrReadyForReview,
    PrReviewRequested,
    PrReviewSubmitted,
    PrResponse,
    PrHumanResponse,
    PrMerged,
    PrClosed,
    CiCompleted,
    MergeQueueEntered,
    MergeQueueFailed,
    MergeQueueRemoved,
    DeployedStage,
    DeployedProd,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 28] = [
        TriggerKind::IssueOpened,
        TriggerKind::IssueAssigned,
        TriggerKind::IssueEdited,
        TriggerKind::IssueClosed,
        TriggerKind::IssueReopened,
        TriggerKind::IssueTriage,
        TriggerKind::IssueGroom,
        TriggerKind::IssueComment,
        TriggerKind::IssueOrchestrate,
        TriggerKind::IssueReset,
        TriggerKind::IssuePivot,
        TriggerKind::IssueRetry,
        TriggerKind::IssueUnblock,
        TriggerKind::PrOpened,
        TriggerKind::PrPush,
        TriggerKind::PrReadyForReview,
        TriggerKind::PrReviewRequested,
        TriggerKind::PrReviewSubmitted,
        TriggerKind::PrResponse,
        TriggerKind::PrHumanResponse,
        TriggerKind::PrMerged,
        TriggerKind::PrClosed,
        TriggerKind::CiCompleted,
        TriggerKind::MergeQueueEntered,
        TriggerKind::MergeQueueFailed,
        TriggerKind::MergeQueueRemoved,
        TriggerKind::DeployedStage,
        TriggerKind::DeployedProd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::IssueOpened => "issue-opened",
            TriggerKind::IssueAssigned => "issue-assigned",
            TriggerKind::IssueEdited => "issue-edited",
            TriggerKind::IssueClosed => "issue-closed",
            TriggerKind::IssueReopened => "issue-reopened",
            TriggerKind::IssueTriage => "issue-triage",
            TriggerKind::IssueGroom => "issue-groom",
            TriggerKind::IssueComment => "issue-comment",
            TriggerKind::IssueOrchestrate => "issue-orchestrate",
            TriggerKind::IssueReset => "issue-reset",
            TriggerKind::IssuePivot => "issue-pivot",
            TriggerKind::IssueRetry => "issue-retry",
            TriggerKind::IssueUnblock => "issue-unblock",
            TriggerKind::PrOpened => "pr-opened",
            TriggerKind::PrPush => "pr-push",
            TriggerKind::PrReadyForReview => "pr-ready-for-review",
            TriggerKind::PrReviewRequested => "pr-review-requested",
            TriggerKind::PrReviewSubmitted => "pr-review-submitted",
            TriggerKind::PrResponse => "pr-response",
            TriggerKind::PrHumanResponse => "pr-human-response",
            TriggerKind::PrMerged => "pr-merged",
            TriggerKind::PrClosed => "pr-closed",
            TriggerKind::CiCompleted => "ci-completed",
            TriggerKind::MergeQueueEntered => "merge-queue-entered",
            TriggerKind::MergeQueueFailed => "merge-queue-failed",
            TriggerKind::MergeQueueRemoved => "merge-queue-removed",
            TriggerKind::DeployedStage => "deployed-stage",
            TriggerKind::DeployedProd => "deployed-prod",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open/closed state of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemLifecycle {
    #[default]
    Open,
    Closed,
}

/// Project-board status of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[serde(rename = "backlog")]
    Backlog,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "in review")]
    InReview,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "done")]
    Done,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 7] = [
        ProjectStatus::Backlog,
        ProjectStatus::Ready,
        ProjectStatus::InProgress,
        ProjectStatus::InReview,
        ProjectStatus::Blocked,
        ProjectStatus::Error,
        ProjectStatus::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Backlog => "backlog",
            ProjectStatus::Ready => "ready",
            ProjectStatus::InProgress => "in progress",
            ProjectStatus::InReview => "in review",
            ProjectStatus::Blocked => "blocked",
            ProjectStatus::Error => "error",
            ProjectStatus::Done => "done",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiResult {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    Commented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    #[default]
    Open,
    Closed,
    Merged,
}

/// Canonical body sections, in their fixed insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BodySection {
    Description,
    Requirements,
    Approach,
    AcceptanceCriteria,
    Testing,
    Related,
    Questions,
    Todos,
    AgentNotes,
    IterationHistory,
    AffectedAreas,
}

impl BodySection {
    pub const ALL: [BodySection; 11] = [
        BodySection::Description,
        BodySection::Requirements,
        BodySection::Approach,
        BodySection::AcceptanceCriteria,
        BodySection::Testing,
        BodySection::Related,
        BodySection::Questions,
        BodySection::Todos,
        BodySection::AgentNotes,
        BodySection::IterationHistory,
        BodySection::AffectedAreas,
    ];

    /// Markdown heading text for the section.
    pub fn heading(self) -> &'static str {
        match self {
            BodySection::Description => "Description",
            BodySection::Requirements => "Requirements",
            BodySection::Approach => "Approach",
            BodySection::AcceptanceCriteria => "Acceptance Criteria",
            BodySection::Testing => "Testing",
            BodySection::Related => "Related",
            BodySection::Questions => "Questions",
            BodySection::Todos => "Todos",
            BodySection::AgentNotes => "Agent Notes",
            BodySection::IterationHistory => "Iteration History",
            BodySection::AffectedAreas => "Affected Areas",
        }
    }
}

/// Presence flags for each canonical body section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SectionFlags {
    pub has_description: bool,
    pub has_requirements: bool,
    pub has_approach: bool,
    pub has_acceptance_criteria: bool,
    pub has_testing: bool,
    pub has_related: bool,
    pub has_questions: bool,
    pub has_todos: bool,
    pub has_agent_notes: bool,
    pub has_iteration_history: bool,
    pub has_affected_areas: bool,
}

impl SectionFlags {
    pub fn get(&self, section: BodySection) -> bool {
        match section {
            BodySection::Description => self.has_description,
            BodySection::Requirements => self.has_requirements,
            BodySection::Approach => self.has_approach,
            BodySection::AcceptanceCriteria => self.has_acceptance_criteria,
            BodySection::Testing => self.has_testing,
            BodySection::Related => self.has_related,
            BodySection::Questions => self.has_questions,
            BodySection::Todos => self.has_todos,
            BodySection::AgentNotes => self.has_agent_notes,
            BodySection::IterationHistory => self.has_iteration_history,
            BodySection::AffectedAreas => self.has_affected_areas,
        }
    }

    pub fn set(&mut self, section: BodySection, present: bool) {
        let slot = match section {
            BodySection::Description => &mut self.has_description,
            BodySection::Requirements => &mut self.has_requirements,
            BodySection::Approach => &mut self.has_approach,
            BodySection::AcceptanceCriteria => &mut self.has_acceptance_criteria,
            BodySection::Testing => &mut self.has_testing,
            BodySection::Related => &mut self.has_related,
            BodySection::Questions => &mut self.has_questions,
            BodySection::Todos => &mut self.has_todos,
            BodySection::AgentNotes => &mut self.has_agent_notes,
            BodySection::IterationHistory => &mut self.has_iteration_history,
            BodySection::AffectedAreas => &mut self.has_affected_areas,
        };
        *slot = present;
    }

    pub fn from_sections<I: IntoIterator<Item = BodySection>>(sections: I) -> Self {
        let mut flags = SectionFlags::default();
        for section in sections {
            flags.set(section, true);
        }
        flags
    }
}

/// Todo checkbox counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TodoStats {
    pub total: u32,
    pub completed: u32,
    /// Unchecked todos that are not tagged manual.
    pub unchecked_non_manual: u32,
}

impl TodoStats {
    pub fn unchecked(&self) -> u32 {
        self.total.saturating_sub(self.completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuestionStats {
    pub total: u32,
    pub unanswered: u32,
}

/// Linked pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub is_draft: bool,
    pub state: PrState,
    pub head_ref: String,
    pub base_ref: String,
}

/// Parent item and the phase this item occupies within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub number: u64,
    /// 1-based index of this item among the parent's phases.
    pub phase_index: usize,
    pub phase_total: usize,
}

/// Ordered sub-item (phase) of an orchestrated item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubIssue {
    pub number: u64,
    pub title: String,
    pub lifecycle: ItemLifecycle,
    pub status: Option<ProjectStatus>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    #[serde(default)]
    pub todos: TodoStats,
}

impl SubIssue {
    /// A phase is finished once it is marked done or closed.
    pub fn is_finished(&self) -> bool {
        self.status == Some(ProjectStatus::Done) || self.lifecycle == ItemLifecycle::Closed
    }

    /// All non-manual todos are checked.
    pub fn todos_complete(&self) -> bool {
        self.todos.unchecked_non_manual == 0
    }
}

/// The item the trigger is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueContext {
    pub number: u64,
    pub title: String,
    pub lifecycle: ItemLifecycle,
    pub status: Option<ProjectStatus>,
    pub labels: BTreeSet<String>,
    pub assignees: BTreeSet<String>,
    pub iteration: u32,
    pub failures: u32,
    pub sections: SectionFlags,
    pub todos: TodoStats,
    pub questions: QuestionStats,
    pub branch: Option<String>,
    pub has_branch: bool,
}

/// Bounded configuration the machine may consult.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    pub max_retries: u32,
    pub bot_username: String,
    pub reviewer_username: String,
    pub base_branch: String,
    pub grooming_roles: Vec<crate::core::agent_output::GroomingRole>,
}

/// Snapshot of everything the machine needs for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub trigger: TriggerKind,
    pub run_id: String,
    pub run_url: Option<String>,
    pub issue: IssueContext,
    pub parent: Option<ParentRef>,
    pub sub_issues: Vec<SubIssue>,
    pub pr: Option<PullRequest>,
    pub ci_result: Option<CiResult>,
    pub ci_run_url: Option<String>,
    pub review_decision: Option<ReviewDecision>,
    pub comment_id: Option<u64>,
    pub config: ContextConfig,
}

impl Context {
    /// Phase label used in history rows ("-" outside orchestration).
    pub fn phase_label(&self) -> String {
        match &self.parent {
            Some(parent) => parent.phase_index.to_string(),
            None => "-".to_string(),
        }
    }

    /// Work branch name for the item (existing branch wins).
    pub fn branch_name(&self) -> String {
        match &self.issue.branch {
            Some(branch) => branch.clone(),
            None => format!("pev/issue-{}", self.issue.number),
        }
    }

    pub fn bot_assigned(&self) -> bool {
        self.issue.assignees.contains(&self.config.bot_username)
    }
}
