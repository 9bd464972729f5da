//! Closed set of effect types and their registry metadata.
//!
//! Every variant declares, through exhaustive matches in this module, its
//! credential scope, its prediction target, whether it is terminal or
//! best-effort, and its JSON Schema. The predictor lives in
//! [`crate::core::predictors`] and the executor in [`crate::runner`]; both match
//! on [`Action`] exhaustively, so a new variant must be wired into all three.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::agent_output::{AgentMode, GroomingRole};
use crate::core::context::{BodySection, ProjectStatus, TriggerKind};
use crate::error::SchemaValidationError;

/// Credential scope an action runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Code,
    Review,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Code => "code",
            Scope::Review => "review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    NotPlanned,
}

impl CloseReason {
    pub const ALL: [CloseReason; 2] = [CloseReason::Completed, CloseReason::NotPlanned];
}

/// One intended effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    UpdateProjectStatus {
        issue_number: u64,
        status: Option<ProjectStatus>,
    },
    IncrementIteration {
        issue_number: u64,
    },
    RecordFailure {
        issue_number: u64,
    },
    ClearFailures {
        issue_number: u64,
    },
    AddLabel {
        issue_number: u64,
        label: String,
    },
    RemoveLabel {
        issue_number: u64,
        label: String,
    },
    AssignUser {
        issue_number: u64,
        username: String,
    },
    UnassignUser {
        issue_number: u64,
        username: String,
    },
    AppendHistory {
        issue_number: u64,
        iteration: u32,
        phase: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_sha: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_link: Option<String>,
    },
    UpsertSection {
        issue_number: u64,
        section: BodySection,
        content: String,
    },
    CloseIssue {
        issue_number: u64,
        reason: CloseReason,
    },
    ReopenIssue {
        issue_number: u64,
    },
    CreateBranch {
        issue_number: u64,
        branch_name: String,
        base_branch: String,
    },
    PushBranch {
        issue_number: u64,
        branch_name: String,
    },
    DeleteBranch {
        branch_name: String,
    },
    CreatePr {
        issue_number: u64,
        branch_name: String,
        base_branch: String,
        title: String,
        draft: bool,
    },
    MarkPrReady {
        pr_number: u64,
    },
    ConvertPrToDraft {
        pr_number: u64,
    },
    RequestReview {
        pr_number: u64,
        reviewer: String,
    },
    SubmitReview {
        pr_number: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<String>,
    },
    MergePr {
        pr_number: u64,
    },
    RunAgent {
        issue_number: u64,
        mode: AgentMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<String>,
    },
    ApplyTriageOutput {
        issue_number: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<String>,
    },
    ApplyIterateOutput {
        issue_number: u64,
        mode: AgentMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<String>,
    },
    RunGrooming {
        issue_number: u64,
        roles: Vec<GroomingRole>,
    },
    AddReaction {
        subject_id: u64,
        content: String,
    },
    Retrigger {
        issue_number: u64,
        trigger: TriggerKind,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    Stop {
        reason: String,
    },
    Block {
        issue_number: u64,
        reason: String,
    },
}

/// Fieldless mirror of [`Action`] used as a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    UpdateProjectStatus,
    IncrementIteration,
    RecordFailure,
    ClearFailures,
    AddLabel,
    RemoveLabel,
    AssignUser,
    UnassignUser,
    AppendHistory,
    UpsertSection,
    CloseIssue,
    ReopenIssue,
    CreateBranch,
    PushBranch,
    DeleteBranch,
    CreatePr,
    MarkPrReady,
    ConvertPrToDraft,
    RequestReview,
    SubmitReview,
    MergePr,
    RunAgent,
    ApplyTriageOutput,
    ApplyIterateOutput,
    RunGrooming,
    AddReaction,
    Retrigger,
    Log,
    Stop,
    Block,
}

impl ActionKind {
    pub const ALL: [ActionKind; 30] = [
        ActionKind::UpdateProjectStatus,
        ActionKind::IncrementIteration,
        ActionKind::RecordFailure,
        ActionKind::ClearFailures,
        ActionKind::AddLabel,
        ActionKind::RemoveLabel,
        ActionKind::AssignUser,
        ActionKind::UnassignUser,
        ActionKind::AppendHistory,
        ActionKind::UpsertSection,
        ActionKind::CloseIssue,
        ActionKind::ReopenIssue,
        ActionKind::CreateBranch,
        ActionKind::PushBranch,
        ActionKind::DeleteBranch,
        ActionKind::CreatePr,
        ActionKind::MarkPrReady,
        ActionKind::ConvertPrToDraft,
        ActionKind::RequestReview,
        ActionKind::SubmitReview,
        ActionKind::MergePr,
        ActionKind::RunAgent,
        ActionKind::ApplyTriageOutput,
        ActionKind::ApplyIterateOutput,
        ActionKind::RunGrooming,
        ActionKind::AddReaction,
        ActionKind::Retrigger,
        ActionKind::Log,
        ActionKind::Stop,
        ActionKind::Block,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::UpdateProjectStatus => "updateProjectStatus",
            ActionKind::IncrementIteration => "incrementIteration",
            ActionKind::RecordFailure => "recordFailure",
            ActionKind::ClearFailures => "clearFailures",
            ActionKind::AddLabel => "addLabel",
            ActionKind::RemoveLabel => "removeLabel",
            ActionKind::AssignUser => "assignUser",
            ActionKind::UnassignUser => "unassignUser",
            ActionKind::AppendHistory => "appendHistory",
            ActionKind::UpsertSection => "upsertSection",
            ActionKind::CloseIssue => "closeIssue",
            ActionKind::ReopenIssue => "reopenIssue",
            ActionKind::CreateBranch => "createBranch",
            ActionKind::PushBranch => "pushBranch",
            ActionKind::DeleteBranch => "deleteBranch",
            ActionKind::CreatePr => "createPr",
            ActionKind::MarkPrReady => "markPrReady",
            ActionKind::ConvertPrToDraft => "convertPrToDraft",
            ActionKind::RequestReview => "requestReview",
            ActionKind::SubmitReview => "submitReview",
            ActionKind::MergePr => "mergePr",
            ActionKind::RunAgent => "runAgent",
            ActionKind::ApplyTriageOutput => "applyTriageOutput",
            ActionKind::ApplyIterateOutput => "applyIterateOutput",
            ActionKind::RunGrooming => "runGrooming",
            ActionKind::AddReaction => "addReaction",
            ActionKind::Retrigger => "retrigger",
            ActionKind::Log => "log",
            ActionKind::Stop => "stop",
            ActionKind::Block => "block",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Failures of these kinds are logged and never halt the batch.
    pub fn is_best_effort(self) -> bool {
        matches!(self, ActionKind::AddReaction | ActionKind::Log)
    }

    /// JSON Schema for the wire form of this kind.
    pub fn schema(self) -> Value {
        let mut properties = Map::new();
        let mut required = vec![Value::from("type")];
        properties.insert("type".into(), json!({ "const": self.as_str() }));
        for (name, schema, is_required) in field_schemas(self) {
            properties.insert(name.into(), schema);
            if is_required {
                required.push(Value::from(name));
            }
        }

        let mut schema = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "title": self.as_str(),
            "type": "object",
            "required": required,
            "additionalProperties": false,
        });
        if self == ActionKind::RunAgent {
            properties.insert("scope".into(), json!({ "enum": ["code", "review"] }));
            schema["if"] = json!({ "properties": { "mode": { "const": "review" } } });
            schema["then"] = json!({ "properties": { "scope": { "const": "review" } } });
            schema["else"] = json!({ "properties": { "scope": { "const": "code" } } });
        } else {
            let scope = if self == ActionKind::SubmitReview {
                Scope::Review
            } else {
                Scope::Code
            };
            properties.insert("scope".into(), json!({ "const": scope.as_str() }));
        }
        schema["properties"] = Value::Object(properties);
        schema
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn uint() -> Value {
    json!({ "type": "integer", "minimum": 0 })
}

fn text() -> Value {
    json!({ "type": "string", "minLength": 1 })
}

fn any_text() -> Value {
    json!({ "type": "string" })
}

fn optional_text() -> Value {
    json!({ "type": ["string", "null"] })
}

fn wire_names<T: Serialize>(values: &[T]) -> Vec<Value> {
    values
        .iter()
        .filter_map(|value| serde_json::to_value(value).ok())
        .collect()
}

fn one_of<T: Serialize>(values: &[T]) -> Value {
    json!({ "enum": wire_names(values) })
}

fn field_schemas(kind: ActionKind) -> Vec<(&'static str, Value, bool)> {
    let issue = || ("issueNumber", uint(), true);
    let pr = || ("prNumber", uint(), true);
    let artifact = || ("artifact", optional_text(), false);
    match kind {
        ActionKind::UpdateProjectStatus => {
            let mut statuses = wire_names(&ProjectStatus::ALL);
            statuses.push(Value::Null);
            vec![issue(), ("status", json!({ "enum": statuses }), true)]
        }
        ActionKind::IncrementIteration
        | ActionKind::RecordFailure
        | ActionKind::ClearFailures
        | ActionKind::ReopenIssue => vec![issue()],
        ActionKind::AddLabel | ActionKind::RemoveLabel => vec![issue(), ("label", text(), true)],
        ActionKind::AssignUser | ActionKind::UnassignUser => {
            vec![issue(), ("username", text(), true)]
        }
        ActionKind::AppendHistory => vec![
            issue(),
            ("iteration", uint(), true),
            ("phase", text(), true),
            ("message", text(), true),
            ("commitSha", optional_text(), false),
            ("runLink", optional_text(), false),
        ],
        ActionKind::UpsertSection => vec![
            issue(),
            ("section", one_of(&BodySection::ALL), true),
            ("content", any_text(), true),
        ],
        ActionKind::CloseIssue => vec![issue(), ("reason", one_of(&CloseReason::ALL), true)],
        ActionKind::CreateBranch => vec![
            issue(),
            ("branchName", text(), true),
            ("baseBranch", text(), true),
        ],
        ActionKind::PushBranch => vec![issue(), ("branchName", text(), true)],
        ActionKind::DeleteBranch => vec![("branchName", text(), true)],
        ActionKind::CreatePr => vec![
            issue(),
            ("branchName", text(), true),
            ("baseBranch", text(), true),
            ("title", text(), true),
            ("draft", json!({ "type": "boolean" }), true),
        ],
        ActionKind::MarkPrReady | ActionKind::ConvertPrToDraft | ActionKind::MergePr => vec![pr()],
        ActionKind::RequestReview => vec![pr(), ("reviewer", text(), true)],
        ActionKind::SubmitReview => vec![pr(), artifact()],
        ActionKind::RunAgent | ActionKind::ApplyIterateOutput => vec![
            issue(),
            ("mode", one_of(&AgentMode::ALL), true),
            artifact(),
        ],
        ActionKind::ApplyTriageOutput => vec![issue(), artifact()],
        ActionKind::RunGrooming => vec![
            issue(),
            (
                "roles",
                json!({ "type": "array", "items": one_of(&GroomingRole::ALL), "uniqueItems": true }),
                true,
            ),
        ],
        ActionKind::AddReaction => vec![("subjectId", uint(), true), ("content", text(), true)],
        ActionKind::Retrigger => vec![issue(), ("trigger", one_of(&TriggerKind::ALL), true)],
        ActionKind::Log => vec![
            ("level", one_of(&LogLevel::ALL), true),
            ("message", any_text(), true),
        ],
        ActionKind::Stop => vec![("reason", any_text(), true)],
        ActionKind::Block => vec![issue(), ("reason", any_text(), true)],
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::UpdateProjectStatus { .. } => ActionKind::UpdateProjectStatus,
            Action::IncrementIteration { .. } => ActionKind::IncrementIteration,
            Action::RecordFailure { .. } => ActionKind::RecordFailure,
            Action::ClearFailures { .. } => ActionKind::ClearFailures,
            Action::AddLabel { .. } => ActionKind::AddLabel,
            Action::RemoveLabel { .. } => ActionKind::RemoveLabel,
            Action::AssignUser { .. } => ActionKind::AssignUser,
            Action::UnassignUser { .. } => ActionKind::UnassignUser,
            Action::AppendHistory { .. } => ActionKind::AppendHistory,
            Action::UpsertSection { .. } => ActionKind::UpsertSection,
            Action::CloseIssue { .. } => ActionKind::CloseIssue,
            Action::ReopenIssue { .. } => ActionKind::ReopenIssue,
            Action::CreateBranch { .. } => ActionKind::CreateBranch,
            Action::PushBranch { .. } => ActionKind::PushBranch,
            Action::DeleteBranch { .. } => ActionKind::DeleteBranch,
            Action::CreatePr { .. } => ActionKind::CreatePr,
            Action::MarkPrReady { .. } => ActionKind::MarkPrReady,
            Action::ConvertPrToDraft { .. } => ActionKind::ConvertPrToDraft,
            Action::RequestReview { .. } => ActionKind::RequestReview,
            Action::SubmitReview { .. } => ActionKind::SubmitReview,
            Action::MergePr { .. } => ActionKind::MergePr,
            Action::RunAgent { .. } => ActionKind::RunAgent,
            Action::ApplyTriageOutput { .. } => ActionKind::ApplyTriageOutput,
            Action::ApplyIterateOutput { .. } => ActionKind::ApplyIterateOutput,
            Action::RunGrooming { .. } => ActionKind::RunGrooming,
            Action::AddReaction { .. } => ActionKind::AddReaction,
            Action::Retrigger { .. } => ActionKind::Retrigger,
            Action::Log { .. } => ActionKind::Log,
            Action::Stop { .. } => ActionKind::Stop,
            Action::Block { .. } => ActionKind::Block,
        }
    }

    /// The review scope covers exactly the actions that act as the reviewer.
    pub fn scope(&self) -> Scope {
        match self {
            Action::SubmitReview { .. }
            | Action::RunAgent {
                mode: AgentMode::Review,
                ..
            } => Scope::Review,
            _ => Scope::Code,
        }
    }

    /// Item the predicted effect lands on; `None` targets the tree root.
    pub fn target_issue(&self) -> Option<u64> {
        match self {
            Action::UpdateProjectStatus { issue_number, .. }
            | Action::IncrementIteration { issue_number }
            | Action::RecordFailure { issue_number }
            | Action::ClearFailures { issue_number }
            | Action::AddLabel { issue_number, .. }
            | Action::RemoveLabel { issue_number, .. }
            | Action::AssignUser { issue_number, .. }
            | Action::UnassignUser { issue_number, .. }
            | Action::AppendHistory { issue_number, .. }
            | Action::UpsertSection { issue_number, .. }
            | Action::CloseIssue { issue_number, .. }
            | Action::ReopenIssue { issue_number }
            | Action::CreateBranch { issue_number, .. }
            | Action::PushBranch { issue_number, .. }
            | Action::CreatePr { issue_number, .. }
            | Action::RunAgent { issue_number, .. }
            | Action::ApplyTriageOutput { issue_number, .. }
            | Action::ApplyIterateOutput { issue_number, .. }
            | Action::RunGrooming { issue_number, .. }
            | Action::Retrigger { issue_number, .. }
            | Action::Block { issue_number, .. } => Some(*issue_number),
            Action::DeleteBranch { .. }
            | Action::MarkPrReady { .. }
            | Action::ConvertPrToDraft { .. }
            | Action::RequestReview { .. }
            | Action::SubmitReview { .. }
            | Action::MergePr { .. }
            | Action::AddReaction { .. }
            | Action::Log { .. }
            | Action::Stop { .. } => None,
        }
    }

    /// Terminal actions end the batch after they execute.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Stop { .. } | Action::Block { .. })
    }

    pub fn is_agent_invocation(&self) -> bool {
        matches!(self, Action::RunAgent { .. } | Action::RunGrooming { .. })
    }
}

/// Registry schemas compiled once; a compile failure is kept per kind.
static VALIDATORS: LazyLock<BTreeMap<ActionKind, Result<Validator, String>>> = LazyLock::new(|| {
    ActionKind::ALL
        .iter()
        .map(|&kind| {
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&kind.schema())
                .map_err(|err| format!("compile schema: {err}"));
            (kind, validator)
        })
        .collect()
});

/// Validate one action document against its registry schema and parse it.
///
/// Unknown `type` values are rejected before any schema lookup.
pub fn parse_action(value: &Value) -> Result<Action, SchemaValidationError> {
    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaValidationError::Malformed {
            message: "action must be an object with a string 'type'".to_string(),
        })?;
    let kind = ActionKind::from_wire(type_name).ok_or_else(|| {
        SchemaValidationError::UnknownType {
            type_name: type_name.to_string(),
        }
    })?;

    let validator = match VALIDATORS.get(&kind) {
        Some(Ok(validator)) => validator,
        Some(Err(message)) => {
            return Err(SchemaValidationError::Invalid {
                kind: kind.to_string(),
                messages: vec![message.clone()],
            });
        }
        None => {
            return Err(SchemaValidationError::Invalid {
                kind: kind.to_string(),
                messages: vec!["no schema registered".to_string()],
            });
        }
    };
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(SchemaValidationError::Invalid {
            kind: kind.to_string(),
            messages,
        });
    }

    serde_json::from_value(value.clone()).map_err(|err| SchemaValidationError::Malformed {
        message: format!("{kind}: {err}"),
    })
}

/// Validate an in-memory action by round-tripping it through its wire form.
pub fn validate_action(action: &Action) -> Result<(), SchemaValidationError> {
    let value = serde_json::to_value(action).map_err(|err| SchemaValidationError::Malformed {
        message: err.to_string(),
    })?;
    parse_action(&value).map(|_| ())
}

/// Parse an ordered action list, failing on the first invalid entry.
pub fn parse_action_list(value: &Value) -> Result<Vec<Action>, SchemaValidationError> {
    let items = value
        .as_array()
        .ok_or_else(|| SchemaValidationError::Malformed {
            message: "action list must be a JSON array".to_string(),
        })?;
    items.iter().map(parse_action).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: ActionKind) -> Action {
        match kind {
            ActionKind::UpdateProjectStatus => Action::UpdateProjectStatus {
                issue_number: 1,
                status: Some(ProjectStatus::InProgress),
            },
            ActionKind::IncrementIteration => Action::IncrementIteration { issue_number: 1 },
            ActionKind::RecordFailure => Action::RecordFailure { issue_number: 1 },
            ActionKind::ClearFailures => Action::ClearFailures { issue_number: 1 },
            ActionKind::AddLabel => Action::AddLabel {
                issue_number: 1,
                label: "triaged".to_string(),
            },
            ActionKind::RemoveLabel => Action::RemoveLabel {
                issue_number: 1,
                label: "triaged".to_string(),
            },
            ActionKind::AssignUser => Action::AssignUser {
                issue_number: 1,
                username: "bot".to_string(),
            },
            ActionKind::UnassignUser => Action::UnassignUser {
                issue_number: 1,
                username: "bot".to_string(),
            },
            ActionKind::AppendHistory => Action::AppendHistory {
                issue_number: 1,
                iteration: 2,
                phase: "-".to_string(),
                message: "did things".to_string(),
                commit_sha: None,
                run_link: Some("https://ci/run/1".to_string()),
            },
            ActionKind::UpsertSection => Action::UpsertSection {
                issue_number: 1,
                section: BodySection::Requirements,
                content: "- one".to_string(),
            },
            ActionKind::CloseIssue => Action::CloseIssue {
                issue_number: 1,
                reason: CloseReason::Completed,
            },
            ActionKind::ReopenIssue => Action::ReopenIssue { issue_number: 1 },
            ActionKind::CreateBranch => Action::CreateBranch {
                issue_number: 1,
                branch_name: "pev/issue-1".to_string(),
                base_branch: "main".to_string(),
            },
            ActionKind::PushBranch => Action::PushBranch {
                issue_number: 1,
                branch_name: "pev/issue-1".to_string(),
            },
            ActionKind::DeleteBranch => Action::DeleteBranch {
                branch_name: "pev/issue-1".to_string(),
            },
            ActionKind::CreatePr => Action::CreatePr {
                issue_number: 1,
                branch_name: "pev/issue-1".to_string(),
                base_branch: "main".to_string(),
                title: "Fix it".to_string(),
                draft: true,
            },
            ActionKind::MarkPrReady => Action::MarkPrReady { pr_number: 5 },
            ActionKind::ConvertPrToDraft => Action::ConvertPrToDraft { pr_number: 5 },
            ActionKind::RequestReview => Action::RequestReview {
                pr_number: 5,
                reviewer: "reviewer".to_string(),
            },
            ActionKind::SubmitReview => Action::SubmitReview {
                pr_number: 5,
                artifact: None,
            },
            ActionKind::MergePr => Action::MergePr { pr_number: 5 },
            ActionKind::RunAgent => Action::RunAgent {
                issue_number: 1,
                mode: AgentMode::Iterate,
                artifact: None,
            },
            ActionKind::ApplyTriageOutput => Action::ApplyTriageOutput {
                issue_number: 1,
                artifact: Some("triage".to_string()),
            },
            ActionKind::ApplyIterateOutput => Action::ApplyIterateOutput {
                issue_number: 1,
                mode: AgentMode::FixCi,
                artifact: None,
            },
            ActionKind::RunGrooming => Action::RunGrooming {
                issue_number: 1,
                roles: vec![GroomingRole::Pm, GroomingRole::Qa],
            },
            ActionKind::AddReaction => Action::AddReaction {
                subject_id: 77,
                content: "eyes".to_string(),
            },
            ActionKind::Retrigger => Action::Retrigger {
                issue_number: 1,
                trigger: TriggerKind::PrReviewRequested,
            },
            ActionKind::Log => Action::Log {
                level: LogLevel::Info,
                message: "hello".to_string(),
            },
            ActionKind::Stop => Action::Stop {
                reason: "done".to_string(),
            },
            ActionKind::Block => Action::Block {
                issue_number: 1,
                reason: "too many failures".to_string(),
            },
        }
    }

    /// Every registered kind accepts its own serialized form.
    #[test]
    fn every_kind_validates_its_sample() {
        for kind in ActionKind::ALL {
            let action = sample(kind);
            assert_eq!(action.kind(), kind);
            let value = serde_json::to_value(&action).expect("serialize");
            let parsed = parse_action(&value)
                .unwrap_or_else(|err| panic!("{kind} should validate: {err}"));
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_wire(kind.as_str()), Some(kind));
            let value = serde_json::to_value(sample(kind)).expect("serialize");
            assert_eq!(value["type"], kind.as_str());
        }
    }

    #[test]
    fn every_schema_compiles_once() {
        assert_eq!(VALIDATORS.len(), ActionKind::ALL.len());
        for (kind, validator) in VALIDATORS.iter() {
            assert!(validator.is_ok(), "{kind}: {:?}", validator.as_ref().err());
        }
    }

    #[test]
    fn unknown_type_is_rejected_before_schema() {
        let err = parse_action(&json!({ "type": "launchRocket" })).expect_err("unknown");
        assert_eq!(
            err,
            SchemaValidationError::UnknownType {
                type_name: "launchRocket".to_string()
            }
        );
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let err = parse_action(&json!({ "type": "addLabel", "issueNumber": 3 })).expect_err("invalid");
        assert!(matches!(err, SchemaValidationError::Invalid { ref kind, .. } if kind == "addLabel"));
    }

    /// An explicit scope must agree with the scope the variant implies.
    #[test]
    fn explicit_scope_must_match_derived_scope() {
        let ok = json!({ "type": "submitReview", "prNumber": 4, "scope": "review" });
        assert!(parse_action(&ok).is_ok());

        let wrong = json!({ "type": "submitReview", "prNumber": 4, "scope": "code" });
        assert!(parse_action(&wrong).is_err());

        let review_agent = json!({ "type": "runAgent", "issueNumber": 4, "mode": "review", "scope": "review" });
        assert!(parse_action(&review_agent).is_ok());

        let code_agent_as_reviewer = json!({ "type": "runAgent", "issueNumber": 4, "mode": "iterate", "scope": "review" });
        assert!(parse_action(&code_agent_as_reviewer).is_err());
    }

    #[test]
    fn scope_routes_reviewer_actions() {
        assert_eq!(sample(ActionKind::SubmitReview).scope(), Scope::Review);
        let review = Action::RunAgent {
            issue_number: 1,
            mode: AgentMode::Review,
            artifact: None,
        };
        assert_eq!(review.scope(), Scope::Review);
        assert_eq!(sample(ActionKind::RunAgent).scope(), Scope::Code);
        assert_eq!(sample(ActionKind::MergePr).scope(), Scope::Code);
    }

    #[test]
    fn terminal_and_best_effort_flags() {
        assert!(sample(ActionKind::Stop).is_terminal());
        assert!(sample(ActionKind::Block).is_terminal());
        assert!(!sample(ActionKind::Log).is_terminal());
        assert!(ActionKind::AddReaction.is_best_effort());
        assert!(ActionKind::Log.is_best_effort());
        assert!(!ActionKind::PushBranch.is_best_effort());
    }

    #[test]
    fn action_list_must_be_array() {
        assert!(parse_action_list(&json!({ "type": "log" })).is_err());
        let list = json!([{ "type": "stop", "reason": "x" }]);
        assert_eq!(parse_action_list(&list).expect("list").len(), 1);
    }
}
