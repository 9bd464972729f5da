//! Case file parsing and validation.
//!
//! Cases are TOML files describing a seeded tracker, one trigger, scripted
//! agent outputs, and the checks a replay must satisfy.
//! See `scenarios/cases/` for examples.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::Value;

use pev::core::action::ActionKind;
use pev::core::context::{CiResult, PrState, ProjectStatus, ReviewDecision, TriggerKind};
use pev::core::machine::MachineState;
use pev::io::agent::MockOutputs;
use pev::io::tracker::{
    BranchRecord, ItemRecord, PrRecord, QuestionItem, TodoItem, TrackerState, TriggerEvent,
};

/// A parsed case file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseFile {
    pub case: CaseMeta,
    #[serde(default)]
    pub items: Vec<CaseItem>,
    /// Agent outputs as JSON strings, keyed by mode or `grooming:<role>`.
    #[serde(default)]
    pub mock: BTreeMap<String, String>,
    #[serde(default)]
    pub config: CaseConfig,
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// Case metadata and the trigger to replay.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub trigger: TriggerKind,
    pub issue: u64,
    pub ci_result: Option<CiResult>,
    pub review_decision: Option<ReviewDecision>,
    pub comment_id: Option<u64>,
}

/// Initial tracker item.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaseItem {
    pub number: u64,
    pub title: String,
    pub closed: bool,
    pub status: Option<ProjectStatus>,
    pub labels: BTreeSet<String>,
    pub assignees: BTreeSet<String>,
    pub iteration: u32,
    pub failures: u32,
    pub parent: Option<u64>,
    pub sub_issues: Vec<u64>,
    /// Existing work branch.
    pub branch: Option<String>,
    /// The existing branch is behind its base.
    pub branch_behind: bool,
    pub pr: Option<CasePr>,
    pub todos: Vec<String>,
    pub done_todos: Vec<String>,
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CasePr {
    pub number: u64,
    #[serde(default)]
    pub draft: bool,
    /// Defaults to the configured bot.
    pub author: Option<String>,
}

/// Engine configuration overrides for the case.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CaseConfig {
    pub max_retries: Option<u32>,
    pub halt_on_error: Option<bool>,
    pub continue_on: Option<Vec<ActionKind>>,
    /// Tracker operations that fail when attempted.
    #[serde(default)]
    pub fail_operations: Vec<String>,
}

/// Check evaluated after the cycle completes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    FinalState { state: MachineState },
    ActionsInclude { kinds: Vec<ActionKind> },
    ActionsExclude { kinds: Vec<ActionKind> },
    /// Verification ran and passed.
    Verified,
    ExitCode { code: i32 },
    Status { issue: u64, status: Option<ProjectStatus> },
    HasLabel { issue: u64, label: String },
}

impl CaseFile {
    /// Load and validate a case file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        let case: CaseFile =
            toml::from_str(&contents).with_context(|| format!("parse case {}", path.display()))?;
        case.validate()
            .with_context(|| format!("validate case {}", path.display()))?;
        Ok(case)
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    fn validate(&self) -> Result<()> {
        validate_case_id(&self.case.id)?;
        let mut numbers = BTreeSet::new();
        for item in &self.items {
            if item.number == 0 {
                bail!("items.number must be > 0");
            }
            if !numbers.insert(item.number) {
                bail!("duplicate item #{}", item.number);
            }
        }
        if !numbers.contains(&self.case.issue) {
            bail!("case.issue #{} is not among the items", self.case.issue);
        }
        for item in &self.items {
            for sub in item.sub_issues.iter().chain(item.parent.iter()) {
                if !numbers.contains(sub) {
                    bail!("item #{} links unknown item #{sub}", item.number);
                }
            }
            if item.branch_behind && item.branch.is_none() {
                bail!("item #{} sets branch_behind without a branch", item.number);
            }
        }
        if self.config.max_retries == Some(0) {
            bail!("config.max_retries must be > 0");
        }
        if self.checks.is_empty() {
            bail!("checks must be a non-empty array");
        }
        for (index, check) in self.checks.iter().enumerate() {
            check
                .validate()
                .with_context(|| format!("checks[{}] invalid", index))?;
        }
        self.mock_outputs().context("mock outputs")?;
        Ok(())
    }

    /// Seeded tracker state; `bot` authors PRs without an explicit author.
    pub fn tracker_state(&self, bot: &str) -> TrackerState {
        let mut state = TrackerState::default();
        for item in &self.items {
            let mut record = ItemRecord::new(item.number, item.title.clone());
            if item.closed {
                record.lifecycle = pev::core::context::ItemLifecycle::Closed;
            }
            record.status = item.status;
            record.labels = item.labels.clone();
            record.assignees = item.assignees.clone();
            record.iteration = item.iteration;
            record.failures = item.failures;
            record.parent = item.parent;
            record.sub_issues = item.sub_issues.clone();
            record.branch = item.branch.clone();
            record.body.todos = todo_items(&item.todos, false)
                .chain(todo_items(&item.done_todos, true))
                .collect();
            record.body.questions = item
                .questions
                .iter()
                .map(|text| QuestionItem {
                    text: text.clone(),
                    answered: false,
                })
                .collect();

            if let Some(branch) = &item.branch {
                state.branches.insert(
                    branch.clone(),
                    BranchRecord {
                        name: branch.clone(),
                        base: "main".to_string(),
                        behind_base: item.branch_behind,
                        pushes: 0,
                    },
                );
            }
            if let Some(pr) = &item.pr {
                record.pr = Some(pr.number);
                let head_ref = item
                    .branch
                    .clone()
                    .unwrap_or_else(|| format!("pev/issue-{}", item.number));
                state.pull_requests.insert(
                    pr.number,
                    PrRecord {
                        number: pr.number,
                        issue_number: item.number,
                        title: item.title.clone(),
                        head_ref,
                        base_ref: "main".to_string(),
                        is_draft: pr.draft,
                        state: PrState::Open,
                        author: pr.author.clone().unwrap_or_else(|| bot.to_string()),
                        requested_reviewers: BTreeSet::new(),
                    },
                );
            }
            state.insert_item(record);
        }
        state.fail_operations = self.config.fail_operations.iter().cloned().collect();
        state
    }

    pub fn event(&self, run_id: &str) -> TriggerEvent {
        let mut event = TriggerEvent::new(self.case.trigger, self.case.issue);
        event.ci_result = self.case.ci_result;
        event.review_decision = self.case.review_decision;
        event.comment_id = self.case.comment_id;
        event.run_id = Some(run_id.to_string());
        event
    }

    pub fn mock_outputs(&self) -> Result<MockOutputs> {
        let mut mocks = MockOutputs::default();
        for (key, raw) in &self.mock {
            let value: Value = serde_json::from_str(raw)
                .with_context(|| format!("mock.{key} is not valid JSON"))?;
            mocks.insert(key.clone(), value);
        }
        Ok(mocks)
    }
}

fn todo_items(texts: &[String], checked: bool) -> impl Iterator<Item = TodoItem> + '_ {
    texts.iter().map(move |text| TodoItem {
        text: text.clone(),
        checked,
        manual: false,
    })
}

impl Check {
    fn validate(&self) -> Result<()> {
        match self {
            Check::ActionsInclude { kinds } | Check::ActionsExclude { kinds } => {
                if kinds.is_empty() {
                    bail!("kinds must be a non-empty array");
                }
            }
            Check::HasLabel { label, .. } => {
                if label.trim().is_empty() {
                    bail!("has_label.label must be non-empty");
                }
            }
            Check::FinalState { .. }
            | Check::Verified
            | Check::ExitCode { .. }
            | Check::Status { .. } => {}
        }
        Ok(())
    }
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by id. Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<CaseFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        cases.push(CaseFile::load(&path)?);
    }
    cases.sort_by(|left, right| left.case.id.cmp(&right.case.id));
    for pair in cases.windows(2) {
        if pair[0].case.id == pair[1].case.id {
            return Err(anyhow!("duplicate case.id {}", pair[0].case.id));
        }
    }
    Ok(cases)
}

fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if id.contains('/') || id.contains('\\') {
        bail!("case.id must not contain path separators");
    }
    if id.contains("..") {
        bail!("case.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CI_RETRY: &str = r#"
[case]
id = "ci-retry"
trigger = "ci-completed"
issue = 42
ci_result = "failure"

[[items]]
number = 42
title = "Fix login"
status = "in progress"
assignees = ["pev-bot"]
iteration = 2
failures = 1
branch = "pev/issue-42"
todos = ["Handle SSO"]

[items.pr]
number = 50
draft = true

[mock]
fix-ci = '{"summary": "Fixed the flaky assertion"}'

[[checks]]
type = "final_state"
state = "iterating-fix"

[[checks]]
type = "actions_include"
kinds = ["incrementIteration", "runAgent"]

[[checks]]
type = "verified"
"#;

    #[test]
    fn parses_valid_case() {
        let case = CaseFile::parse_str(CI_RETRY).expect("case parses");
        assert_eq!(case.case.id, "ci-retry");
        assert_eq!(case.case.trigger, TriggerKind::CiCompleted);
        assert_eq!(case.checks.len(), 3);
        assert_eq!(
            case.checks[0],
            Check::FinalState {
                state: MachineState::IteratingFix
            }
        );
    }

    /// The seeded state links the PR, the branch, and the open todo.
    #[test]
    fn seeds_tracker_state() {
        let case = CaseFile::parse_str(CI_RETRY).expect("case parses");
        let state = case.tracker_state("pev-bot");
        let item = &state.items[&42];
        assert_eq!(item.pr, Some(50));
        assert_eq!(item.body.todos.len(), 1);
        assert_eq!(state.pull_requests[&50].head_ref, "pev/issue-42");
        assert_eq!(state.pull_requests[&50].author, "pev-bot");
        assert!(state.branches.contains_key("pev/issue-42"));

        let mocks = case.mock_outputs().expect("mocks");
        assert!(mocks.get("fix-ci").is_some());
        assert_eq!(case.event("run-1").ci_result, Some(CiResult::Failure));
    }

    #[test]
    fn bundled_cases_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("cases");
        let cases = discover_cases(&dir).expect("discover");
        assert!(cases.iter().any(|case| case.case.id == "grooming-ready"));
    }

    #[test]
    fn rejects_invalid_id() {
        let input = r#"
[case]
id = "bad/id"
trigger = "issue-opened"
issue = 1

[[items]]
number = 1

[[checks]]
type = "verified"
"#;
        let err = CaseFile::parse_str(input).expect_err("invalid id");
        assert!(err.to_string().contains("case.id"));
    }

    #[test]
    fn rejects_unknown_issue() {
        let input = r#"
[case]
id = "orphan"
trigger = "issue-opened"
issue = 7

[[checks]]
type = "verified"
"#;
        let err = CaseFile::parse_str(input).expect_err("missing item");
        assert!(err.to_string().contains("#7"));
    }

    #[test]
    fn rejects_malformed_mock_json() {
        let input = r#"
[case]
id = "bad-mock"
trigger = "issue-opened"
issue = 1

[[items]]
number = 1

[mock]
triage = "{not json"

[[checks]]
type = "verified"
"#;
        let _err = CaseFile::parse_str(input).expect_err("invalid mock");
    }
}
