//! Sequential action execution under scoped credentials.
//!
//! The runner validates the whole batch up front, then executes actions one at
//! a time, routing each through the client for its declared [`Scope`]. Agent
//! outputs are kept in-process for the `apply*` action that follows and, when
//! an artifact directory is configured, persisted so a separately scheduled
//! process can re-hydrate them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::core::action::{Action, ActionKind, LogLevel, Scope, validate_action};
use crate::core::agent_output::{
    AgentMode, GroomingDecision, GroomingOutput, IterateOutput, ReviewOutput, TriageOutput,
};
use crate::core::body::{TodoLine, clean_item, render_bullets, render_todo_list};
use crate::core::context::{BodySection, Context, ItemLifecycle, ProjectStatus};
use crate::core::predictors::labels;
use crate::core::tree::{AgentNote, HistoryEntry};
use crate::exit_codes;
use crate::grooming::run_grooming;
use crate::io::agent::{AgentExecutor, AgentRequest};
use crate::io::artifacts::{read_artifact, write_artifact};
use crate::io::config::PevConfig;
use crate::io::git::Git;
use crate::io::tracker::{BranchOutcome, Tracker};

const FALLBACK_REQUIREMENTS: &str = "- Deliver what the description asks for.";
const FALLBACK_APPROACH: &str = "Ready for implementation.";
const FALLBACK_TODO: &str = "Implement the groomed approach";
const FALLBACK_QUESTION: &str = "Grooming could not reach a decision; please clarify the scope.";

/// One client per credential scope.
///
/// The code and review clients must act as different identities so the agent
/// never reviews its own work.
pub struct ScopedClients<'a, T: Tracker> {
    pub code: &'a T,
    pub review: &'a T,
}

impl<T: Tracker> Clone for ScopedClients<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Tracker> Copy for ScopedClients<'_, T> {}

impl<'a, T: Tracker> ScopedClients<'a, T> {
    pub fn new(code: &'a T, review: &'a T) -> Self {
        Self { code, review }
    }

    pub fn for_scope(&self, scope: Scope) -> &'a T {
        match scope {
            Scope::Code => self.code,
            Scope::Review => self.review,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub dry_run: bool,
    pub halt_on_error: bool,
    /// Kinds whose failures never halt the batch.
    pub continue_on: Vec<ActionKind>,
    /// Work directory for placeholder commits after code-producing agent runs.
    pub placeholder_commit: Option<PathBuf>,
    pub artifact_dir: Option<PathBuf>,
    pub agent_timeout: Duration,
    /// Wall-clock bound for the whole cycle.
    pub deadline: Option<Instant>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            halt_on_error: true,
            continue_on: Vec::new(),
            placeholder_commit: None,
            artifact_dir: None,
            agent_timeout: Duration::from_secs(20 * 60),
            deadline: None,
        }
    }
}

impl RunnerOptions {
    pub fn from_config(config: &PevConfig) -> Self {
        Self {
            halt_on_error: config.halt_on_error,
            continue_on: config.continue_on.clone(),
            agent_timeout: Duration::from_secs(config.agent.timeout_secs),
            ..Self::default()
        }
    }
}

/// Why a batch ended before its last action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// A `stop` action ran.
    Terminal,
    /// A `block` action ran.
    Blocked,
    /// Branch creation found an existing branch behind its base and rebased it.
    Rebased,
    /// An action failed and the batch was configured to halt.
    Error,
}

impl StopReason {
    /// Stops that must hold back dependent downstream work.
    pub fn blocks_downstream(self) -> bool {
        matches!(self, StopReason::Blocked | StopReason::Rebased)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Skipped,
    Failed { error: String },
    /// Best-effort failure that did not affect the batch.
    Recovered { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub index: usize,
    pub kind: ActionKind,
    pub scope: Scope,
    #[serde(flatten)]
    pub status: ActionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub dry_run: bool,
    pub records: Vec<ActionRecord>,
    pub stop: Option<StopReason>,
    pub retrigger_executed: bool,
}

impl ExecutionReport {
    pub fn failed(&self) -> bool {
        self.records
            .iter()
            .any(|record| matches!(record.status, ActionStatus::Failed { .. }))
    }

    /// Every action ran and none failed.
    pub fn completed(&self) -> bool {
        !self.dry_run && !self.failed() && self.stop.is_none_or(|stop| stop == StopReason::Terminal)
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() {
            return exit_codes::FAILED;
        }
        match self.stop {
            Some(stop) if stop.blocks_downstream() => exit_codes::BLOCKED,
            _ => exit_codes::OK,
        }
    }
}

enum Flow {
    Continue,
    Stop(StopReason),
}

pub struct Runner<'a, T: Tracker> {
    clients: ScopedClients<'a, T>,
    agent: &'a dyn AgentExecutor,
    ctx: &'a Context,
    options: &'a RunnerOptions,
    outputs: BTreeMap<AgentMode, Value>,
}

impl<'a, T: Tracker> Runner<'a, T> {
    pub fn new(
        clients: ScopedClients<'a, T>,
        agent: &'a dyn AgentExecutor,
        ctx: &'a Context,
        options: &'a RunnerOptions,
    ) -> Self {
        Self {
            clients,
            agent,
            ctx,
            options,
            outputs: BTreeMap::new(),
        }
    }

    /// Validate and execute `actions` in order.
    ///
    /// Schema failures are returned as errors before anything runs; per-action
    /// failures are recorded in the report.
    #[instrument(skip_all, fields(actions = actions.len(), dry_run = self.options.dry_run))]
    pub fn execute(&mut self, actions: &[Action]) -> Result<ExecutionReport> {
        for action in actions {
            validate_action(action)?;
        }

        let mut report = ExecutionReport {
            dry_run: self.options.dry_run,
            ..ExecutionReport::default()
        };

        for (index, action) in actions.iter().enumerate() {
            let kind = action.kind();
            let scope = action.scope();
            let (status, stop) = if self.options.dry_run {
                (ActionStatus::Skipped, None)
            } else {
                self.step(index, action)
            };
            if kind == ActionKind::Retrigger && status == ActionStatus::Succeeded {
                report.retrigger_executed = true;
            }
            report.records.push(ActionRecord {
                index,
                kind,
                scope,
                status,
            });
            if stop.is_some() {
                report.stop = stop;
                break;
            }
        }

        Ok(report)
    }

    /// Execute one action and decide whether the batch continues.
    fn step(&mut self, index: usize, action: &Action) -> (ActionStatus, Option<StopReason>) {
        let kind = action.kind();
        if let Some(deadline) = self.options.deadline
            && let Err(err) = remaining_budget(deadline)
        {
            error!(index, %kind, "cycle deadline passed");
            let status = ActionStatus::Failed {
                error: err.to_string(),
            };
            return (status, Some(StopReason::Error));
        }

        debug!(index, %kind, scope = action.scope().as_str(), "executing action");
        match self.apply(action) {
            Ok(Flow::Continue) => (ActionStatus::Succeeded, None),
            Ok(Flow::Stop(reason)) => {
                info!(index, %kind, ?reason, "batch stopped");
                (ActionStatus::Succeeded, Some(reason))
            }
            Err(err) => {
                let message = format!("{err:#}");
                if kind.is_best_effort() {
                    warn!(index, %kind, err = %message, "best-effort action failed");
                    return (ActionStatus::Recovered { error: message }, None);
                }
                error!(index, %kind, err = %message, "action failed");
                let halt = self.options.halt_on_error && !self.options.continue_on.contains(&kind);
                (
                    ActionStatus::Failed { error: message },
                    halt.then_some(StopReason::Error),
                )
            }
        }
    }

    fn apply(&mut self, action: &Action) -> Result<Flow> {
        let client = self.clients.for_scope(action.scope());
        match action {
            Action::UpdateProjectStatus {
                issue_number,
                status,
            } => client.set_status(*issue_number, *status)?,
            Action::IncrementIteration { issue_number } => {
                client.increment_iteration(*issue_number)?;
            }
            Action::RecordFailure { issue_number } => {
                client.record_failure(*issue_number)?;
            }
            Action::ClearFailures { issue_number } => client.clear_failures(*issue_number)?,
            Action::AddLabel {
                issue_number,
                label,
            } => client.add_label(*issue_number, label)?,
            Action::RemoveLabel {
                issue_number,
                label,
            } => client.remove_label(*issue_number, label)?,
            Action::AssignUser {
                issue_number,
                username,
            } => client.assign(*issue_number, username)?,
            Action::UnassignUser {
                issue_number,
                username,
            } => client.unassign(*issue_number, username)?,
            Action::AppendHistory {
                issue_number,
                iteration,
                phase,
                message,
                commit_sha,
                run_link,
            } => {
                let entry = HistoryEntry {
                    iteration: *iteration,
                    phase: phase.clone(),
                    action: message.clone(),
                    commit_sha: commit_sha.clone(),
                    run_link: run_link.clone(),
                };
                client.append_history(*issue_number, entry)?;
            }
            Action::UpsertSection {
                issue_number,
                section,
                content,
            } => client.upsert_section(*issue_number, *section, content)?,
            Action::CloseIssue {
                issue_number,
                reason,
            } => {
                debug!(issue = issue_number, ?reason, "closing issue");
                client.set_lifecycle(*issue_number, ItemLifecycle::Closed)?;
            }
            Action::ReopenIssue { issue_number } => {
                client.set_lifecycle(*issue_number, ItemLifecycle::Open)?;
            }
            Action::CreateBranch {
                issue_number,
                branch_name,
                base_branch,
            } => match client.create_branch(*issue_number, branch_name, base_branch)? {
                BranchOutcome::Created | BranchOutcome::Existed { behind: false } => {}
                BranchOutcome::Existed { behind: true } => {
                    info!(branch = %branch_name, "branch exists behind base, rebasing");
                    client.rebase_branch(branch_name)?;
                    client.push_branch(branch_name)?;
                    return Ok(Flow::Stop(StopReason::Rebased));
                }
            },
            Action::PushBranch { branch_name, .. } => client.push_branch(branch_name)?,
            Action::DeleteBranch { branch_name } => client.delete_branch(branch_name)?,
            Action::CreatePr {
                issue_number,
                branch_name,
                base_branch,
                title,
                draft,
            } => {
                let pr = client.create_pr(*issue_number, branch_name, base_branch, title, *draft)?;
                debug!(pr, "pull request ready");
            }
            Action::MarkPrReady { pr_number } => client.set_pr_draft(*pr_number, false)?,
            Action::ConvertPrToDraft { pr_number } => client.set_pr_draft(*pr_number, true)?,
            Action::RequestReview {
                pr_number,
                reviewer,
            } => client.request_review(*pr_number, reviewer)?,
            Action::SubmitReview {
                pr_number,
                artifact,
            } => {
                let output: ReviewOutput =
                    self.load_output(AgentMode::Review, artifact.as_deref())?;
                client.submit_review(*pr_number, output.decision, &output.body)?;
            }
            Action::MergePr { pr_number } => client.merge_pr(*pr_number)?,
            Action::RunAgent {
                issue_number,
                mode,
                artifact,
            } => self.run_agent(*issue_number, *mode, artifact.as_deref())?,
            Action::ApplyTriageOutput {
                issue_number,
                artifact,
            } => {
                let output: TriageOutput =
                    self.load_output(AgentMode::Triage, artifact.as_deref())?;
                apply_triage(client, *issue_number, &output)?;
            }
            Action::ApplyIterateOutput {
                issue_number,
                mode,
                artifact,
            } => {
                let output: IterateOutput = self.load_output(*mode, artifact.as_deref())?;
                client.add_agent_note(
                    *issue_number,
                    AgentNote {
                        run_id: self.ctx.run_id.clone(),
                        summary: output.summary.trim().to_string(),
                        commit_sha: output.commit_sha.clone(),
                    },
                )?;
                let completed: Vec<String> =
                    output.todos_completed.iter().map(|t| clean_item(t)).collect();
                let checked = client.check_todos(*issue_number, &completed)?;
                debug!(checked, "todos checked");
            }
            Action::RunGrooming {
                issue_number,
                roles,
            } => {
                let context = serde_json::to_value(self.ctx).context("serialize context")?;
                let output = run_grooming(
                    self.agent,
                    &context,
                    *issue_number,
                    roles,
                    self.agent_timeout()?,
                );
                apply_grooming(client, *issue_number, &output)?;
                let value = serde_json::to_value(&output).context("serialize grooming output")?;
                self.store_output(AgentMode::Grooming, Some(AgentMode::Grooming.as_str()), value)?;
            }
            Action::AddReaction {
                subject_id,
                content,
            } => client.add_reaction(*subject_id, content)?,
            Action::Retrigger {
                issue_number,
                trigger,
            } => client.dispatch(*issue_number, *trigger)?,
            Action::Log { level, message } => match level {
                LogLevel::Debug => debug!(target: "pev::action", "{message}"),
                LogLevel::Info => info!(target: "pev::action", "{message}"),
                LogLevel::Warn => warn!(target: "pev::action", "{message}"),
                LogLevel::Error => error!(target: "pev::action", "{message}"),
            },
            Action::Stop { reason } => {
                info!(%reason, "stop");
                return Ok(Flow::Stop(StopReason::Terminal));
            }
            Action::Block {
                issue_number,
                reason,
            } => {
                warn!(issue = issue_number, %reason, "blocked");
                return Ok(Flow::Stop(StopReason::Blocked));
            }
        }
        Ok(Flow::Continue)
    }

    fn agent_timeout(&self) -> Result<Duration> {
        match self.options.deadline {
            Some(deadline) => Ok(remaining_budget(deadline)?.min(self.options.agent_timeout)),
            None => Ok(self.options.agent_timeout),
        }
    }

    #[instrument(skip_all, fields(issue = issue_number, mode = %mode))]
    fn run_agent(&mut self, issue_number: u64, mode: AgentMode, artifact: Option<&str>) -> Result<()> {
        let request = AgentRequest {
            mode,
            issue_number,
            role: None,
            context: serde_json::to_value(self.ctx).context("serialize context")?,
            timeout: self.agent_timeout()?,
        };
        let mut output = self
            .agent
            .invoke(&request)
            .with_context(|| format!("agent {mode} for #{issue_number}"))?;

        if mode.produces_code()
            && let Some(workdir) = &self.options.placeholder_commit
        {
            let sha = Git::new(workdir)
                .commit_empty(&format!("pev: placeholder {mode} for #{issue_number}"))
                .context("placeholder commit")?;
            if let Some(object) = output.as_object_mut() {
                object
                    .entry("commitSha")
                    .or_insert_with(|| Value::String(sha));
            }
        }

        self.store_output(mode, artifact, output)
    }

    fn store_output(&mut self, mode: AgentMode, artifact: Option<&str>, output: Value) -> Result<()> {
        if let (Some(dir), Some(name)) = (&self.options.artifact_dir, artifact) {
            let path = write_artifact(dir, name, &output)?;
            debug!(path = %path.display(), "artifact written");
        }
        self.outputs.insert(mode, output);
        Ok(())
    }

    /// In-process output of `mode`, else the named artifact.
    fn load_output<O: serde::de::DeserializeOwned>(
        &self,
        mode: AgentMode,
        artifact: Option<&str>,
    ) -> Result<O> {
        let value = match (self.outputs.get(&mode), &self.options.artifact_dir, artifact) {
            (Some(value), _, _) => value.clone(),
            (None, Some(dir), Some(name)) => read_artifact(dir, name)?,
            _ => return Err(anyhow!("no {mode} output available")),
        };
        serde_json::from_value(value).with_context(|| format!("parse {mode} output"))
    }
}

fn apply_triage<T: Tracker>(client: &T, number: u64, output: &TriageOutput) -> Result<()> {
    client.add_label(number, labels::TRIAGED)?;
    for label in &output.labels {
        let label = label.trim();
        if !label.is_empty() {
            client.add_label(number, label)?;
        }
    }
    let requirements: Vec<String> = clean_list(&output.requirements);
    let content = if requirements.is_empty() {
        FALLBACK_REQUIREMENTS.to_string()
    } else {
        render_bullets(&requirements)
    };
    client.upsert_section(number, BodySection::Requirements, &content)?;
    let questions = clean_list(&output.questions);
    if !questions.is_empty() {
        client.add_questions(number, &questions)?;
    }
    Ok(())
}

fn apply_grooming<T: Tracker>(client: &T, number: u64, output: &GroomingOutput) -> Result<()> {
    match output.decision {
        GroomingDecision::Ready => {
            client.add_label(number, labels::GROOMED)?;
            client.remove_label(number, labels::NEEDS_INFO)?;
            client.set_status(number, Some(ProjectStatus::Ready))?;
            let approach = if output.approach.trim().is_empty() {
                FALLBACK_APPROACH
            } else {
                output.approach.trim()
            };
            client.upsert_section(number, BodySection::Approach, approach)?;
            let mut todos = clean_list(&output.todos);
            if todos.is_empty() {
                todos.push(FALLBACK_TODO.to_string());
            }
            client.add_todos(number, &todos)?;
            let lines: Vec<TodoLine> = todos
                .into_iter()
                .map(|text| TodoLine {
                    text,
                    checked: false,
                    manual: false,
                })
                .collect();
            client.upsert_section(number, BodySection::Todos, &render_todo_list(&lines))?;
        }
        GroomingDecision::NeedsInfo => {
            client.add_label(number, labels::NEEDS_INFO)?;
            let mut questions = clean_list(&output.questions);
            if questions.is_empty() {
                questions.push(FALLBACK_QUESTION.to_string());
            }
            client.add_questions(number, &questions)?;
        }
        GroomingDecision::NeedsSplit => {
            client.add_label(number, labels::GROOMED)?;
            client.add_label(number, labels::NEEDS_SPLIT)?;
        }
    }
    Ok(())
}

fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| clean_item(item))
        .filter(|item| !item.is_empty())
        .collect()
}

/// Time left before `deadline`; an error once it has passed.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("cycle timed out"));
    }
    Ok(remaining)
}
