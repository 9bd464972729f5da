//! Fetch-from-truth: build the machine context and the comparison tree from
//! the tracker at the start (and end) of every cycle.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use tracing::{debug, instrument};

use crate::core::context::{Context, IssueContext, ParentRef, PullRequest, SubIssue};
use crate::core::tree::{BodyState, ItemState, PrSnapshot, PredictableStateTree};
use crate::io::config::PevConfig;
use crate::io::tracker::{ItemRecord, Tracker, TriggerEvent};

/// Assemble the machine context for `event`.
#[instrument(skip_all, fields(issue = event.issue_number, trigger = %event.kind))]
pub fn build_context<T: Tracker>(
    tracker: &T,
    event: &TriggerEvent,
    config: &PevConfig,
) -> Result<Context> {
    let item = tracker
        .item(event.issue_number)
        .with_context(|| format!("load item #{}", event.issue_number))?;

    let parent = match item.parent {
        Some(parent_number) => {
            let parent = tracker
                .item(parent_number)
                .with_context(|| format!("load parent #{parent_number}"))?;
            let position = parent
                .sub_issues
                .iter()
                .position(|number| *number == item.number)
                .unwrap_or(0);
            Some(ParentRef {
                number: parent_number,
                phase_index: position + 1,
                phase_total: parent.sub_issues.len(),
            })
        }
        None => None,
    };

    let mut sub_issues = Vec::with_capacity(item.sub_issues.len());
    for number in &item.sub_issues {
        let sub = tracker
            .item(*number)
            .with_context(|| format!("load sub-issue #{number}"))?;
        sub_issues.push(SubIssue {
            number: sub.number,
            title: sub.title.clone(),
            lifecycle: sub.lifecycle,
            status: sub.status,
            assignees: sub.assignees.clone(),
            todos: sub.body.todo_stats(),
        });
    }

    let pr = match item.pr {
        Some(number) => {
            let record = tracker
                .pull_request(number)
                .with_context(|| format!("load pull request #{number}"))?;
            Some(PullRequest {
                number: record.number,
                is_draft: record.is_draft,
                state: record.state,
                head_ref: record.head_ref,
                base_ref: record.base_ref,
            })
        }
        None => None,
    };

    let has_branch = match &item.branch {
        Some(branch) => tracker.branch_exists(branch)?,
        None => false,
    };

    let run_id = event.run_id.clone().unwrap_or_else(generate_run_id);
    debug!(%run_id, sub_issues = sub_issues.len(), has_pr = pr.is_some(), "context built");

    Ok(Context {
        trigger: event.kind,
        run_id,
        run_url: event.run_url.clone(),
        issue: IssueContext {
            number: item.number,
            title: item.title.clone(),
            lifecycle: item.lifecycle,
            status: item.status,
            labels: item.labels.clone(),
            assignees: item.assignees.clone(),
            iteration: item.iteration,
            failures: item.failures,
            sections: item.body.section_flags(),
            todos: item.body.todo_stats(),
            questions: item.body.question_stats(),
            branch: item.branch.clone(),
            has_branch,
        },
        parent,
        sub_issues,
        pr,
        ci_result: event.ci_result,
        ci_run_url: event.ci_run_url.clone(),
        review_decision: event.review_decision,
        comment_id: event.comment_id,
        config: config.context_config(),
    })
}

fn generate_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    format!("run-{millis}")
}

/// Snapshot `root` and its sub-issues as a comparison tree.
#[instrument(skip_all, fields(root = root))]
pub fn extract_tree<T: Tracker>(tracker: &T, root: u64) -> Result<PredictableStateTree> {
    let record = tracker
        .item(root)
        .with_context(|| format!("load item #{root}"))?;
    let mut children = Vec::with_capacity(record.sub_issues.len());
    for number in &record.sub_issues {
        let child = tracker
            .item(*number)
            .with_context(|| format!("load sub-issue #{number}"))?;
        children.push(item_state(tracker, &child)?);
    }
    Ok(PredictableStateTree {
        root: item_state(tracker, &record)?,
        children,
    })
}

fn item_state<T: Tracker>(tracker: &T, record: &ItemRecord) -> Result<ItemState> {
    let pr = match record.pr {
        Some(number) => {
            let pr = tracker.pull_request(number)?;
            Some(PrSnapshot {
                is_draft: pr.is_draft,
                state: pr.state,
            })
        }
        None => None,
    };
    let has_branch = match &record.branch {
        Some(branch) => tracker.branch_exists(branch)?,
        None => false,
    };
    Ok(ItemState {
        id: record.number,
        lifecycle: record.lifecycle,
        status: record.status,
        iteration: record.iteration,
        failures: record.failures,
        labels: record.labels.clone(),
        assignees: record.assignees.clone(),
        has_branch,
        has_pr: pr.is_some(),
        pr,
        body: BodyState {
            sections: record.body.section_flags(),
            todos: record.body.todo_stats(),
            questions: record.body.question_stats(),
            history: record.body.history.clone(),
            agent_notes: record.body.agent_notes.clone(),
            expects_open_todos: false,
        },
    })
}
