//! In-memory [`Tracker`] backed by a shared [`TrackerState`].
//!
//! Handles created with [`MemoryTracker::with_identity`] share one state, so a
//! code-scoped and a review-scoped client observe each other's writes while
//! the audit log records which identity performed each mutation.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::core::context::{BodySection, ItemLifecycle, PrState, ProjectStatus, ReviewDecision, TriggerKind};
use crate::core::tree::{AgentNote, HistoryEntry};
use crate::io::tracker::{
    AuditEntry, BranchOutcome, BranchRecord, CommentRecord, DispatchRecord, ItemRecord, PrRecord,
    QuestionItem, ReactionRecord, ReviewRecord, TodoItem, Tracker, TrackerState,
};

#[derive(Debug, Clone)]
pub struct MemoryTracker {
    identity: String,
    state: Arc<Mutex<TrackerState>>,
}

impl MemoryTracker {
    pub fn new(identity: impl Into<String>, state: TrackerState) -> Self {
        Self {
            identity: identity.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Another handle on the same state acting as `identity`.
    pub fn with_identity(&self, identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: Arc::clone(&self.state),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Result<TrackerState> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("tracker state lock poisoned"))
    }

    /// Run a mutation and record it in the audit log.
    fn mutate<T>(
        &self,
        operation: String,
        apply: impl FnOnce(&mut TrackerState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock()?;
        let name = operation.split_whitespace().next().unwrap_or_default();
        if state.fail_operations.contains(name) {
            bail!("{name} failed (injected)");
        }
        let value = apply(&mut state)?;
        debug!(identity = %self.identity, %operation, "tracker mutation");
        state.audit.push(AuditEntry {
            identity: self.identity.clone(),
            operation,
        });
        Ok(value)
    }

    /// Simulate the base branch moving ahead of `name`.
    pub fn mark_branch_behind(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        let branch = state
            .branches
            .get_mut(name)
            .ok_or_else(|| anyhow!("branch {name} not found"))?;
        branch.behind_base = true;
        Ok(())
    }

    /// Make every later `operation` (e.g. `push_branch`) fail.
    pub fn fail_operation(&self, operation: &str) -> Result<()> {
        self.lock()?.fail_operations.insert(operation.to_string());
        Ok(())
    }

    fn mutate_item<T>(
        &self,
        number: u64,
        operation: String,
        apply: impl FnOnce(&mut ItemRecord) -> Result<T>,
    ) -> Result<T> {
        self.mutate(operation, |state| apply(item_mut(state, number)?))
    }
}

fn item_mut(state: &mut TrackerState, number: u64) -> Result<&mut ItemRecord> {
    state
        .items
        .get_mut(&number)
        .ok_or_else(|| anyhow!("item #{number} not found"))
}

fn pr_mut(state: &mut TrackerState, number: u64) -> Result<&mut PrRecord> {
    state
        .pull_requests
        .get_mut(&number)
        .ok_or_else(|| anyhow!("pull request #{number} not found"))
}

impl Tracker for MemoryTracker {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn item(&self, number: u64) -> Result<ItemRecord> {
        self.lock()?
            .items
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("item #{number} not found"))
    }

    fn pull_request(&self, number: u64) -> Result<PrRecord> {
        self.lock()?
            .pull_requests
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("pull request #{number} not found"))
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.branches.contains_key(name))
    }

    fn set_status(&self, number: u64, status: Option<ProjectStatus>) -> Result<()> {
        let label = status.map_or("none", ProjectStatus::as_str);
        self.mutate_item(number, format!("set_status #{number} {label}"), |item| {
            item.status = status;
            Ok(())
        })
    }

    fn increment_iteration(&self, number: u64) -> Result<u32> {
        self.mutate_item(number, format!("increment_iteration #{number}"), |item| {
            item.iteration += 1;
            Ok(item.iteration)
        })
    }

    fn record_failure(&self, number: u64) -> Result<u32> {
        self.mutate_item(number, format!("record_failure #{number}"), |item| {
            item.failures += 1;
            Ok(item.failures)
        })
    }

    fn clear_failures(&self, number: u64) -> Result<()> {
        self.mutate_item(number, format!("clear_failures #{number}"), |item| {
            item.failures = 0;
            Ok(())
        })
    }

    fn add_label(&self, number: u64, label: &str) -> Result<()> {
        self.mutate_item(number, format!("add_label #{number} {label}"), |item| {
            item.labels.insert(label.to_string());
            Ok(())
        })
    }

    fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        self.mutate_item(number, format!("remove_label #{number} {label}"), |item| {
            item.labels.remove(label);
            Ok(())
        })
    }

    fn assign(&self, number: u64, username: &str) -> Result<()> {
        self.mutate_item(number, format!("assign #{number} {username}"), |item| {
            item.assignees.insert(username.to_string());
            Ok(())
        })
    }

    fn unassign(&self, number: u64, username: &str) -> Result<()> {
        self.mutate_item(number, format!("unassign #{number} {username}"), |item| {
            item.assignees.remove(username);
            Ok(())
        })
    }

    fn append_history(&self, number: u64, entry: HistoryEntry) -> Result<bool> {
        self.mutate_item(number, format!("append_history #{number}"), |item| {
            if item.body.history.contains(&entry) {
                return Ok(false);
            }
            item.body.history.push(entry);
            Ok(true)
        })
    }

    fn upsert_section(&self, number: u64, section: BodySection, content: &str) -> Result<()> {
        let heading = section.heading();
        self.mutate_item(number, format!("upsert_section #{number} {heading}"), |item| {
            item.body.sections.insert(section, content.to_string());
            Ok(())
        })
    }

    fn add_questions(&self, number: u64, questions: &[String]) -> Result<()> {
        self.mutate_item(number, format!("add_questions #{number}"), |item| {
            for text in questions {
                if !item.body.questions.iter().any(|q| q.text == *text) {
                    item.body.questions.push(QuestionItem {
                        text: text.clone(),
                        answered: false,
                    });
                }
            }
            Ok(())
        })
    }

    fn add_todos(&self, number: u64, todos: &[String]) -> Result<()> {
        self.mutate_item(number, format!("add_todos #{number}"), |item| {
            for text in todos {
                if !item.body.todos.iter().any(|t| t.text == *text) {
                    item.body.todos.push(TodoItem {
                        text: text.clone(),
                        checked: false,
                        manual: false,
                    });
                }
            }
            Ok(())
        })
    }

    fn check_todos(&self, number: u64, texts: &[String]) -> Result<u32> {
        self.mutate_item(number, format!("check_todos #{number}"), |item| {
            let mut changed = 0;
            for todo in &mut item.body.todos {
                if !todo.checked && texts.iter().any(|text| text.trim() == todo.text.trim()) {
                    todo.checked = true;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    fn add_agent_note(&self, number: u64, note: AgentNote) -> Result<()> {
        self.mutate_item(number, format!("add_agent_note #{number}"), |item| {
            item.body.agent_notes.retain(|n| n.run_id != note.run_id);
            item.body.agent_notes.push(note);
            Ok(())
        })
    }

    fn set_lifecycle(&self, number: u64, lifecycle: ItemLifecycle) -> Result<()> {
        self.mutate_item(number, format!("set_lifecycle #{number} {lifecycle:?}"), |item| {
            item.lifecycle = lifecycle;
            Ok(())
        })
    }

    fn create_branch(&self, number: u64, name: &str, base: &str) -> Result<BranchOutcome> {
        self.mutate(format!("create_branch {name}"), |state| {
            let outcome = match state.branches.get(name) {
                Some(existing) => BranchOutcome::Existed {
                    behind: existing.behind_base,
                },
                None => {
                    state.branches.insert(
                        name.to_string(),
                        BranchRecord {
                            name: name.to_string(),
                            base: base.to_string(),
                            behind_base: false,
                            pushes: 0,
                        },
                    );
                    BranchOutcome::Created
                }
            };
            item_mut(state, number)?.branch = Some(name.to_string());
            Ok(outcome)
        })
    }

    fn rebase_branch(&self, name: &str) -> Result<()> {
        self.mutate(format!("rebase_branch {name}"), |state| {
            let branch = state
                .branches
                .get_mut(name)
                .ok_or_else(|| anyhow!("branch {name} not found"))?;
            branch.behind_base = false;
            Ok(())
        })
    }

    fn push_branch(&self, name: &str) -> Result<()> {
        self.mutate(format!("push_branch {name}"), |state| {
            let branch = state
                .branches
                .get_mut(name)
                .ok_or_else(|| anyhow!("branch {name} not found"))?;
            branch.pushes += 1;
            Ok(())
        })
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        self.mutate(format!("delete_branch {name}"), |state| {
            state.branches.remove(name);
            for item in state.items.values_mut() {
                if item.branch.as_deref() == Some(name) {
                    item.branch = None;
                }
            }
            Ok(())
        })
    }

    fn create_pr(
        &self,
        number: u64,
        branch: &str,
        base: &str,
        title: &str,
        draft: bool,
    ) -> Result<u64> {
        let author = self.identity.clone();
        self.mutate(format!("create_pr #{number} {branch}"), |state| {
            if !state.branches.contains_key(branch) {
                bail!("cannot open pull request: branch {branch} not found");
            }
            let existing = state
                .pull_requests
                .values()
                .find(|pr| pr.head_ref == branch && pr.state == PrState::Open)
                .map(|pr| pr.number);
            let pr_number = match existing {
                Some(pr_number) => pr_number,
                None => {
                    let pr_number = state.next_number();
                    state.pull_requests.insert(
                        pr_number,
                        PrRecord {
                            number: pr_number,
                            issue_number: number,
                            title: title.to_string(),
                            head_ref: branch.to_string(),
                            base_ref: base.to_string(),
                            is_draft: draft,
                            state: PrState::Open,
                            author,
                            requested_reviewers: Default::default(),
                        },
                    );
                    pr_number
                }
            };
            item_mut(state, number)?.pr = Some(pr_number);
            Ok(pr_number)
        })
    }

    fn set_pr_draft(&self, pr_number: u64, draft: bool) -> Result<()> {
        self.mutate(format!("set_pr_draft #{pr_number} {draft}"), |state| {
            pr_mut(state, pr_number)?.is_draft = draft;
            Ok(())
        })
    }

    fn request_review(&self, pr_number: u64, reviewer: &str) -> Result<()> {
        self.mutate(format!("request_review #{pr_number} {reviewer}"), |state| {
            pr_mut(state, pr_number)?
                .requested_reviewers
                .insert(reviewer.to_string());
            Ok(())
        })
    }

    fn submit_review(&self, pr_number: u64, decision: ReviewDecision, body: &str) -> Result<()> {
        let reviewer = self.identity.clone();
        self.mutate(format!("submit_review #{pr_number} {decision:?}"), |state| {
            let pr = pr_mut(state, pr_number)?;
            if pr.author == reviewer {
                bail!("{reviewer} cannot review their own pull request #{pr_number}");
            }
            state.reviews.push(ReviewRecord {
                pr_number,
                reviewer,
                decision,
                body: body.to_string(),
            });
            Ok(())
        })
    }

    fn merge_pr(&self, pr_number: u64) -> Result<()> {
        self.mutate(format!("merge_pr #{pr_number}"), |state| {
            let pr = pr_mut(state, pr_number)?;
            match pr.state {
                PrState::Merged => Ok(()),
                PrState::Closed => bail!("pull request #{pr_number} is closed"),
                PrState::Open if pr.is_draft => {
                    bail!("pull request #{pr_number} is a draft")
                }
                PrState::Open => {
                    pr.state = PrState::Merged;
                    Ok(())
                }
            }
        })
    }

    fn add_reaction(&self, subject_id: u64, content: &str) -> Result<()> {
        let by = self.identity.clone();
        self.mutate(format!("add_reaction {subject_id} {content}"), |state| {
            let reaction = ReactionRecord {
                subject_id,
                content: content.to_string(),
                by,
            };
            if !state.reactions.contains(&reaction) {
                state.reactions.push(reaction);
            }
            Ok(())
        })
    }

    fn dispatch(&self, number: u64, trigger: TriggerKind) -> Result<()> {
        self.mutate(format!("dispatch #{number} {trigger}"), |state| {
            if !state.items.contains_key(&number) {
                bail!("cannot dispatch {trigger}: item #{number} not found");
            }
            state.dispatches.push(DispatchRecord {
                issue_number: number,
                trigger,
            });
            Ok(())
        })
    }

    fn find_open_issue_by_title(&self, title: &str) -> Result<Option<u64>> {
        Ok(self
            .lock()?
            .items
            .values()
            .find(|item| item.lifecycle == ItemLifecycle::Open && item.title == title)
            .map(|item| item.number))
    }

    fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64> {
        self.mutate(format!("create_issue {title}"), |state| {
            let number = state.next_number();
            let mut item = ItemRecord::new(number, title);
            item.labels = labels.iter().cloned().collect();
            item.body
                .sections
                .insert(BodySection::Description, body.to_string());
            state.insert_item(item);
            Ok(number)
        })
    }

    fn comment(&self, number: u64, body: &str) -> Result<()> {
        let by = self.identity.clone();
        self.mutate(format!("comment #{number}"), |state| {
            if !state.items.contains_key(&number) {
                bail!("cannot comment: item #{number} not found");
            }
            state.comments.push(CommentRecord {
                issue_number: number,
                body: body.to_string(),
                by,
            });
            Ok(())
        })
    }
}

/// Load a tracker state file (JSON).
pub fn load_state(path: &Path) -> Result<TrackerState> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write a tracker state file (temp file + rename).
pub fn save_state(path: &Path, state: &TrackerState) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(state).context("serialize tracker state")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> MemoryTracker {
        let mut state = TrackerState::default();
        state.insert_item(ItemRecord::new(1, "Add search"));
        MemoryTracker::new("pev-bot", state)
    }

    /// Re-creating a PR for the same branch returns the existing one.
    #[test]
    fn create_pr_is_idempotent_per_branch() {
        let tracker = tracker();
        tracker.create_branch(1, "pev/issue-1", "main").expect("branch");
        let first = tracker
            .create_pr(1, "pev/issue-1", "main", "Add search", true)
            .expect("pr");
        let second = tracker
            .create_pr(1, "pev/issue-1", "main", "Add search", true)
            .expect("pr again");
        assert_eq!(first, second);
        assert_eq!(tracker.snapshot().expect("state").pull_requests.len(), 1);
    }

    #[test]
    fn existing_branch_reports_behind_flag() {
        let tracker = tracker();
        assert_eq!(
            tracker.create_branch(1, "b", "main").expect("create"),
            BranchOutcome::Created
        );
        tracker.mark_branch_behind("b").expect("behind");
        assert_eq!(
            tracker.create_branch(1, "b", "main").expect("again"),
            BranchOutcome::Existed { behind: true }
        );
    }

    /// The PR author cannot approve their own change.
    #[test]
    fn author_cannot_review_own_pr() {
        let code = tracker();
        let review = code.with_identity("pev-reviewer");
        code.create_branch(1, "b", "main").expect("branch");
        let pr = code.create_pr(1, "b", "main", "t", false).expect("pr");

        let err = code
            .submit_review(pr, ReviewDecision::Approved, "lgtm")
            .expect_err("self review");
        assert!(err.to_string().contains("own pull request"));

        review
            .submit_review(pr, ReviewDecision::Approved, "lgtm")
            .expect("review");
        let state = code.snapshot().expect("state");
        assert_eq!(state.reviews[0].reviewer, "pev-reviewer");
        assert!(
            state
                .audit
                .iter()
                .any(|entry| entry.identity == "pev-reviewer"
                    && entry.operation.starts_with("submit_review"))
        );
    }

    #[test]
    fn duplicate_history_rows_are_skipped() {
        let tracker = tracker();
        let entry = HistoryEntry::new(1, "-", "✅ Triaged");
        assert!(tracker.append_history(1, entry.clone()).expect("first"));
        assert!(!tracker.append_history(1, entry).expect("second"));
        assert_eq!(tracker.item(1).expect("item").body.history.len(), 1);
    }

    #[test]
    fn draft_pr_cannot_merge() {
        let tracker = tracker();
        tracker.create_branch(1, "b", "main").expect("branch");
        let pr = tracker.create_pr(1, "b", "main", "t", true).expect("pr");
        assert!(tracker.merge_pr(pr).is_err());
        tracker.set_pr_draft(pr, false).expect("ready");
        tracker.merge_pr(pr).expect("merge");
        assert_eq!(
            tracker.pull_request(pr).expect("pr").state,
            PrState::Merged
        );
    }

    #[test]
    fn injected_failures_hit_only_that_operation() {
        let tracker = tracker();
        tracker.fail_operation("add_label").expect("inject");
        let err = tracker.add_label(1, "x").expect_err("injected");
        assert!(err.to_string().contains("add_label failed"));
        tracker.assign(1, "pev-bot").expect("assign");
        assert!(tracker.item(1).expect("item").labels.is_empty());
    }

    #[test]
    fn state_file_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("tracker.json");
        let tracker = tracker();
        tracker.increment_iteration(1).expect("increment");
        let state = tracker.snapshot().expect("state");
        save_state(&path, &state).expect("save");
        assert_eq!(load_state(&path).expect("load"), state);
    }
}
