//! Tolerant comparison of a real tree against the predicted candidates.
//!
//! Most tracked fields are monotonic or may be augmented by other processes,
//! so each field is compared with its own rule rather than plain equality.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::context::BodySection;
use crate::core::history::entries_match;
use crate::core::tree::{ItemState, PredictableStateTree};
use crate::error::VerificationMismatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonKind {
    Exact,
    Superset,
    Gte,
    Lte,
    HistoryEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub path: String,
    pub kind: ComparisonKind,
    pub expected: Value,
    pub actual: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDiff {
    pub index: usize,
    pub diffs: Vec<FieldDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub pass: bool,
    pub matched_index: Option<usize>,
    /// Fewest-diff candidate when nothing matched.
    pub best: Option<CandidateDiff>,
}

/// Final verdict: tree comparison AND the re-trigger check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub result: VerifyResult,
    pub retrigger_expected: bool,
    pub retrigger_observed: bool,
    pub pass: bool,
}

impl Verification {
    pub fn new(result: VerifyResult, retrigger_expected: bool, retrigger_observed: bool) -> Self {
        let pass = result.pass && retrigger_expected == retrigger_observed;
        Self {
            result,
            retrigger_expected,
            retrigger_observed,
            pass,
        }
    }

    pub fn mismatch(&self, candidates: usize) -> Option<VerificationMismatch> {
        if self.pass {
            return None;
        }
        Some(VerificationMismatch {
            candidates,
            best: self.result.best.clone(),
            retrigger_mismatch: self.retrigger_expected != self.retrigger_observed,
        })
    }
}

/// Pass when any candidate yields zero diffs; the first such index wins.
pub fn compare(expected: &[PredictableStateTree], actual: &PredictableStateTree) -> VerifyResult {
    let mut best: Option<CandidateDiff> = None;
    for (index, candidate) in expected.iter().enumerate() {
        let diffs = diff_trees(candidate, actual);
        if diffs.is_empty() {
            return VerifyResult {
                pass: true,
                matched_index: Some(index),
                best: None,
            };
        }
        if best.as_ref().is_none_or(|b| diffs.len() < b.diffs.len()) {
            best = Some(CandidateDiff { index, diffs });
        }
    }
    VerifyResult {
        pass: false,
        matched_index: None,
        best,
    }
}

/// Field diffs of `actual` against one candidate.
pub fn diff_trees(expected: &PredictableStateTree, actual: &PredictableStateTree) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    diff_items("root", &expected.root, &actual.root, &mut diffs);
    for child in &expected.children {
        let path = format!("children.{}", child.id);
        match actual.children.iter().find(|c| c.id == child.id) {
            Some(real) => diff_items(&path, child, real, &mut diffs),
            None => diffs.push(FieldDiff {
                path,
                kind: ComparisonKind::Exact,
                expected: json!(child.id),
                actual: Value::Null,
            }),
        }
    }
    diffs
}

struct Differ<'a> {
    prefix: &'a str,
    diffs: &'a mut Vec<FieldDiff>,
}

impl Differ<'_> {
    fn push(&mut self, field: &str, kind: ComparisonKind, expected: Value, actual: Value) {
        self.diffs.push(FieldDiff {
            path: format!("{}.{field}", self.prefix),
            kind,
            expected,
            actual,
        });
    }

    fn exact<T: PartialEq + Serialize>(&mut self, field: &str, expected: &T, actual: &T) {
        if expected != actual {
            self.push(field, ComparisonKind::Exact, json!(expected), json!(actual));
        }
    }

    fn gte(&mut self, field: &str, expected: u32, actual: u32) {
        if actual < expected {
            self.push(field, ComparisonKind::Gte, json!(expected), json!(actual));
        }
    }

    fn lte(&mut self, field: &str, expected: u32, actual: u32) {
        if actual > expected {
            self.push(field, ComparisonKind::Lte, json!(expected), json!(actual));
        }
    }

    fn superset(&mut self, field: &str, expected: &BTreeSet<String>, actual: &BTreeSet<String>) {
        if !expected.is_subset(actual) {
            self.push(field, ComparisonKind::Superset, json!(expected), json!(actual));
        }
    }

    /// Flags other processes may own are only enforced when predicted true.
    fn flag(&mut self, field: &str, expected: bool, actual: bool) {
        if expected && !actual {
            self.push(field, ComparisonKind::Exact, json!(true), json!(false));
        }
    }
}

fn diff_items(prefix: &str, expected: &ItemState, actual: &ItemState, diffs: &mut Vec<FieldDiff>) {
    let mut d = Differ { prefix, diffs };
    d.exact("lifecycleState", &expected.lifecycle, &actual.lifecycle);
    d.exact("status", &expected.status, &actual.status);
    d.exact("failures", &expected.failures, &actual.failures);
    d.gte("iteration", expected.iteration, actual.iteration);
    d.superset("labels", &expected.labels, &actual.labels);
    d.superset("assignees", &expected.assignees, &actual.assignees);
    d.flag("hasBranch", expected.has_branch, actual.has_branch);
    d.flag("hasPr", expected.has_pr, actual.has_pr);

    if let Some(pr) = &expected.pr {
        match &actual.pr {
            Some(real) => {
                d.exact("pr.state", &pr.state, &real.state);
                d.exact("pr.isDraft", &pr.is_draft, &real.is_draft);
            }
            None => d.push("pr", ComparisonKind::Exact, json!(pr), Value::Null),
        }
    }

    let (exp_body, act_body) = (&expected.body, &actual.body);
    for section in BodySection::ALL {
        d.flag(
            &format!("body.sections.{}", section.heading()),
            exp_body.sections.get(section),
            act_body.sections.get(section),
        );
    }
    d.gte("body.todoStats.total", exp_body.todos.total, act_body.todos.total);
    if exp_body.expects_open_todos {
        d.gte(
            "body.todoStats.unchecked",
            exp_body.todos.unchecked(),
            act_body.todos.unchecked(),
        );
        d.gte(
            "body.todoStats.uncheckedNonManual",
            exp_body.todos.unchecked_non_manual,
            act_body.todos.unchecked_non_manual,
        );
    } else {
        d.lte(
            "body.todoStats.unchecked",
            exp_body.todos.unchecked(),
            act_body.todos.unchecked(),
        );
        d.lte(
            "body.todoStats.uncheckedNonManual",
            exp_body.todos.unchecked_non_manual,
            act_body.todos.unchecked_non_manual,
        );
    }
    d.gte(
        "body.questionStats.total",
        exp_body.questions.total,
        act_body.questions.total,
    );
    // A candidate that expects open questions asserts a floor instead of a ceiling.
    if exp_body.sections.has_questions && exp_body.questions.unanswered > 0 {
        d.gte(
            "body.questionStats.unanswered",
            exp_body.questions.unanswered,
            act_body.questions.unanswered,
        );
    } else {
        d.lte(
            "body.questionStats.unanswered",
            exp_body.questions.unanswered,
            act_body.questions.unanswered,
        );
    }

    for (index, entry) in exp_body.history.iter().enumerate() {
        if !act_body.history.iter().any(|real| entries_match(entry, real)) {
            d.push(
                &format!("body.historyEntries[{index}]"),
                ComparisonKind::HistoryEntry,
                json!(entry),
                json!(act_body.history),
            );
        }
    }

    let expected_runs: BTreeSet<String> = exp_body
        .agent_notes
        .iter()
        .map(|note| note.run_id.clone())
        .collect();
    let actual_runs: BTreeSet<String> = act_body
        .agent_notes
        .iter()
        .map(|note| note.run_id.clone())
        .collect();
    d.superset("body.agentNotes", &expected_runs, &actual_runs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{ItemLifecycle, ProjectStatus};
    use crate::core::tree::HistoryEntry;
    use crate::test_support::item;

    fn tree(root: ItemState) -> PredictableStateTree {
        PredictableStateTree {
            root,
            children: Vec::new(),
        }
    }

    /// A candidate compared with itself yields no diffs.
    #[test]
    fn identical_tree_passes() {
        let mut root = item(1);
        root.labels.insert("triaged".to_string());
        root.body.history.push(HistoryEntry::new(1, "-", "✅ Triaged"));
        let candidate = tree(root);
        let result = compare(std::slice::from_ref(&candidate), &candidate);
        assert!(result.pass);
        assert_eq!(result.matched_index, Some(0));
        assert!(diff_trees(&candidate, &candidate).is_empty());
    }

    /// Extra labels and a higher iteration are tolerated.
    #[test]
    fn superset_and_monotonic_fields_tolerate_extra_data() {
        let mut expected = item(1);
        expected.labels.insert("triaged".to_string());
        expected.iteration = 2;
        let mut actual = expected.clone();
        actual.labels.insert("priority".to_string());
        actual.iteration = 5;
        assert!(diff_trees(&tree(expected), &tree(actual)).is_empty());
    }

    #[test]
    fn lower_iteration_is_a_gte_diff() {
        let mut expected = item(1);
        expected.iteration = 3;
        let mut actual = expected.clone();
        actual.iteration = 2;
        let diffs = diff_trees(&tree(expected), &tree(actual));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].kind, ComparisonKind::Gte);
        assert_eq!(diffs[0].path, "root.iteration");
    }

    /// Matching the second candidate reports its index, not the first.
    #[test]
    fn union_reports_matching_index() {
        let mut a = item(1);
        a.status = Some(ProjectStatus::Blocked);
        let mut b = item(1);
        b.status = Some(ProjectStatus::InProgress);
        let result = compare(&[tree(a), tree(b.clone())], &tree(b));
        assert!(result.pass);
        assert_eq!(result.matched_index, Some(1));
    }

    /// The fewest-diff candidate is surfaced but never counted as a pass.
    #[test]
    fn best_candidate_surfaces_on_mismatch() {
        let mut a = item(1);
        a.status = Some(ProjectStatus::Done);
        a.lifecycle = ItemLifecycle::Closed;
        let mut b = item(1);
        b.status = Some(ProjectStatus::Done);
        let actual = item(1);
        let result = compare(&[tree(a), tree(b)], &tree(actual));
        assert!(!result.pass);
        let best = result.best.expect("best");
        assert_eq!(best.index, 1);
        assert_eq!(best.diffs.len(), 1);
    }

    #[test]
    fn flags_only_enforced_when_expected_true() {
        let expected = item(1);
        let mut actual = item(1);
        actual.has_branch = true;
        actual.body.sections.has_questions = true;
        assert!(diff_trees(&tree(expected.clone()), &tree(actual.clone())).is_empty());

        let mut expected = expected;
        expected.has_pr = true;
        assert_eq!(diff_trees(&tree(expected), &tree(actual)).len(), 1);
    }

    /// History matches loosely anywhere in the real, unbounded history.
    #[test]
    fn history_entry_found_anywhere() {
        let mut expected = item(1);
        expected.body.history.push(HistoryEntry::new(4, "-", "✅ Fixed CI"));
        let mut actual = item(1);
        actual.body.history.push(HistoryEntry::new(1, "-", "✅ Opened draft PR"));
        actual.body.history.push(HistoryEntry::new(4, "-", "Fixed CI!"));
        assert!(diff_trees(&tree(expected.clone()), &tree(actual)).is_empty());

        let missing = diff_trees(&tree(expected), &tree(item(1)));
        assert_eq!(missing[0].kind, ComparisonKind::HistoryEntry);
    }

    /// Unchecked todos are a ceiling unless the candidate expects new ones.
    #[test]
    fn open_todo_expectation_is_a_floor() {
        let mut actual = item(1);
        actual.body.sections.has_todos = true;
        actual.body.todos.total = 2;
        actual.body.todos.unchecked_non_manual = 2;

        let ceiling = diff_trees(&tree(item(1)), &tree(actual.clone()));
        assert_eq!(ceiling.len(), 2);
        assert!(ceiling.iter().all(|diff| diff.kind == ComparisonKind::Lte));

        let mut expected = item(1);
        crate::core::patch::ItemPatch::new()
            .todos(true)
            .apply_to(&mut expected);
        assert!(diff_trees(&tree(expected.clone()), &tree(actual)).is_empty());

        let floor = diff_trees(&tree(expected), &tree(item(1)));
        assert!(floor.iter().any(|diff| {
            diff.path == "root.body.todoStats.uncheckedNonManual" && diff.kind == ComparisonKind::Gte
        }));
    }

    #[test]
    fn missing_child_is_exact_diff() {
        let expected = PredictableStateTree {
            root: item(1),
            children: vec![item(2)],
        };
        let diffs = diff_trees(&expected, &tree(item(1)));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "children.2");
        assert_eq!(diffs[0].kind, ComparisonKind::Exact);
    }

    #[test]
    fn retrigger_mismatch_fails_verification() {
        let candidate = tree(item(1));
        let result = compare(std::slice::from_ref(&candidate), &candidate);
        let verification = Verification::new(result, true, false);
        assert!(!verification.pass);
        let mismatch = verification.mismatch(1).expect("mismatch");
        assert!(mismatch.retrigger_mismatch);
    }
}
