//! Success-history text and the loose matcher used to verify it.

use crate::core::action::{Action, ActionKind};
use crate::core::context::Context;
use crate::core::machine::MachineState;
use crate::core::tree::HistoryEntry;

/// Leading words compared by [`entries_match`].
const PREFIX_WORDS: usize = 3;

/// History row the cycle appends after a successful batch, if the final
/// state does not already write its own.
pub fn success_entry(
    final_state: MachineState,
    actions: &[Action],
    ctx: &Context,
) -> Option<HistoryEntry> {
    let has = |kind: ActionKind| actions.iter().any(|action| action.kind() == kind);
    let message = match final_state {
        MachineState::Iterating if has(ActionKind::CreatePr) => "✅ Opened draft PR".to_string(),
        MachineState::Iterating => "✅ Updated PR".to_string(),
        MachineState::IteratingFix => "✅ Fixed CI".to_string(),
        MachineState::Triaging => "✅ Triaged".to_string(),
        MachineState::Grooming => "✅ Groomed".to_string(),
        MachineState::Reviewing => match &ctx.pr {
            Some(pr) => format!("👀 Requested review on PR #{}", pr.number),
            None => "👀 Opened PR for review".to_string(),
        },
        MachineState::PrReviewing => "✅ Reviewed PR".to_string(),
        MachineState::PrResponding | MachineState::PrRespondingHuman => {
            "✅ Addressed review feedback".to_string()
        }
        MachineState::AwaitingMerge => "✅ Merged approved PR".to_string(),
        MachineState::Pivot => "🔀 Pivoted".to_string(),
        MachineState::Reset => "🔄 Reset".to_string(),
        MachineState::Commenting => "💬 Replied to comment".to_string(),
        MachineState::Detecting
        | MachineState::ProcessingCi
        | MachineState::ProcessingReview
        | MachineState::OrchestrationRunning
        | MachineState::OrchestrationWaiting
        | MachineState::OrchestrationComplete
        | MachineState::Blocked
        | MachineState::Error
        | MachineState::Done
        | MachineState::LoggingMergeQueue
        | MachineState::LoggingDeployment
        | MachineState::Logging => return None,
    };
    Some(entry(ctx, actions, message))
}

/// Row recorded when branch creation found an existing branch and rebased it.
pub fn rebase_entry(ctx: &Context, actions: &[Action]) -> HistoryEntry {
    entry(ctx, actions, "🔁 Rebased existing branch".to_string())
}

fn entry(ctx: &Context, actions: &[Action], message: String) -> HistoryEntry {
    let increments = actions
        .iter()
        .any(|action| action.kind() == ActionKind::IncrementIteration);
    let iteration = if increments {
        ctx.issue.iteration + 1
    } else {
        ctx.issue.iteration
    };
    HistoryEntry {
        iteration,
        phase: ctx.phase_label(),
        action: message,
        commit_sha: None,
        run_link: ctx.run_url.clone(),
    }
}

/// Lowercased words with emoji and punctuation stripped.
pub fn normalize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric() || *c == '#')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Loose equality: same iteration and phase, same leading action words.
pub fn entries_match(expected: &HistoryEntry, actual: &HistoryEntry) -> bool {
    if expected.iteration != actual.iteration || expected.phase.trim() != actual.phase.trim() {
        return false;
    }
    let expected_words = normalize(&expected.action);
    let actual_words = normalize(&actual.action);
    let n = PREFIX_WORDS.min(expected_words.len());
    n > 0 && actual_words.len() >= n && expected_words[..n] == actual_words[..n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent_output::AgentMode;
    use crate::core::context::TriggerKind;
    use crate::test_support::context;

    #[test]
    fn iterating_distinguishes_opened_and_updated() {
        let mut ctx = context(TriggerKind::IssueAssigned);
        ctx.issue.iteration = 3;
        let opened = vec![
            Action::IncrementIteration { issue_number: 42 },
            Action::CreatePr {
                issue_number: 42,
                branch_name: "b".to_string(),
                base_branch: "main".to_string(),
                title: "t".to_string(),
                draft: true,
            },
        ];
        let entry = success_entry(MachineState::Iterating, &opened, &ctx).expect("entry");
        assert_eq!(entry.action, "✅ Opened draft PR");
        assert_eq!(entry.iteration, 4);

        let updated = vec![Action::RunAgent {
            issue_number: 42,
            mode: AgentMode::Iterate,
            artifact: None,
        }];
        let entry = success_entry(MachineState::Iterating, &updated, &ctx).expect("entry");
        assert_eq!(entry.action, "✅ Updated PR");
        assert_eq!(entry.iteration, 3);
    }

    /// States that write their own history get no extra success row.
    #[test]
    fn self_recording_states_have_no_success_entry() {
        let ctx = context(TriggerKind::IssueOrchestrate);
        for state in [
            MachineState::OrchestrationRunning,
            MachineState::Done,
            MachineState::Blocked,
            MachineState::Logging,
        ] {
            assert!(success_entry(state, &[], &ctx).is_none());
        }
    }

    /// Cosmetic variation (emoji, case, punctuation, trailing words) still matches.
    #[test]
    fn loose_match_tolerates_cosmetics() {
        let expected = HistoryEntry::new(2, "-", "✅ Fixed CI");
        let actual = HistoryEntry::new(2, "-", "Fixed ci. (run 1234)");
        assert!(entries_match(&expected, &actual));

        let wrong_iteration = HistoryEntry::new(3, "-", "Fixed CI");
        assert!(!entries_match(&expected, &wrong_iteration));

        let wrong_action = HistoryEntry::new(2, "-", "Opened draft PR");
        assert!(!entries_match(&expected, &wrong_action));
    }
}
