//! Fold of per-action predictions into the acceptable-outcome set.

use crate::core::action::{Action, ActionKind};
use crate::core::context::Context;
use crate::core::history::{rebase_entry, success_entry};
use crate::core::machine::MachineState;
use crate::core::predictors::{PredictEnv, predict_action};
use crate::core::tree::PredictableStateTree;
use crate::error::PredictionOverflow;

/// Fork ceiling. Exceeding it is a modeling defect, never truncated.
pub const MAX_CANDIDATES: usize = 20;

/// Every tree the real post-execution state may legitimately equal.
pub fn predict(
    actions: &[Action],
    tree: &PredictableStateTree,
    ctx: &Context,
    final_state: MachineState,
) -> Result<Vec<PredictableStateTree>, PredictionOverflow> {
    let base = tree.for_prediction();
    let mut candidates = fold(actions, base.clone(), ctx)?;

    if let Some(entry) = success_entry(final_state, actions, ctx) {
        for candidate in &mut candidates {
            candidate.root.body.history.push(entry.clone());
        }
    }

    if let Some(position) = actions
        .iter()
        .position(|action| action.kind() == ActionKind::CreateBranch)
    {
        let prefix = &actions[..=position];
        let mut rebased = fold(prefix, base, ctx)?;
        let entry = rebase_entry(ctx, prefix);
        for candidate in &mut rebased {
            candidate.root.body.history.push(entry.clone());
        }
        candidates.extend(rebased);
        if candidates.len() > MAX_CANDIDATES {
            return Err(PredictionOverflow {
                count: candidates.len(),
                limit: MAX_CANDIDATES,
                index: position,
                kind: ActionKind::CreateBranch.to_string(),
            });
        }
    }

    Ok(candidates)
}

fn fold(
    actions: &[Action],
    start: PredictableStateTree,
    ctx: &Context,
) -> Result<Vec<PredictableStateTree>, PredictionOverflow> {
    let mut candidates = vec![start];
    for (index, action) in actions.iter().enumerate() {
        let target_id = action.target_issue();
        let mut next = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let target = match target_id {
                None => Some(&candidate.root),
                Some(id) => candidate.node(id),
            };
            let patches = target.and_then(|target| {
                let env = PredictEnv { ctx };
                predict_action(action, target, &env)
            });
            match patches {
                None => next.push(candidate),
                Some(patches) => {
                    for patch in patches {
                        let mut forked = candidate.clone();
                        if let Some(node) = forked.node_mut(target_id) {
                            patch.apply_to(node);
                        }
                        next.push(forked);
                    }
                }
            }
            if next.len() > MAX_CANDIDATES {
                return Err(PredictionOverflow {
                    count: next.len(),
                    limit: MAX_CANDIDATES,
                    index,
                    kind: action.kind().to_string(),
                });
            }
        }
        candidates = next;
    }
    Ok(candidates)
}
