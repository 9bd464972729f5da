//! Agent modes and the structured outputs each mode produces.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::context::ReviewDecision;

/// What an agent invocation is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    Triage,
    Iterate,
    FixCi,
    Review,
    PrResponse,
    PrHumanResponse,
    Comment,
    Pivot,
    Grooming,
}

impl AgentMode {
    pub const ALL: [AgentMode; 9] = [
        AgentMode::Triage,
        AgentMode::Iterate,
        AgentMode::FixCi,
        AgentMode::Review,
        AgentMode::PrResponse,
        AgentMode::PrHumanResponse,
        AgentMode::Comment,
        AgentMode::Pivot,
        AgentMode::Grooming,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Triage => "triage",
            AgentMode::Iterate => "iterate",
            AgentMode::FixCi => "fix-ci",
            AgentMode::Review => "review",
            AgentMode::PrResponse => "pr-response",
            AgentMode::PrHumanResponse => "pr-human-response",
            AgentMode::Comment => "comment",
            AgentMode::Pivot => "pivot",
            AgentMode::Grooming => "grooming",
        }
    }

    /// Modes whose real runs leave commits on the work branch.
    pub fn produces_code(self) -> bool {
        matches!(
            self,
            AgentMode::Iterate | AgentMode::FixCi | AgentMode::PrResponse | AgentMode::PrHumanResponse
        )
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory role consulted during grooming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroomingRole {
    Pm,
    Engineer,
    Qa,
    Research,
}

impl GroomingRole {
    pub const ALL: [GroomingRole; 4] = [
        GroomingRole::Pm,
        GroomingRole::Engineer,
        GroomingRole::Qa,
        GroomingRole::Research,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GroomingRole::Pm => "pm",
            GroomingRole::Engineer => "engineer",
            GroomingRole::Qa => "qa",
            GroomingRole::Research => "research",
        }
    }

    /// Mock-table key for this role.
    pub fn mock_key(self) -> String {
        format!("grooming:{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriageOutput {
    pub requirements: Vec<String>,
    pub questions: Vec<String>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IterateOutput {
    pub summary: String,
    /// Todo texts the agent claims to have completed.
    pub todos_completed: Vec<String>,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutput {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroomingRoleOutput {
    pub ready: bool,
    pub questions: Vec<String>,
    pub recommend_split: bool,
    pub notes: String,
    /// Proposed implementation todos.
    pub todos: Vec<String>,
}

impl GroomingRoleOutput {
    /// Stand-in for a role whose invocation failed: not ready, no questions.
    pub fn conservative() -> Self {
        Self::default()
    }
}

/// Joined outcome of a grooming round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroomingDecision {
    Ready,
    NeedsInfo,
    NeedsSplit,
}

/// Per-role results plus the joined decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroomingOutput {
    pub decision: GroomingDecision,
    pub roles: Vec<(GroomingRole, GroomingRoleOutput)>,
    pub questions: Vec<String>,
    pub approach: String,
    pub todos: Vec<String>,
}

/// Join role results into one decision.
///
/// Questions win over a split recommendation, which wins over readiness. An
/// empty round is never ready.
pub fn decide_grooming(outputs: &[(GroomingRole, GroomingRoleOutput)]) -> GroomingDecision {
    if outputs.iter().any(|(_, out)| !out.questions.is_empty()) {
        return GroomingDecision::NeedsInfo;
    }
    if outputs.iter().any(|(_, out)| out.recommend_split) {
        return GroomingDecision::NeedsSplit;
    }
    if !outputs.is_empty() && outputs.iter().all(|(_, out)| out.ready) {
        return GroomingDecision::Ready;
    }
    GroomingDecision::NeedsInfo
}

pub fn join_grooming(outputs: Vec<(GroomingRole, GroomingRoleOutput)>) -> GroomingOutput {
    let decision = decide_grooming(&outputs);
    let questions = outputs
        .iter()
        .flat_map(|(_, out)| out.questions.iter().cloned())
        .collect();
    let approach = outputs
        .iter()
        .filter(|(_, out)| !out.notes.trim().is_empty())
        .map(|(role, out)| format!("- **{}**: {}", role.as_str(), out.notes.trim()))
        .collect::<Vec<_>>()
        .join("\n");
    let mut todos: Vec<String> = Vec::new();
    for (_, out) in &outputs {
        for todo in &out.todos {
            let todo = todo.trim();
            if !todo.is_empty() && !todos.iter().any(|t| t == todo) {
                todos.push(todo.to_string());
            }
        }
    }
    GroomingOutput {
        decision,
        roles: outputs,
        questions,
        approach,
        todos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> GroomingRoleOutput {
        GroomingRoleOutput {
            ready: true,
            ..GroomingRoleOutput::default()
        }
    }

    #[test]
    fn all_ready_roles_yield_ready() {
        let outputs = vec![(GroomingRole::Pm, ready()), (GroomingRole::Qa, ready())];
        assert_eq!(decide_grooming(&outputs), GroomingDecision::Ready);
    }

    /// A single question outranks a split recommendation.
    #[test]
    fn questions_take_precedence_over_split() {
        let asking = GroomingRoleOutput {
            questions: vec!["which API?".to_string()],
            ..ready()
        };
        let splitting = GroomingRoleOutput {
            recommend_split: true,
            ..ready()
        };
        let outputs = vec![(GroomingRole::Pm, splitting), (GroomingRole::Engineer, asking)];
        assert_eq!(decide_grooming(&outputs), GroomingDecision::NeedsInfo);
    }

    /// A degraded role (conservative default) blocks readiness.
    #[test]
    fn conservative_default_is_not_ready() {
        let outputs = vec![
            (GroomingRole::Pm, ready()),
            (GroomingRole::Research, GroomingRoleOutput::conservative()),
        ];
        assert_eq!(decide_grooming(&outputs), GroomingDecision::NeedsInfo);
    }

    #[test]
    fn empty_round_needs_info() {
        assert_eq!(decide_grooming(&[]), GroomingDecision::NeedsInfo);
    }

    #[test]
    fn join_collects_notes_into_approach() {
        let out = GroomingRoleOutput {
            notes: "split the parser first".to_string(),
            ..ready()
        };
        let joined = join_grooming(vec![(GroomingRole::Engineer, out)]);
        assert_eq!(joined.decision, GroomingDecision::Ready);
        assert!(joined.approach.contains("engineer"));
    }

    /// Todos proposed by several roles are merged without duplicates.
    #[test]
    fn join_dedups_todos() {
        let pm = GroomingRoleOutput {
            todos: vec!["Write parser".to_string(), "Add docs".to_string()],
            ..ready()
        };
        let qa = GroomingRoleOutput {
            todos: vec![" Write parser ".to_string(), "Add tests".to_string()],
            ..ready()
        };
        let joined = join_grooming(vec![(GroomingRole::Pm, pm), (GroomingRole::Qa, qa)]);
        assert_eq!(joined.todos, vec!["Write parser", "Add docs", "Add tests"]);
    }
}
