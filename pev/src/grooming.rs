//! Concurrent grooming round: one agent invocation per advisory role.

use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::agent_output::{
    AgentMode, GroomingOutput, GroomingRole, GroomingRoleOutput, join_grooming,
};
use crate::io::agent::{AgentExecutor, AgentRequest};

/// Fan out to every role on scoped threads and join all results.
///
/// A role whose invocation fails, panics, or returns an unparseable output
/// degrades to [`GroomingRoleOutput::conservative`]; the round never aborts.
#[instrument(skip_all, fields(issue = issue_number, roles = roles.len()))]
pub fn run_grooming(
    agent: &dyn AgentExecutor,
    context: &Value,
    issue_number: u64,
    roles: &[GroomingRole],
    timeout: Duration,
) -> GroomingOutput {
    let outputs = thread::scope(|scope| {
        let handles: Vec<_> = roles
            .iter()
            .map(|&role| {
                let request = AgentRequest {
                    mode: AgentMode::Grooming,
                    issue_number,
                    role: Some(role),
                    context: context.clone(),
                    timeout,
                };
                (role, scope.spawn(move || agent.invoke(&request)))
            })
            .collect();

        handles
            .into_iter()
            .map(|(role, handle)| {
                let output = match handle.join() {
                    Ok(Ok(value)) => parse_role_output(role, value),
                    Ok(Err(err)) => {
                        warn!(role = role.as_str(), err = %format!("{err:#}"), "grooming role failed");
                        GroomingRoleOutput::conservative()
                    }
                    Err(_) => {
                        warn!(role = role.as_str(), "grooming role panicked");
                        GroomingRoleOutput::conservative()
                    }
                };
                (role, output)
            })
            .collect::<Vec<_>>()
    });

    let joined = join_grooming(outputs);
    debug!(decision = ?joined.decision, "grooming joined");
    joined
}

fn parse_role_output(role: GroomingRole, value: Value) -> GroomingRoleOutput {
    match serde_json::from_value(value) {
        Ok(output) => output,
        Err(err) => {
            warn!(role = role.as_str(), err = %err, "invalid grooming output");
            GroomingRoleOutput::conservative()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent_output::GroomingDecision;
    use crate::io::agent::MockOutputs;
    use serde_json::json;

    fn run(mocks: &MockOutputs, roles: &[GroomingRole]) -> GroomingOutput {
        run_grooming(mocks, &json!({}), 9, roles, Duration::from_secs(5))
    }

    #[test]
    fn all_roles_ready_is_ready() {
        let mut mocks = MockOutputs::default();
        for role in GroomingRole::ALL {
            mocks.insert(role.mock_key(), json!({"ready": true, "todos": ["Build it"]}));
        }
        let out = run(&mocks, &GroomingRole::ALL);
        assert_eq!(out.decision, GroomingDecision::Ready);
        assert_eq!(out.roles.len(), 4);
        assert_eq!(out.todos, vec!["Build it"]);
    }

    /// A missing role output degrades to not-ready instead of failing the round.
    #[test]
    fn failed_role_degrades_to_conservative() {
        let mut mocks = MockOutputs::default();
        mocks.insert(GroomingRole::Pm.mock_key(), json!({"ready": true}));
        let out = run(&mocks, &[GroomingRole::Pm, GroomingRole::Qa]);
        assert_eq!(out.decision, GroomingDecision::NeedsInfo);
        assert_eq!(out.roles[1], (GroomingRole::Qa, GroomingRoleOutput::conservative()));
    }

    #[test]
    fn malformed_role_output_is_conservative() {
        let mut mocks = MockOutputs::default();
        mocks.insert(GroomingRole::Engineer.mock_key(), json!({"ready": "yes"}));
        let out = run(&mocks, &[GroomingRole::Engineer]);
        assert_eq!(out.roles[0].1, GroomingRoleOutput::conservative());
    }

    #[test]
    fn role_questions_are_collected() {
        let mut mocks = MockOutputs::default();
        mocks.insert(GroomingRole::Pm.mock_key(), json!({"ready": true}));
        mocks.insert(
            GroomingRole::Research.mock_key(),
            json!({"questions": ["Which vendor?"]}),
        );
        let out = run(&mocks, &[GroomingRole::Pm, GroomingRole::Research]);
        assert_eq!(out.decision, GroomingDecision::NeedsInfo);
        assert_eq!(out.questions, vec!["Which vendor?"]);
    }
}
