//! Agent invocation seam.
//!
//! The [`AgentExecutor`] trait decouples the runner from the actual agent
//! backend. [`CommandAgent`] spawns the configured command with a JSON request
//! on stdin and expects a JSON object on stdout. [`MockOutputs`] returns canned
//! outputs keyed by mode (or `grooming:<role>`) without spawning processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::agent_output::{AgentMode, GroomingRole};
use crate::io::config::AgentConfig;
use crate::io::process::{Bounds, ProcessOutput, run_bounded};

/// One agent invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub mode: AgentMode,
    pub issue_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<GroomingRole>,
    /// Serialized machine context.
    pub context: Value,
    #[serde(skip)]
    pub timeout: Duration,
}

impl AgentRequest {
    /// Key used for mocks and log file names.
    pub fn key(&self) -> String {
        match self.role {
            Some(role) => role.mock_key(),
            None => self.mode.as_str().to_string(),
        }
    }
}

/// Abstraction over agent execution backends.
///
/// `Sync` so grooming can fan out one invocation per role across threads.
pub trait AgentExecutor: Sync {
    /// Run the agent and return its structured output.
    fn invoke(&self, request: &AgentRequest) -> Result<Value>;
}

/// Executor that spawns the configured agent command.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub output_limit_bytes: usize,
    /// Directory for per-invocation stdout/stderr logs.
    pub log_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn from_config(config: &AgentConfig, workdir: PathBuf, log_dir: Option<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            workdir,
            output_limit_bytes: config.output_limit_bytes,
            log_dir,
        }
    }
}

impl AgentExecutor for CommandAgent {
    #[instrument(skip_all, fields(key = %request.key(), issue = request.issue_number, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<Value> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(program = %program, workdir = %self.workdir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let input = serde_json::to_vec(request).context("serialize agent request")?;
        let bounds = Bounds {
            timeout: request.timeout,
            output_limit: self.output_limit_bytes,
        };
        let output = run_bounded(cmd, Some(&input), bounds).context("run agent command")?;

        if let Some(dir) = &self.log_dir {
            let path = dir.join(format!("agent-{}.log", request.key().replace(':', "-")));
            write_agent_log(&path, &output)?;
        }

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent failed with status {:?}",
                output.status.code()
            ));
        }
        if output.stdout.is_truncated() {
            return Err(anyhow!(
                "agent output exceeded {} bytes",
                self.output_limit_bytes
            ));
        }

        let value: Value =
            serde_json::from_slice(&output.stdout.bytes).context("parse agent output as JSON")?;
        if !value.is_object() {
            return Err(anyhow!("agent output must be a JSON object"));
        }
        debug!("agent completed successfully");
        Ok(value)
    }
}

fn write_agent_log(path: &Path, output: &ProcessOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout.render("stdout"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr.render("stderr"));
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}

/// Canned agent outputs keyed by mode or `grooming:<role>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MockOutputs(pub BTreeMap<String, Value>);

impl MockOutputs {
    pub fn insert(&mut self, key: impl Into<String>, output: Value) -> &mut Self {
        self.0.insert(key.into(), output);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl AgentExecutor for MockOutputs {
    fn invoke(&self, request: &AgentRequest) -> Result<Value> {
        let key = request.key();
        debug!(%key, "serving mock agent output");
        self.get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("no mock output for {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(mode: AgentMode, role: Option<GroomingRole>) -> AgentRequest {
        AgentRequest {
            mode,
            issue_number: 7,
            role,
            context: json!({}),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn mock_outputs_key_by_mode_and_role() {
        let mut mocks = MockOutputs::default();
        mocks
            .insert("iterate", json!({"summary": "did it"}))
            .insert("grooming:qa", json!({"ready": true}));
        let out = mocks
            .invoke(&request(AgentMode::Iterate, None))
            .expect("iterate");
        assert_eq!(out["summary"], "did it");
        let out = mocks
            .invoke(&request(AgentMode::Grooming, Some(GroomingRole::Qa)))
            .expect("qa");
        assert_eq!(out["ready"], true);
        let err = mocks
            .invoke(&request(AgentMode::Review, None))
            .expect_err("missing");
        assert!(err.to_string().contains("no mock output for review"));
    }

    /// The command receives the request on stdin and its stdout is the output.
    #[test]
    fn command_agent_parses_stdout_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; printf '{\"summary\":\"ok\"}'".to_string(),
            ],
            workdir: temp.path().to_path_buf(),
            output_limit_bytes: 4096,
            log_dir: Some(temp.path().join("logs")),
        };
        let out = agent
            .invoke(&request(AgentMode::Iterate, None))
            .expect("invoke");
        assert_eq!(out["summary"], "ok");
        assert!(temp.path().join("logs").join("agent-iterate.log").exists());
    }

    #[test]
    fn command_agent_rejects_non_object_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent {
            command: vec!["sh".to_string(), "-c".to_string(), "echo 42".to_string()],
            workdir: temp.path().to_path_buf(),
            output_limit_bytes: 4096,
            log_dir: None,
        };
        let err = agent
            .invoke(&request(AgentMode::Triage, None))
            .expect_err("not an object");
        assert!(err.to_string().contains("JSON object"));
    }
}
