//! Engine configuration stored under `.pev/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::action::ActionKind;
use crate::core::agent_output::GroomingRole;
use crate::core::context::ContextConfig;

/// Default config location relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".pev/config.toml";

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PevConfig {
    /// Failure count at which the circuit breaker blocks the item.
    pub max_retries: u32,

    /// Identity the agent acts as (assignment starts iteration).
    pub bot_username: String,

    /// Identity requested for, and acting as, the reviewer.
    pub reviewer_username: String,

    pub base_branch: String,

    /// Wall-clock budget for one predict-execute-verify cycle.
    pub cycle_timeout_secs: u64,

    pub grooming_roles: Vec<GroomingRole>,

    /// Stop the batch on the first non-recovered action failure.
    pub halt_on_error: bool,

    /// Action kinds whose failures never halt the batch.
    pub continue_on: Vec<ActionKind>,

    pub agent: AgentConfig,

    pub failure_report: FailureReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command; receives a JSON request on stdin, prints a JSON response.
    pub command: Vec<String>,

    /// Per-invocation timeout, further bounded by the cycle deadline.
    pub timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["pev-agent".to_string()],
            timeout_secs: 20 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FailureReportConfig {
    pub enabled: bool,
    /// Job name used in the report title.
    pub job_name: String,
    pub label: String,
}

impl Default for FailureReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            job_name: "pev".to_string(),
            label: "pev-failure".to_string(),
        }
    }
}

impl Default for PevConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            bot_username: "pev-bot".to_string(),
            reviewer_username: "pev-reviewer".to_string(),
            base_branch: "main".to_string(),
            cycle_timeout_secs: 30 * 60,
            grooming_roles: GroomingRole::ALL.to_vec(),
            halt_on_error: true,
            continue_on: Vec::new(),
            agent: AgentConfig::default(),
            failure_report: FailureReportConfig::default(),
        }
    }
}

impl PevConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.bot_username.trim().is_empty() {
            return Err(anyhow!("bot_username must be non-empty"));
        }
        if self.reviewer_username.trim().is_empty() {
            return Err(anyhow!("reviewer_username must be non-empty"));
        }
        if self.bot_username == self.reviewer_username {
            return Err(anyhow!(
                "bot_username and reviewer_username must differ (the agent cannot review itself)"
            ));
        }
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must be non-empty"));
        }
        if self.cycle_timeout_secs == 0 {
            return Err(anyhow!("cycle_timeout_secs must be > 0"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.failure_report.enabled && self.failure_report.job_name.trim().is_empty() {
            return Err(anyhow!("failure_report.job_name must be non-empty"));
        }
        Ok(())
    }

    /// Bounded view handed to the machine through the context.
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            max_retries: self.max_retries,
            bot_username: self.bot_username.clone(),
            reviewer_username: self.reviewer_username.clone(),
            base_branch: self.base_branch.clone(),
            grooming_roles: self.grooming_roles.clone(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PevConfig::default()`.
pub fn load_config(path: &Path) -> Result<PevConfig> {
    if !path.exists() {
        let cfg = PevConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PevConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PevConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
