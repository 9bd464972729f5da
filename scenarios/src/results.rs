//! Result capture and persistence.
//!
//! Records replay metadata and the final tracker state in the results
//! directory for later analysis.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use pev::core::machine::MachineState;
use pev::io::memory::save_state;
use pev::io::tracker::TrackerState;

use crate::outcome::Outcome;

/// Input for capturing results from a completed replay.
#[derive(Debug)]
pub struct CaptureInput<'a> {
    pub case_id: &'a str,
    pub case_path: &'a Path,
    pub run_id: &'a str,
    pub exit_code: Option<i32>,
    pub final_state: Option<MachineState>,
    /// Cycle error text when the cycle returned `Err`.
    pub cycle_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: &'a TrackerState,
}

/// Metadata for a replay, persisted to `meta.json`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScenarioMeta {
    pub case_id: String,
    pub run_id: String,
    /// SHA-256 hash of the case file for reproducibility tracking.
    pub case_hash: String,
    pub outcome: Option<Outcome>,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub exit_code: Option<i32>,
    pub final_state: Option<MachineState>,
    /// Non-fatal errors encountered during capture, plus the cycle error.
    pub errors: Vec<String>,
}

/// Write `meta.json` and `state.json` for a completed replay.
#[instrument(skip_all, fields(case_id = %input.case_id, run_id = %input.run_id))]
pub fn capture_results(run_dir: &Path, input: &CaptureInput<'_>) -> Result<()> {
    fs::create_dir_all(run_dir)
        .with_context(|| format!("create results dir {}", run_dir.display()))?;

    let mut errors = Vec::new();
    if let Some(err) = &input.cycle_error {
        errors.push(format!("cycle: {err}"));
    }

    let case_hash = match file_sha256(input.case_path) {
        Ok(hash) => hash,
        Err(err) => {
            errors.push(format!("case hash: {err}"));
            String::new()
        }
    };

    if let Err(err) = save_state(&run_dir.join("state.json"), input.state) {
        errors.push(format!("state.json: {err:#}"));
    }

    if !errors.is_empty() {
        warn!(errors = ?errors, "capture had errors");
    }

    let duration = input.finished_at - input.started_at;
    let meta = ScenarioMeta {
        case_id: input.case_id.to_string(),
        run_id: input.run_id.to_string(),
        case_hash,
        outcome: None,
        start_time: input.started_at.to_rfc3339(),
        end_time: input.finished_at.to_rfc3339(),
        duration_secs: duration.num_milliseconds() as f64 / 1000.0,
        exit_code: input.exit_code,
        final_state: input.final_state,
        errors,
    };

    write_meta(&run_dir.join("meta.json"), &meta)?;
    debug!(results_dir = %run_dir.display(), "results captured");
    Ok(())
}

pub fn update_outcome(run_dir: &Path, outcome: Outcome) -> Result<()> {
    let meta_path = run_dir.join("meta.json");
    let mut meta: ScenarioMeta = serde_json::from_str(
        &fs::read_to_string(&meta_path).with_context(|| format!("read {}", meta_path.display()))?,
    )
    .context("parse meta")?;
    meta.outcome = Some(outcome);
    write_meta(&meta_path, &meta)?;
    Ok(())
}

pub fn results_dir(base_dir: &Path, case_id: &str, run_id: &str) -> PathBuf {
    base_dir.join(case_id).join(run_id)
}

pub(crate) fn write_meta(path: &Path, meta: &ScenarioMeta) -> Result<()> {
    let contents = serde_json::to_string_pretty(meta).context("serialize meta")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write meta {}", path.display()))?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}
