//! Per-cycle product artifacts under `<log-dir>/<run-id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::action::Action;
use crate::core::compare::Verification;
use crate::core::context::Context as MachineContext;
use crate::core::machine::MachineState;
use crate::core::tree::PredictableStateTree;
use crate::runner::ExecutionReport;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub run_id: String,
    pub issue_number: u64,
    pub trigger: String,
    pub final_state: MachineState,
    pub trace: Vec<MachineState>,
    pub dry_run: bool,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub context_path: PathBuf,
    pub actions_path: PathBuf,
    pub candidates_path: PathBuf,
    pub report_path: PathBuf,
    pub actual_path: PathBuf,
    pub verification_path: PathBuf,
}

impl RunPaths {
    pub fn new(log_dir: &Path, run_id: &str) -> Self {
        let dir = log_dir.join(run_id);
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            context_path: dir.join("context.json"),
            actions_path: dir.join("actions.json"),
            candidates_path: dir.join("candidates.json"),
            report_path: dir.join("report.json"),
            actual_path: dir.join("actual.json"),
            verification_path: dir.join("verification.json"),
        }
    }
}

pub struct RunWriteRequest<'a> {
    pub log_dir: &'a Path,
    pub meta: &'a RunMeta,
    pub context: &'a MachineContext,
    pub actions: &'a [Action],
    pub candidates: &'a [PredictableStateTree],
    pub report: &'a ExecutionReport,
    /// Absent when the cycle stopped before the post-execution fetch.
    pub actual: Option<&'a PredictableStateTree>,
    pub verification: Option<&'a Verification>,
}

pub fn write_run(request: &RunWriteRequest<'_>) -> Result<RunPaths> {
    let paths = RunPaths::new(request.log_dir, &request.meta.run_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run log dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    write_json(&paths.context_path, request.context)?;
    write_json(&paths.actions_path, &request.actions)?;
    write_json(&paths.candidates_path, &request.candidates)?;
    write_json(&paths.report_path, request.report)?;
    if let Some(actual) = request.actual {
        write_json(&paths.actual_path, actual)?;
    }
    if let Some(verification) = request.verification {
        write_json(&paths.verification_path, verification)?;
    }
    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
