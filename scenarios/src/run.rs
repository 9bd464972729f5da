//! Case execution orchestration.
//!
//! Seeds an in-memory tracker from the case, replays one cycle, then
//! captures results and judges them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use pev::cycle::{CycleOptions, run_cycle};
use pev::io::config::PevConfig;
use pev::io::memory::MemoryTracker;
use pev::runner::ScopedClients;

use crate::case::CaseFile;
use crate::config::apply_case_config;
use crate::judge::{Observed, run_checks, write_judgment};
use crate::outcome::{Outcome, classify_outcome};
use crate::results::{CaptureInput, capture_results, results_dir, update_outcome};

/// Result of running a single case.
#[derive(Debug)]
pub struct RunOutcome {
    /// Unique identifier for this replay.
    pub run_id: String,
    /// Path to the results directory.
    pub results_dir: PathBuf,
    pub outcome: Outcome,
}

pub fn run_id(run_num: u32) -> String {
    format!("scenario-{}-{run_num}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Run a case end-to-end: seed, cycle, capture, checks.
#[instrument(skip_all, fields(case_id = %case.case.id, run_num))]
pub fn run_case(
    results_base: &Path,
    case_path: &Path,
    case: &CaseFile,
    run_num: u32,
) -> Result<RunOutcome> {
    info!("case run started");
    let config = apply_case_config(PevConfig::default(), &case.config)?;
    let mocks = case.mock_outputs().context("mock outputs")?;

    let run_id = run_id(run_num);
    let run_dir = results_dir(results_base, &case.case.id, &run_id);

    let code = MemoryTracker::new(&config.bot_username, case.tracker_state(&config.bot_username));
    let review = code.with_identity(&config.reviewer_username);
    let event = case.event(&run_id);

    let mut options = CycleOptions::from_config(&config);
    options.log_dir = Some(run_dir.join("engine"));

    let started_at = Utc::now();
    debug!("running cycle");
    let result = run_cycle(
        ScopedClients::new(&code, &review),
        &mocks,
        &event,
        &config,
        &options,
    );
    let finished_at = Utc::now();

    let (outcome, cycle_error) = match &result {
        Ok(outcome) => (Some(outcome), None),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "cycle errored");
            (None, Some(format!("{err:#}")))
        }
    };
    let exit_code = outcome.map(|outcome| outcome.exit_code);
    info!(
        exit_code = ?exit_code,
        duration_secs = (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        "cycle finished"
    );

    let state = code.snapshot().context("snapshot tracker")?;
    capture_results(
        &run_dir,
        &CaptureInput {
            case_id: &case.case.id,
            case_path,
            run_id: &run_id,
            exit_code,
            final_state: outcome.map(|outcome| outcome.final_state),
            cycle_error,
            started_at,
            finished_at,
            state: &state,
        },
    )
    .context("capture results")?;

    debug!("running checks");
    let judgment = run_checks(
        &case.checks,
        &Observed {
            outcome,
            exit_code: exit_code.unwrap_or(pev::exit_codes::FAILED),
            state: &state,
        },
    );
    write_judgment(&run_dir.join("checks.json"), &judgment).context("write checks")?;

    let classified = classify_outcome(exit_code, &judgment);
    update_outcome(&run_dir, classified).context("update outcome")?;
    info!(outcome = ?classified, results_dir = %run_dir.display(), "case run complete");

    Ok(RunOutcome {
        run_id,
        results_dir: run_dir,
        outcome: classified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const TRIAGE: &str = r#"
[case]
id = "triage-fork"
trigger = "issue-triage"
issue = 7

[[items]]
number = 7
title = "Add export"

[mock]
triage = '{"labels": ["enhancement"], "requirements": ["CSV export"]}'

[[checks]]
type = "final_state"
state = "triaging"

[[checks]]
type = "verified"

[[checks]]
type = "has_label"
issue = 7
label = "enhancement"
"#;

    #[test]
    fn run_id_format() {
        let id = run_id(3);
        assert!(id.starts_with("scenario-"));
        assert!(id.ends_with("-3"));
    }

    #[test]
    fn replays_case_and_writes_results() {
        let temp = tempdir().expect("tempdir");
        let case_path = temp.path().join("triage-fork.toml");
        fs::write(&case_path, TRIAGE).expect("case");
        let case = CaseFile::load(&case_path).expect("load");

        let outcome = run_case(&temp.path().join("results"), &case_path, &case, 1).expect("run");

        assert_eq!(outcome.outcome, Outcome::Success);
        assert!(outcome.results_dir.join("meta.json").exists());
        assert!(outcome.results_dir.join("checks.json").exists());
        assert!(outcome.results_dir.join("state.json").exists());
        assert!(
            outcome
                .results_dir
                .join("engine")
                .join(&outcome.run_id)
                .join("meta.json")
                .exists()
        );
    }

    /// A missing mock fails the agent action; the case still records a result.
    #[test]
    fn failed_cycle_is_judged() {
        let temp = tempdir().expect("tempdir");
        let case_path = temp.path().join("triage-fork.toml");
        let without_mock = TRIAGE.replace(
            "triage = '{\"labels\": [\"enhancement\"], \"requirements\": [\"CSV export\"]}'",
            "",
        );
        fs::write(&case_path, without_mock).expect("case");
        let case = CaseFile::load(&case_path).expect("load");

        let outcome = run_case(&temp.path().join("results"), &case_path, &case, 1).expect("run");
        assert_eq!(outcome.outcome, Outcome::Fail);
    }

    #[test]
    fn bundled_grooming_case_succeeds() {
        let temp = tempdir().expect("tempdir");
        let case_path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("cases")
            .join("grooming-ready.toml");
        let case = CaseFile::load(&case_path).expect("load");

        let outcome = run_case(&temp.path().join("results"), &case_path, &case, 1).expect("run");

        let checks = fs::read_to_string(outcome.results_dir.join("checks.json")).expect("checks");
        assert_eq!(outcome.outcome, Outcome::Success, "{checks}");
    }
}
