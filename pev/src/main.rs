//! Predict-execute-verify engine CLI.
//!
//! Each command handles exactly one trigger against a tracker state file and
//! exits with a stable code (see `pev::exit_codes`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{error, warn};

use pev::core::action::parse_action_list;
use pev::core::compare::compare;
use pev::core::tree::PredictableStateTree;
use pev::cycle::{CycleOptions, CycleOutcome, plan_cycle, run_cycle};
use pev::error::VerificationMismatch;
use pev::exit_codes;
use pev::io::agent::{AgentExecutor, CommandAgent, MockOutputs};
use pev::io::config::{DEFAULT_CONFIG_PATH, PevConfig, load_config};
use pev::io::context::build_context;
use pev::io::failure_report::{FailureDetails, file_failure_report};
use pev::io::memory::{MemoryTracker, load_state, save_state};
use pev::io::tracker::TriggerEvent;
use pev::runner::{ActionStatus, Runner, RunnerOptions, ScopedClients};

#[derive(Parser)]
#[command(
    name = "pev",
    version,
    about = "Predict-execute-verify engine for agent-driven issue workflows"
)]
struct Cli {
    /// Engine config (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct Input {
    /// Trigger event (JSON).
    #[arg(long)]
    event: PathBuf,
    /// Tracker state file (JSON).
    #[arg(long)]
    state: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Print the final machine state and the action list.
    Plan {
        #[command(flatten)]
        input: Input,
    },
    /// Print the predicted candidate trees.
    Predict {
        #[command(flatten)]
        input: Input,
    },
    /// Validate and execute a JSON action list.
    Execute {
        #[command(flatten)]
        input: Input,
        /// Action list (JSON array).
        #[arg(long)]
        actions: PathBuf,
        #[arg(long)]
        dry_run: bool,
        /// Mock agent outputs (JSON object keyed by mode or `grooming:<role>`).
        #[arg(long)]
        mock_outputs: Option<PathBuf>,
        /// Directory holding agent output artifacts.
        #[arg(long)]
        artifact_dir: Option<PathBuf>,
    },
    /// Run a full predict-execute-verify cycle.
    Run {
        #[command(flatten)]
        input: Input,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        mock_outputs: Option<PathBuf>,
        /// Git work tree for placeholder commits after code-producing agent runs.
        #[arg(long)]
        placeholder_commit: Option<PathBuf>,
        #[arg(long)]
        artifact_dir: Option<PathBuf>,
        /// Write run artifacts under `<log-dir>/<run-id>/`.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Compare a tree against a candidate file.
    Verify {
        /// Candidate trees (JSON array).
        #[arg(long)]
        expected: PathBuf,
        /// Real tree (JSON).
        #[arg(long)]
        actual: PathBuf,
    },
}

fn main() {
    pev::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<VerificationMismatch>().is_some() {
        exit_codes::MISMATCH
    } else {
        exit_codes::FAILED
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Plan { input } => cmd_plan(&config, &input),
        Command::Predict { input } => cmd_predict(&config, &input),
        Command::Execute {
            input,
            actions,
            dry_run,
            mock_outputs,
            artifact_dir,
        } => {
            let options = RunnerOptions {
                dry_run,
                artifact_dir,
                ..RunnerOptions::from_config(&config)
            };
            cmd_execute(&config, &input, &actions, mock_outputs.as_deref(), &options)
        }
        Command::Run {
            input,
            dry_run,
            mock_outputs,
            placeholder_commit,
            artifact_dir,
            log_dir,
        } => {
            let mut options = CycleOptions::from_config(&config);
            options.runner.dry_run = dry_run;
            options.runner.placeholder_commit = placeholder_commit;
            options.runner.artifact_dir = artifact_dir;
            options.log_dir = log_dir;
            cmd_run(&config, &input, mock_outputs.as_deref(), &options)
        }
        Command::Verify { expected, actual } => cmd_verify(&expected, &actual),
    }
}

fn cmd_plan(config: &PevConfig, input: &Input) -> Result<i32> {
    let (tracker, event) = load_input(config, input)?;
    let plan = plan_cycle(&tracker, &event, config)?;
    print_json(&json!({
        "finalState": plan.final_state,
        "trace": plan.trace,
        "actions": plan.actions,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_predict(config: &PevConfig, input: &Input) -> Result<i32> {
    let (tracker, event) = load_input(config, input)?;
    let plan = plan_cycle(&tracker, &event, config)?;
    print_json(&plan.candidates)?;
    Ok(exit_codes::OK)
}

fn cmd_execute(
    config: &PevConfig,
    input: &Input,
    actions_path: &Path,
    mock_outputs: Option<&Path>,
    options: &RunnerOptions,
) -> Result<i32> {
    let (code, event) = load_input(config, input)?;
    let review = code.with_identity(&config.reviewer_username);
    let actions = parse_action_list(&read_json::<Value>(actions_path)?)?;
    let ctx = build_context(&code, &event, config)?;
    let agent = load_agent(config, mock_outputs, None)?;

    let report = Runner::new(ScopedClients::new(&code, &review), agent.as_ref(), &ctx, options)
        .execute(&actions)?;
    if !options.dry_run {
        save_state(&input.state, &code.snapshot()?)?;
    }
    print_json(&report)?;
    Ok(report.exit_code())
}

fn cmd_run(
    config: &PevConfig,
    input: &Input,
    mock_outputs: Option<&Path>,
    options: &CycleOptions,
) -> Result<i32> {
    let (code, event) = load_input(config, input)?;
    let review = code.with_identity(&config.reviewer_username);
    let agent = load_agent(config, mock_outputs, options.log_dir.clone())?;

    let result = run_cycle(
        ScopedClients::new(&code, &review),
        agent.as_ref(),
        &event,
        config,
        options,
    );

    let failure = match &result {
        Ok(outcome) => {
            print_json(&json!({
                "runId": outcome.run_id(),
                "finalState": outcome.final_state,
                "report": outcome.report,
                "verification": outcome.verification,
                "exitCode": outcome.exit_code,
            }))?;
            failure_message(outcome)
        }
        Err(err) => Some(format!("{err:#}")),
    };

    if !options.runner.dry_run {
        if let Some(error) = &failure
            && config.failure_report.enabled
        {
            let run_id = match &result {
                Ok(outcome) => outcome.run_id().to_string(),
                Err(_) => event.run_id.clone().unwrap_or_default(),
            };
            let details = FailureDetails {
                issue_number: event.issue_number,
                trigger: event.kind.as_str(),
                run_id: &run_id,
                run_url: event.run_url.as_deref(),
                error,
            };
            if let Err(err) = file_failure_report(&code, &config.failure_report, &details) {
                warn!(err = %format!("{err:#}"), "failure report not filed");
            }
        }
        save_state(&input.state, &code.snapshot()?)?;
    }

    let outcome = result?;
    if let Some(error) = failure {
        error!(exit_code = outcome.exit_code, "{error}");
    }
    Ok(outcome.exit_code)
}

/// Failure text worth a tracking record: failed actions or a mismatch.
fn failure_message(outcome: &CycleOutcome) -> Option<String> {
    let failed: Vec<String> = outcome
        .report
        .records
        .iter()
        .filter_map(|record| match &record.status {
            ActionStatus::Failed { error } => {
                Some(format!("action #{} ({}): {error}", record.index, record.kind))
            }
            _ => None,
        })
        .collect();
    if !failed.is_empty() {
        return Some(failed.join("\n"));
    }
    outcome
        .verification
        .as_ref()
        .and_then(|v| v.mismatch(outcome.candidates.len()))
        .map(|mismatch| mismatch.to_string())
}

fn cmd_verify(expected_path: &Path, actual_path: &Path) -> Result<i32> {
    let expected: Vec<PredictableStateTree> = read_json(expected_path)?;
    let actual: PredictableStateTree = read_json(actual_path)?;
    let result = compare(&expected, &actual);
    print_json(&result)?;
    if !result.pass {
        return Err(VerificationMismatch {
            candidates: expected.len(),
            best: result.best,
            retrigger_mismatch: false,
        }
        .into());
    }
    Ok(exit_codes::OK)
}

fn load_input(config: &PevConfig, input: &Input) -> Result<(MemoryTracker, TriggerEvent)> {
    let event: TriggerEvent = read_json(&input.event)?;
    let state = load_state(&input.state)?;
    Ok((MemoryTracker::new(&config.bot_username, state), event))
}

fn load_agent(
    config: &PevConfig,
    mock_outputs: Option<&Path>,
    log_dir: Option<PathBuf>,
) -> Result<Box<dyn AgentExecutor>> {
    if let Some(path) = mock_outputs {
        let mocks: MockOutputs = read_json(path)?;
        return Ok(Box::new(mocks));
    }
    let workdir = std::env::current_dir().context("resolve working directory")?;
    Ok(Box::new(CommandAgent::from_config(&config.agent, workdir, log_dir)))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
