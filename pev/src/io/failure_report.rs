//! Auto-filed tracking records for failed cycles.
//!
//! One open record per job and item: a repeat failure comments on the existing
//! record instead of filing a new one.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{info, instrument};

use crate::io::config::FailureReportConfig;
use crate::io::tracker::Tracker;

const FAILURE_TEMPLATE: &str = include_str!("templates/failure_report.md");

#[derive(Debug, Clone)]
pub struct FailureDetails<'a> {
    pub issue_number: u64,
    pub trigger: &'a str,
    pub run_id: &'a str,
    pub run_url: Option<&'a str>,
    pub error: &'a str,
}

/// Where the report landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReport {
    Created(u64),
    Commented(u64),
}

pub fn report_title(job: &str, issue_number: u64) -> String {
    format!("pev: {job} failed for #{issue_number}")
}

#[instrument(skip_all, fields(issue = details.issue_number, job = %config.job_name))]
pub fn file_failure_report<T: Tracker>(
    tracker: &T,
    config: &FailureReportConfig,
    details: &FailureDetails<'_>,
) -> Result<FailureReport> {
    let title = report_title(&config.job_name, details.issue_number);
    let run = details.run_url.unwrap_or(details.run_id);

    if let Some(existing) = tracker.find_open_issue_by_title(&title)? {
        info!(existing, "failure report exists, commenting");
        tracker
            .comment(existing, &format!("Failed again: {run}\n\n{}", details.error))
            .with_context(|| format!("comment on failure report #{existing}"))?;
        return Ok(FailureReport::Commented(existing));
    }

    let body = render_body(&config.job_name, details)?;
    let number = tracker
        .create_issue(&title, &body, std::slice::from_ref(&config.label))
        .context("create failure report")?;
    info!(number, "failure report filed");
    Ok(FailureReport::Created(number))
}

fn render_body(job: &str, details: &FailureDetails<'_>) -> Result<String> {
    let env = Environment::new();
    let body = env
        .render_str(
            FAILURE_TEMPLATE,
            context! {
                job => job,
                issue => details.issue_number,
                trigger => details.trigger,
                run_id => details.run_id,
                run_url => details.run_url,
                error => details.error.trim(),
            },
        )
        .context("render failure report")?;
    Ok(body)
}
