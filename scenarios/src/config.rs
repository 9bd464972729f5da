//! Engine configuration merging.
//!
//! Applies case-specific overrides to the default engine configuration.

use anyhow::Result;
use pev::io::config::PevConfig;

use crate::case::CaseConfig;

/// Apply case configuration overrides to the base engine config.
pub fn apply_case_config(mut base: PevConfig, overrides: &CaseConfig) -> Result<PevConfig> {
    if let Some(max_retries) = overrides.max_retries {
        base.max_retries = max_retries;
    }
    if let Some(halt_on_error) = overrides.halt_on_error {
        base.halt_on_error = halt_on_error;
    }
    if let Some(continue_on) = &overrides.continue_on {
        base.continue_on = continue_on.clone();
    }
    // Replays never file failure reports into the seeded tracker.
    base.failure_report.enabled = false;
    base.validate()?;
    Ok(base)
}
