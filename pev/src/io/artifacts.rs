//! Agent output artifacts for cross-process re-hydration.
//!
//! An agent run in one process persists its output as `<dir>/<name>.json`; a
//! later, separately scheduled `apply*`/`submitReview` reads it back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

pub fn artifact_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

pub fn write_artifact(dir: &Path, name: &str, value: &Value) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create artifact dir {}", dir.display()))?;
    let path = artifact_path(dir, name);
    let mut buf = serde_json::to_string_pretty(value).context("serialize artifact")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write artifact {}", path.display()))?;
    Ok(path)
}

pub fn read_artifact(dir: &Path, name: &str) -> Result<Value> {
    let path = artifact_path(dir, name);
    if !path.exists() {
        return Err(anyhow!("missing artifact {}", path.display()));
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read artifact {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse artifact {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn artifacts_are_named_json_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("artifacts");
        let path = write_artifact(&dir, "triage", &json!({"labels": ["bug"]})).expect("write");
        assert!(path.ends_with("triage.json"));
        assert_eq!(read_artifact(&dir, "triage").expect("read")["labels"][0], "bug");
    }

    #[test]
    fn missing_artifact_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_artifact(temp.path(), "review").expect_err("missing");
        assert!(err.to_string().contains("missing artifact"));
    }
}
