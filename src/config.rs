//! Runtime configuration for vigil.
//!
//! `Config` resolves the `.vigil/` state-directory layout and merges
//! operator settings from `vigil.toml` with CLI overrides. File values are
//! optional; every knob has a default suitable for an unattended run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actors::IssueSeverity;
use crate::workitem::Phase;

/// Per-phase retry bounds. Attempt counters exceeding these escalate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AttemptLimits {
    pub red: u32,
    pub green: u32,
    pub refactor: u32,
    pub review: u32,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        // Reference defaults; operators tune these in vigil.toml.
        Self {
            red: 10,
            green: 10,
            refactor: 10,
            review: 10,
        }
    }
}

impl AttemptLimits {
    /// Bound for a working phase. Terminal and holding phases have no budget.
    pub fn for_phase(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Red => self.red,
            Phase::Green => self.green,
            Phase::Refactor => self.refactor,
            Phase::Review => self.review,
            _ => u32::MAX,
        }
    }
}

/// One code project the orchestrator may work on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Working-tree root, exclusively owned by the active WorkItem.
    pub root: PathBuf,
    /// Command that runs the test watcher (its output feeds `test-output`).
    pub test_command: String,
    /// Command that runs the dev server (its output feeds `dev-server`).
    #[serde(default)]
    pub server_command: Option<String>,
    /// External coding agent, invoked once per phase attempt.
    #[serde(default)]
    pub change_command: Option<String>,
    /// External reviewer; stdout carries the issues as JSON.
    #[serde(default)]
    pub review_command: Option<String>,
}

/// Shape of `vigil.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilToml {
    /// Unattended budget in minutes (default 240 = 4h).
    pub budget_minutes: Option<u64>,
    /// Maximum seconds to wait for the next relevant signal in a phase.
    pub signal_wait_secs: Option<u64>,
    /// Review issues at or above this severity bounce the item back to REFACTOR.
    pub severity_threshold: Option<IssueSeverity>,
    pub attempts: AttemptLimits,
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl VigilToml {
    /// Load `vigil.toml` from the state directory, falling back to defaults
    /// when the file is absent.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("vigil.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub workitems_dir: PathBuf,
    pub escalations_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub cursors_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub queue_file: PathBuf,
    pub session_file: PathBuf,
    pub lock_file: PathBuf,
    /// Unattended budget D for one attention window.
    pub budget: Duration,
    /// Maximum blocking wait for the next relevant signal in a phase.
    pub signal_wait: Duration,
    pub severity_threshold: IssueSeverity,
    pub attempts: AttemptLimits,
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Config {
    /// Resolve configuration rooted at `base_dir` (the operator's working
    /// directory). `budget_override` comes from the `--budget` flag.
    pub fn new(base_dir: PathBuf, budget_override: Option<Duration>) -> Result<Self> {
        let base_dir = base_dir
            .canonicalize()
            .context("Failed to resolve base directory")?;
        let state_dir = base_dir.join(".vigil");
        let file = VigilToml::load(&state_dir)?;

        let budget = budget_override
            .or(file.budget_minutes.map(|m| Duration::from_secs(m * 60)))
            .unwrap_or(Duration::from_secs(4 * 60 * 60));
        let signal_wait = file
            .signal_wait_secs
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15 * 60));

        Ok(Self {
            workitems_dir: state_dir.join("workitems"),
            escalations_dir: state_dir.join("escalations"),
            audit_dir: state_dir.join("audit"),
            cursors_dir: state_dir.join("cursors"),
            logs_dir: state_dir.join("logs"),
            reports_dir: state_dir.join("reports"),
            queue_file: state_dir.join("queue.json"),
            session_file: state_dir.join("session.json"),
            lock_file: state_dir.join("session.lock"),
            budget,
            signal_wait,
            severity_threshold: file.severity_threshold.unwrap_or(IssueSeverity::Error),
            attempts: file.attempts,
            projects: file.projects,
            state_dir,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.workitems_dir,
            &self.escalations_dir,
            &self.audit_dir,
            &self.cursors_dir,
            &self.logs_dir,
            &self.reports_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Path of the durable log file for a named stream of a project,
    /// e.g. `.vigil/logs/api.test-output.log`.
    pub fn stream_log_path(&self, project: &str, stream: &str) -> PathBuf {
        self.logs_dir.join(format!("{project}.{stream}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();

        assert_eq!(config.budget, Duration::from_secs(4 * 60 * 60));
        assert_eq!(config.signal_wait, Duration::from_secs(15 * 60));
        assert_eq!(config.attempts.red, 10);
        assert_eq!(config.severity_threshold, IssueSeverity::Error);
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_budget_override_wins() {
        let dir = tempdir().unwrap();
        let config =
            Config::new(dir.path().to_path_buf(), Some(Duration::from_secs(600))).unwrap();
        assert_eq!(config.budget, Duration::from_secs(600));
    }

    #[test]
    fn test_loads_vigil_toml() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join(".vigil");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(
            state_dir.join("vigil.toml"),
            r#"
budget_minutes = 120
signal_wait_secs = 60
severity_threshold = "warning"

[attempts]
red = 3
green = 4
refactor = 5
review = 6

[projects.api]
root = "/srv/api"
test_command = "npm test -- --watch"
server_command = "npm run dev"
change_command = "agent apply"
review_command = "agent review"
"#,
        )
        .unwrap();

        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        assert_eq!(config.budget, Duration::from_secs(120 * 60));
        assert_eq!(config.signal_wait, Duration::from_secs(60));
        assert_eq!(config.severity_threshold, IssueSeverity::Warning);
        assert_eq!(config.attempts.refactor, 5);
        let api = config.projects.get("api").unwrap();
        assert_eq!(api.test_command, "npm test -- --watch");
        assert_eq!(api.server_command.as_deref(), Some("npm run dev"));
        assert_eq!(api.change_command.as_deref(), Some("agent apply"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join(".vigil");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(state_dir.join("vigil.toml"), "budget_minutes = [nope").unwrap();

        let result = Config::new(dir.path().to_path_buf(), None);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse config file")
        );
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.workitems_dir.exists());
        assert!(config.cursors_dir.exists());
        assert!(config.reports_dir.exists());
    }

    #[test]
    fn test_stream_log_path_layout() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        let path = config.stream_log_path("api", "test-output");
        assert!(path.ends_with(".vigil/logs/api.test-output.log"));
    }

    #[test]
    fn test_attempt_limits_per_phase() {
        let limits = AttemptLimits {
            red: 1,
            green: 2,
            refactor: 3,
            review: 4,
        };
        assert_eq!(limits.for_phase(Phase::Red), 1);
        assert_eq!(limits.for_phase(Phase::Review), 4);
        assert_eq!(limits.for_phase(Phase::Done), u32::MAX);
    }
}
