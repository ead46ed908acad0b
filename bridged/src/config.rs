use anyhow::{Context, Result};
use bridge_common::sanitize_name;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::ExecutorKind;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;
pub const DEFAULT_OUTBOX_MAX_LINES: usize = 500;

/// Daemon configuration, loaded once at startup from a JSON file written
/// by the team lead. Field names mirror the on-disk camelCase wire format
/// shared with the rest of the coordination tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub team_name: String,
    pub worker_name: String,
    pub executor: ExecutorKind,
    pub working_directory: PathBuf,
    /// State root holding tasks, channels and signals. Defaults to
    /// `$HOME/.taskbridge`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_outbox_max_lines")]
    pub outbox_max_lines: usize,
    /// Model override passed through to the executor CLI.
    #[serde(default)]
    pub model: Option<String>,
    /// Terminal multiplexer session hosting this daemon, killed on
    /// shutdown so the worker's pane disappears with it.
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub policy: ExecPolicy,
}

/// Execution policy knobs. Both default to the permissive historical
/// behavior; leads opt in to the stricter variants per worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecPolicy {
    pub output_paths: OutputPathPolicy,
    pub prompt_access: PromptAccess,
}

/// Where prompt and output audit files are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPathPolicy {
    /// Under the worker's working directory, next to the code it edits.
    #[default]
    Strict,
    /// Under the state root, keeping the working tree pristine.
    Redirect,
}

/// Whether inbox context from the lead is embedded into task prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptAccess {
    #[default]
    Allowed,
    Denied,
}

impl BridgeConfig {
    /// Load and validate the config. Missing required fields, an unknown
    /// executor kind, or unsanitizable names are all fatal here; the
    /// daemon never starts half-configured.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid bridge config '{}'", path.display()))?;
        sanitize_name(&config.team_name).context("invalid teamName")?;
        sanitize_name(&config.worker_name).context("invalid workerName")?;
        Ok(config)
    }

    pub fn state_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(default_state_root)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Base directory for prompt/output audit files, per policy.
    pub fn audit_base(&self) -> PathBuf {
        match self.policy.output_paths {
            OutputPathPolicy::Strict => self.working_directory.clone(),
            OutputPathPolicy::Redirect => self.state_root().join("audit"),
        }
    }
}

fn default_state_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskbridge")
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_task_timeout_ms() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}

fn default_max_consecutive_errors() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_ERRORS
}

fn default_outbox_max_lines() -> usize {
    DEFAULT_OUTBOX_MAX_LINES
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("bridge.json");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "teamName": "alpha",
                "workerName": "w1",
                "executor": "codex",
                "workingDirectory": "/tmp/work"
            }"#,
        );

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.task_timeout_ms, DEFAULT_TASK_TIMEOUT_MS);
        assert_eq!(config.max_consecutive_errors, DEFAULT_MAX_CONSECUTIVE_ERRORS);
        assert_eq!(config.outbox_max_lines, DEFAULT_OUTBOX_MAX_LINES);
        assert_eq!(config.policy, ExecPolicy::default());
        assert!(config.model.is_none());
        assert!(config.root.is_none());
        assert!(config.state_root().ends_with(".taskbridge"));
    }

    #[test]
    fn unknown_executor_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "teamName": "alpha",
                "workerName": "w1",
                "executor": "clippy",
                "workingDirectory": "/tmp/work"
            }"#,
        );
        assert!(BridgeConfig::load(&path).is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"teamName": "alpha", "executor": "gemini", "workingDirectory": "/w"}"#,
        );
        let err = BridgeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid bridge config"));
    }

    #[test]
    fn policy_variants_parse() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "teamName": "alpha",
                "workerName": "w1",
                "executor": "gemini",
                "workingDirectory": "/w",
                "root": "/srv/bridge",
                "policy": {"outputPaths": "redirect", "promptAccess": "denied"}
            }"#,
        );
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.policy.output_paths, OutputPathPolicy::Redirect);
        assert_eq!(config.policy.prompt_access, PromptAccess::Denied);
        assert_eq!(config.audit_base(), PathBuf::from("/srv/bridge/audit"));
    }
}
