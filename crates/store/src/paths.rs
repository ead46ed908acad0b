use anyhow::Result;
use bridge_common::{sanitize_name, sanitize_task_id};
use std::path::{Path, PathBuf};

/// Deterministic path layout under the shared state root.
///
/// Every externally supplied name passes through the sanitizers before it
/// touches a path, so a hostile team/worker/task identifier cannot escape
/// the root.
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_dir(&self, team: &str) -> Result<PathBuf> {
        Ok(self.root.join("tasks").join(sanitize_name(team)?))
    }

    pub fn task_file(&self, team: &str, task_id: &str) -> Result<PathBuf> {
        Ok(self
            .tasks_dir(team)?
            .join(format!("{}.json", sanitize_task_id(task_id)?)))
    }

    pub fn failure_file(&self, team: &str, task_id: &str) -> Result<PathBuf> {
        Ok(self
            .tasks_dir(team)?
            .join(format!("{}.failure.json", sanitize_task_id(task_id)?)))
    }

    pub fn team_dir(&self, team: &str) -> Result<PathBuf> {
        Ok(self.root.join("teams").join(sanitize_name(team)?))
    }

    pub fn inbox_file(&self, team: &str, worker: &str) -> Result<PathBuf> {
        Ok(self
            .team_dir(team)?
            .join("inbox")
            .join(format!("{}.jsonl", sanitize_name(worker)?)))
    }

    pub fn inbox_cursor_file(&self, team: &str, worker: &str) -> Result<PathBuf> {
        Ok(self
            .team_dir(team)?
            .join("inbox")
            .join(format!("{}.offset", sanitize_name(worker)?)))
    }

    pub fn outbox_file(&self, team: &str, worker: &str) -> Result<PathBuf> {
        Ok(self
            .team_dir(team)?
            .join("outbox")
            .join(format!("{}.jsonl", sanitize_name(worker)?)))
    }

    pub fn signal_file(&self, team: &str, worker: &str) -> Result<PathBuf> {
        Ok(self
            .team_dir(team)?
            .join("signals")
            .join(format!("{}.shutdown", sanitize_name(worker)?)))
    }

    pub fn team_config_file(&self, team: &str) -> Result<PathBuf> {
        Ok(self.team_dir(team)?.join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_sanitized() {
        let paths = StorePaths::new("/srv/bridge");
        let p = paths.task_file("my team!", "42").unwrap();
        assert_eq!(p, PathBuf::from("/srv/bridge/tasks/myteam/42.json"));
        assert!(paths.task_file("team", "../42").is_err());
        assert!(paths.inbox_file("..", "w").is_err());
    }
}
