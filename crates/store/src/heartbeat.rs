use anyhow::Result;
use bridge_common::fs::atomic_write_json;
use bridge_common::sanitize_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Latest-status snapshot for one worker daemon. A pure state mirror:
/// every write fully replaces the prior value, no history is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub worker_name: String,
    pub team_name: String,
    pub executor: String,
    pub pid: u32,
    pub last_poll_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub consecutive_errors: u32,
    pub status: HeartbeatStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Polling,
    Executing,
    Quarantined,
}

#[derive(Debug, Clone)]
pub struct HeartbeatStore {
    working_dir: PathBuf,
}

impl HeartbeatStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    fn heartbeat_file(&self, team: &str, worker: &str) -> Result<PathBuf> {
        Ok(self
            .working_dir
            .join("state")
            .join(sanitize_name(team)?)
            .join(format!("{}.heartbeat.json", sanitize_name(worker)?)))
    }

    pub fn state_dir(&self, team: &str) -> Result<PathBuf> {
        Ok(self.working_dir.join("state").join(sanitize_name(team)?))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn write(&self, heartbeat: &Heartbeat) -> Result<()> {
        let path = self.heartbeat_file(&heartbeat.team_name, &heartbeat.worker_name)?;
        atomic_write_json(&path, heartbeat)
    }

    pub fn read(&self, team: &str, worker: &str) -> Option<Heartbeat> {
        let path = self.heartbeat_file(team, worker).ok()?;
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn delete(&self, team: &str, worker: &str) {
        if let Ok(path) = self.heartbeat_file(team, worker) {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), %err, "failed to delete heartbeat");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_overwrites_and_delete_tolerates_absence() {
        let dir = tempdir().unwrap();
        let store = HeartbeatStore::new(dir.path());

        let mut hb = Heartbeat {
            worker_name: "w1".into(),
            team_name: "t".into(),
            executor: "codex".into(),
            pid: std::process::id(),
            last_poll_at: Utc::now(),
            current_task_id: None,
            consecutive_errors: 0,
            status: HeartbeatStatus::Polling,
        };
        store.write(&hb).unwrap();
        assert_eq!(store.read("t", "w1").unwrap().status, HeartbeatStatus::Polling);

        hb.status = HeartbeatStatus::Executing;
        hb.current_task_id = Some("7".into());
        store.write(&hb).unwrap();
        let read = store.read("t", "w1").unwrap();
        assert_eq!(read.status, HeartbeatStatus::Executing);
        assert_eq!(read.current_task_id.as_deref(), Some("7"));

        store.delete("t", "w1");
        assert!(store.read("t", "w1").is_none());
        store.delete("t", "w1");
    }

    #[test]
    fn corrupt_heartbeat_reads_as_none() {
        let dir = tempdir().unwrap();
        let store = HeartbeatStore::new(dir.path());
        let path = store.heartbeat_file("t", "w1").unwrap();
        bridge_common::fs::ensure_parent(&path).unwrap();
        fs::write(&path, "no json here").unwrap();
        assert!(store.read("t", "w1").is_none());
    }
}
