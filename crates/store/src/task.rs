use anyhow::{bail, Context, Result};
use bridge_common::fs::atomic_write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use tracing::debug;

use crate::paths::StorePaths;

/// Persistent unit of work, created by the team lead and claimed by a
/// worker daemon. Unknown fields round-trip through `extra` so an update
/// never loses data written by a newer lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// Partial update: only `Some` fields are merged into the stored record.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub owner: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Failure history kept beside the task file, never inside it. Success
/// does not delete the sidecar; retry counts are part of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSidecar {
    pub task_id: String,
    pub last_error: String,
    pub retry_count: u32,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    paths: StorePaths,
}

impl TaskStore {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    /// Read a single task. Missing or malformed content is absence, not an
    /// error; a torn write can never be observed thanks to temp+rename.
    pub fn read(&self, team: &str, task_id: &str) -> Option<TaskRecord> {
        let path = self.paths.task_file(team, task_id).ok()?;
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Merge a partial patch into the stored record and write it back
    /// atomically. Unlike `read`, a missing or unparsable file here is a
    /// hard error: updating implies the task must already exist.
    pub fn update(&self, team: &str, task_id: &str, patch: TaskPatch) -> Result<()> {
        let path = self.paths.task_file(team, task_id)?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("task file not found: {}", task_id))?;
        let mut value: Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("task file malformed: {}", task_id))?;

        if let Some(status) = patch.status {
            value.insert("status".into(), serde_json::to_value(status)?);
        }
        if let Some(owner) = patch.owner {
            value.insert("owner".into(), Value::String(owner));
        }

        atomic_write_json(&path, &value)
    }

    /// All task ids in the team directory, sorted ascending. Ids that both
    /// parse as integers compare numerically; any other pair compares
    /// lexically. Temp and sidecar files are excluded.
    pub fn list_ids(&self, team: &str) -> Vec<String> {
        let Ok(dir) = self.paths.tasks_dir(team) else {
            return Vec::new();
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "task directory unreadable");
                return Vec::new();
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| {
                name.ends_with(".json") && !name.contains(".tmp.") && !name.contains(".failure.")
            })
            .map(|name| name.trim_end_matches(".json").to_string())
            .collect();

        ids.sort_by(|a, b| match (a.parse::<i64>(), b.parse::<i64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => a.cmp(b),
        });
        ids
    }

    /// Find the next claimable task for `worker`: first id in sorted order
    /// that is pending, owned by the worker, and whose blockers are all
    /// completed. The candidate is re-read before returning so a claim or
    /// reassignment that landed between scan and decision discards it.
    /// This is an optimistic guard, not a lock; the residual race between
    /// two daemons polling the same owner is accepted by design.
    pub fn find_next(&self, team: &str, worker: &str) -> Option<TaskRecord> {
        for id in self.list_ids(team) {
            let Some(task) = self.read(team, &id) else {
                continue;
            };
            if task.status != TaskStatus::Pending || task.owner != worker {
                continue;
            }
            if !self.blockers_resolved(team, &task.blocked_by) {
                continue;
            }

            // A candidate that vanished or turned unreadable between the
            // two reads is skipped, not a reason to end the scan early.
            let Some(fresh) = self.read(team, &id) else {
                continue;
            };
            if fresh.owner != worker || fresh.status != TaskStatus::Pending {
                continue;
            }
            return Some(fresh);
        }
        None
    }

    /// A missing blocker counts as unresolved: the task stays ineligible
    /// until the lead materializes every id it named.
    pub fn blockers_resolved(&self, team: &str, blocked_by: &[String]) -> bool {
        blocked_by.iter().all(|blocker_id| {
            self.read(team, blocker_id)
                .map(|blocker| blocker.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Upsert the failure sidecar, bumping the retry counter.
    pub fn record_failure(&self, team: &str, task_id: &str, error: &str) -> Result<()> {
        let path = self.paths.failure_file(team, task_id)?;
        let retry_count = self
            .read_failure(team, task_id)
            .map(|existing| existing.retry_count + 1)
            .unwrap_or(1);
        let sidecar = FailureSidecar {
            task_id: task_id.to_string(),
            last_error: error.to_string(),
            retry_count,
            last_failed_at: Utc::now(),
        };
        atomic_write_json(&path, &sidecar)
    }

    pub fn read_failure(&self, team: &str, task_id: &str) -> Option<FailureSidecar> {
        let path = self.paths.failure_file(team, task_id).ok()?;
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}
