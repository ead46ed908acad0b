use anyhow::Result;
use bridge_common::fs::atomic_write_json;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::heartbeat::HeartbeatStore;
use crate::paths::StorePaths;

/// Remove a worker from the team roster: the shared team config under the
/// state root and the shadow registry kept in the working directory. Both
/// edits are best-effort; the roster is owned by the lead and may not
/// exist, be mid-rewrite, or already lack the entry.
pub fn unregister_worker(
    paths: &StorePaths,
    working_dir: &Path,
    team: &str,
    worker: &str,
) -> Result<()> {
    let config_file = paths.team_config_file(team)?;
    if let Err(err) = filter_members(&config_file, "members", worker) {
        debug!(path = %config_file.display(), %err, "team config not updated");
    }

    let shadow_file = HeartbeatStore::new(working_dir)
        .state_dir(team)?
        .join("workers.json");
    if let Err(err) = filter_members(&shadow_file, "workers", worker) {
        debug!(path = %shadow_file.display(), %err, "shadow registry not updated");
    }

    Ok(())
}

/// Drop entries whose `name` matches `worker` from the named array field,
/// preserving every other field of the document.
fn filter_members(path: &Path, field: &str, worker: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(path)?;
    let mut document: Value = serde_json::from_str(&raw)?;

    if let Some(entries) = document.get_mut(field).and_then(Value::as_array_mut) {
        entries.retain(|entry| {
            entry
                .get("name")
                .and_then(Value::as_str)
                .map(|name| name != worker)
                .unwrap_or(true)
        });
    }

    atomic_write_json(path, &document)
}
