use anyhow::{Context, Result};
use bridge_common::fs::{append_line, atomic_write_text, ensure_parent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use tracing::debug;

use crate::paths::StorePaths;

/// Lead -> worker message, one JSON object per inbox line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Worker -> lead lifecycle event, appended to the outbox JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboxMessage {
    Idle {
        message: String,
        timestamp: DateTime<Utc>,
    },
    TaskComplete {
        task_id: String,
        summary: String,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
    ShutdownAck {
        request_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl OutboxMessage {
    pub fn idle(message: impl Into<String>) -> Self {
        Self::Idle {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task_complete(task_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self::TaskComplete {
            task_id: task_id.into(),
            summary: summary.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task_failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::TaskFailed {
            task_id: task_id.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn shutdown_ack(request_id: impl Into<String>) -> Self {
        Self::ShutdownAck {
            request_id: request_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Transient shutdown request dropped by the lead and consumed by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSignal {
    pub request_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Byte offset of the inbox already consumed, owned exclusively by the
/// reading worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboxCursor {
    bytes_read: u64,
}

#[derive(Debug, Clone)]
pub struct ChannelStore {
    paths: StorePaths,
}

impl ChannelStore {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    // --- Outbox (worker -> lead) ---

    pub fn append_outbox(&self, team: &str, worker: &str, message: &OutboxMessage) -> Result<()> {
        let path = self.paths.outbox_file(team, worker)?;
        let line = serde_json::to_string(message)?;
        append_line(&path, &line)
    }

    /// Rewrite the outbox keeping only the newest `max_lines / 2` entries
    /// once the line count exceeds `max_lines`. Keeping half, not
    /// `max_lines`, gives the rotation hysteresis: it will not fire again
    /// on the very next append.
    pub fn rotate_outbox(&self, team: &str, worker: &str, max_lines: usize) -> Result<()> {
        let path = self.paths.outbox_file(team, worker)?;
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read outbox '{}'", path.display()))?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= max_lines {
            return Ok(());
        }

        let keep = max_lines / 2;
        let kept = &lines[lines.len() - keep..];
        let mut body = kept.join("\n");
        body.push('\n');
        atomic_write_text(&path, &body)
    }

    // --- Inbox (lead -> worker) ---

    /// Incremental read gated by the persisted byte cursor.
    ///
    /// A byte offset (not a line count or timestamp) survives clock skew
    /// and partial appends. A file smaller than the cursor means the inbox
    /// was truncated or replaced externally, so the cursor resets to 0.
    /// Only newline-terminated lines that parse advance the cursor; a torn
    /// or malformed tail is left in place and retried on the next poll, so
    /// every fully written line is delivered exactly once, in append order.
    pub fn read_new_inbox(&self, team: &str, worker: &str) -> Result<Vec<InboxMessage>> {
        let inbox = self.paths.inbox_file(team, worker)?;
        let cursor_file = self.paths.inbox_cursor_file(team, worker)?;

        let Ok(meta) = fs::metadata(&inbox) else {
            return Ok(Vec::new());
        };
        let size = meta.len();

        let mut offset = fs::read_to_string(&cursor_file)
            .ok()
            .and_then(|raw| serde_json::from_str::<InboxCursor>(&raw).ok())
            .map(|cursor| cursor.bytes_read)
            .unwrap_or(0);

        if size < offset {
            debug!(team, worker, size, offset, "inbox shrank; resetting cursor");
            offset = 0;
        }
        if size <= offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&inbox)
            .with_context(|| format!("failed to open inbox '{}'", inbox.display()))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; (size - offset) as usize];
        file.read_exact(&mut buf)
            .with_context(|| format!("failed to read inbox '{}'", inbox.display()))?;

        let mut messages = Vec::new();
        let mut start = 0usize;
        let mut consumed = 0u64;
        while let Some(nl) = buf[start..].iter().position(|b| *b == b'\n') {
            let line = &buf[start..start + nl];
            let end = start + nl + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                start = end;
                continue;
            }
            match serde_json::from_slice::<InboxMessage>(line) {
                Ok(message) => {
                    messages.push(message);
                    consumed = end as u64;
                    start = end;
                }
                // Stop at the first malformed line; do not skip past it.
                Err(_) => break,
            }
        }

        let cursor = InboxCursor {
            bytes_read: offset + consumed,
        };
        ensure_parent(&cursor_file)?;
        fs::write(&cursor_file, serde_json::to_string(&cursor)?)
            .with_context(|| format!("failed to persist cursor '{}'", cursor_file.display()))?;

        Ok(messages)
    }

    /// Full re-read bypassing the cursor, for diagnostics. Malformed lines
    /// are skipped rather than terminating the scan.
    pub fn read_all_inbox(&self, team: &str, worker: &str) -> Vec<InboxMessage> {
        let Ok(inbox) = self.paths.inbox_file(team, worker) else {
            return Vec::new();
        };
        let Ok(content) = fs::read_to_string(&inbox) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Truncate the inbox and reset the cursor. A crash between the two
    /// writes is harmless; re-clearing is idempotent.
    pub fn clear_inbox(&self, team: &str, worker: &str) -> Result<()> {
        let inbox = self.paths.inbox_file(team, worker)?;
        let cursor_file = self.paths.inbox_cursor_file(team, worker)?;
        if inbox.exists() {
            fs::write(&inbox, "")
                .with_context(|| format!("failed to truncate inbox '{}'", inbox.display()))?;
        }
        ensure_parent(&cursor_file)?;
        fs::write(
            &cursor_file,
            serde_json::to_string(&InboxCursor { bytes_read: 0 })?,
        )
        .with_context(|| format!("failed to reset cursor '{}'", cursor_file.display()))?;
        Ok(())
    }

    // --- Shutdown signals ---

    pub fn write_shutdown(
        &self,
        team: &str,
        worker: &str,
        request_id: &str,
        reason: &str,
    ) -> Result<()> {
        let path = self.paths.signal_file(team, worker)?;
        let signal = ShutdownSignal {
            request_id: request_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };
        bridge_common::fs::atomic_write_json(&path, &signal)
    }

    /// Absent or malformed signal is simply "no shutdown requested".
    pub fn check_shutdown(&self, team: &str, worker: &str) -> Option<ShutdownSignal> {
        let path = self.paths.signal_file(team, worker).ok()?;
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Remove the signal file, tolerating a concurrent deleter.
    pub fn delete_shutdown(&self, team: &str, worker: &str) {
        if let Ok(path) = self.paths.signal_file(team, worker) {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), %err, "failed to delete shutdown signal");
                }
            }
        }
    }

    // --- Cleanup ---

    /// Best-effort removal of every channel file for a decommissioned
    /// worker; one missing file never blocks removing the others.
    pub fn cleanup_worker(&self, team: &str, worker: &str) {
        let candidates = [
            self.paths.inbox_file(team, worker),
            self.paths.inbox_cursor_file(team, worker),
            self.paths.outbox_file(team, worker),
            self.paths.signal_file(team, worker),
        ];
        for path in candidates.into_iter().flatten() {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), %err, "cleanup skipped file");
                }
            }
        }
    }

    /// Read back every outbox entry, skipping malformed lines. Used by
    /// tests and diagnostics.
    pub fn read_outbox(&self, team: &str, worker: &str) -> Vec<OutboxMessage> {
        let Ok(path) = self.paths.outbox_file(team, worker) else {
            return Vec::new();
        };
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}
