//! Prompt assembly and the prompt/output audit trail.
//!
//! Every execution leaves two files behind: the exact prompt fed to the
//! CLI and the output it was asked to write. Filenames embed the team,
//! task and a millisecond timestamp so retries never overwrite earlier
//! attempts.

use anyhow::{Context, Result};
use bridge_common::sanitize_name;
use bridge_store::{InboxMessage, TaskRecord};
use chrono::Utc;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{BridgeConfig, PromptAccess};

const SUMMARY_MAX_CHARS: usize = 500;

/// Render the full prompt for one task. Inbox context is embedded only
/// when the policy allows it.
pub fn build_task_prompt(
    task: &TaskRecord,
    messages: &[InboxMessage],
    config: &BridgeConfig,
) -> String {
    let mut inbox_context = String::new();
    if config.policy.prompt_access == PromptAccess::Allowed && !messages.is_empty() {
        inbox_context.push_str("\nCONTEXT FROM TEAM LEAD:\n");
        for message in messages {
            let _ = writeln!(
                inbox_context,
                "[{}] {}",
                message.timestamp.to_rfc3339(),
                message.content
            );
        }
    }

    format!(
        "CONTEXT: You are an autonomous code executor working on a specific task.\n\
         You have FULL filesystem access within the working directory.\n\
         You can read files, write files, run shell commands, and make code changes.\n\
         \n\
         TASK:\n\
         {subject}\n\
         \n\
         DESCRIPTION:\n\
         {description}\n\
         \n\
         WORKING DIRECTORY: {working_dir}\n\
         {inbox_context}\n\
         INSTRUCTIONS:\n\
         - Complete the task described above\n\
         - Make all necessary code changes directly\n\
         - Run relevant verification commands (build, test, lint) to confirm your changes work\n\
         - Write a clear summary of what you did to the output file\n\
         - If you encounter blocking issues, document them clearly in your output\n\
         \n\
         OUTPUT EXPECTATIONS:\n\
         - Document all files you modified\n\
         - Include verification results (build/test output)\n\
         - Note any issues or follow-up work needed\n",
        subject = task.subject,
        description = task.description,
        working_dir = config.working_directory.display(),
        inbox_context = inbox_context,
    )
}

/// Persist the prompt under `<audit>/prompts/` and return its path.
pub fn write_prompt_file(config: &BridgeConfig, task_id: &str, prompt: &str) -> Result<PathBuf> {
    let path = audit_file(config, "prompts", task_id)?;
    fs::write(&path, prompt)
        .with_context(|| format!("failed to write prompt file '{}'", path.display()))?;
    Ok(path)
}

/// Reserve the output path the executor is told to write to, under
/// `<audit>/outputs/`.
pub fn output_file(config: &BridgeConfig, task_id: &str) -> Result<PathBuf> {
    audit_file(config, "outputs", task_id)
}

fn audit_file(config: &BridgeConfig, subdir: &str, task_id: &str) -> Result<PathBuf> {
    let dir = config.audit_base().join(subdir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create audit directory '{}'", dir.display()))?;
    let team = sanitize_name(&config.team_name)?;
    Ok(dir.join(format!(
        "team-{}-task-{}-{}.md",
        team,
        task_id,
        Utc::now().timestamp_millis()
    )))
}

/// First 500 characters of the output file, for the outbox report. Read
/// problems degrade to placeholder text; the completion itself already
/// happened and must still be reported.
pub fn read_output_summary(path: &Path) -> String {
    if !path.exists() {
        return "(no output file)".to_string();
    }
    match fs::read_to_string(path) {
        Ok(content) if content.is_empty() => "(empty output)".to_string(),
        Ok(content) => {
            if content.chars().count() > SUMMARY_MAX_CHARS {
                let head: String = content.chars().take(SUMMARY_MAX_CHARS).collect();
                format!("{head}... (truncated)")
            } else {
                content
            }
        }
        Err(_) => "(error reading output)".to_string(),
    }
}
