use thiserror::Error;

/// Names are embedded in filesystem paths, so the charsets here are a
/// traversal defense, not a cosmetic check.
const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum NameError {
    #[error("invalid name {0:?}: contains no valid characters (alphanumeric or hyphen)")]
    Empty(String),
    #[error("invalid task id {0:?}: contains unsafe characters")]
    UnsafeTaskId(String),
}

/// Normalize a team or worker name for use as a path component.
///
/// Strips everything outside `[A-Za-z0-9-]`, fails if nothing survives,
/// and truncates the result to 50 characters.
pub fn sanitize_name(name: &str) -> Result<String, NameError> {
    let mut sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if sanitized.is_empty() {
        return Err(NameError::Empty(name.to_string()));
    }
    sanitized.truncate(MAX_NAME_LEN);
    Ok(sanitized)
}

/// Validate a task id for use as a path component.
///
/// Task ids are stricter than names: the whole id must match
/// `[A-Za-z0-9._-]+` and is never truncated or rewritten.
pub fn sanitize_task_id(task_id: &str) -> Result<&str, NameError> {
    if task_id.is_empty()
        || !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(NameError::UnsafeTaskId(task_id.to_string()));
    }
    Ok(task_id)
}
