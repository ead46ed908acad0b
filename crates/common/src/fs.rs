use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Build the per-writer temp path for an atomic write.
///
/// The pid suffix keeps concurrent writers from clobbering each other's
/// temp files; the rename below is the only mutation a reader can observe.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

/// Create the parent directories of `path` if they do not exist yet.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directories for '{}'",
                    parent.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Durable write: serialize to a sibling temp file, then rename over the
/// destination. A crash before the rename leaves the destination untouched.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let mut body = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize content for '{}'", path.display()))?;
    body.push(b'\n');

    let tmp = temp_sibling(path);
    fs::write(&tmp, &body)
        .with_context(|| format!("failed to write temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename '{}' into place", tmp.display()))?;
    Ok(())
}

/// Same temp+rename pattern for pre-rendered text (JSONL rewrites).
pub fn atomic_write_text(path: &Path, content: &str) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_sibling(path);
    fs::write(&tmp, content)
        .with_context(|| format!("failed to write temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename '{}' into place", tmp.display()))?;
    Ok(())
}

/// Append one newline-terminated line, creating parents as needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open '{}' for append", path.display()))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .with_context(|| format!("failed to append to '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/record.json");
        atomic_write_json(&path, &serde_json::json!({"k": 1})).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["record.json"]);
    }

    #[test]
    fn append_line_accumulates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line(&path, "{\"n\":1}").unwrap();
        append_line(&path, "{\"n\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"n\":1}\n{\"n\":2}\n");
    }
}
