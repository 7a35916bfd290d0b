//! Append-only operational audit log backed by a Merkle tree.
//!
//! Independent of the block ledger: this log records human-readable
//! events, and the Merkle root written with every line makes retroactive
//! edits of the file detectable.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::audit::merkle::MerkleTree;
use crate::error::AuditError;

pub struct AuditEventLog {
    log_path: PathBuf,
    inner: Mutex<EventLogInner>,
}

struct EventLogInner {
    tree: MerkleTree,
    file: File,
}

impl AuditEventLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let log_path = log_path.into();
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AuditError::StorageError(format!("Failed to create log directory: {}", e))
                })?;
            }
        }

        let mut tree = MerkleTree::new();
        if log_path.exists() {
            for line in Self::read_lines_from(&log_path)? {
                tree.add(&strip_root_field(&line));
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| AuditError::StorageError(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            log_path,
            inner: Mutex::new(EventLogInner { tree, file }),
        })
    }

    /// Append an event line and fold it into the Merkle tree. Returns the
    /// new root hash written alongside the line.
    pub fn log_event(&self, message: &str) -> Result<String, AuditError> {
        let mut inner = self.inner.lock();

        let entry = format!("{} | {}", Utc::now().to_rfc3339(), message);
        inner.tree.add(&entry);
        let root = inner.tree.root_hash().to_string();

        writeln!(inner.file, "{} | {}", entry, root)
            .map_err(|e| AuditError::StorageError(format!("Failed to write audit log: {}", e)))?;
        inner
            .file
            .flush()
            .map_err(|e| AuditError::StorageError(format!("Failed to flush audit log: {}", e)))?;

        debug!(root = %root, "Audit event appended");
        Ok(root)
    }

    /// Recompute the root over the supplied raw log lines and compare it
    /// against the live tree's root. Whole-log check, not an inclusion
    /// proof.
    pub fn validate<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> bool {
        let stripped: Vec<String> = lines.into_iter().map(strip_root_field).collect();
        self.inner
            .lock()
            .tree
            .validate(stripped.iter().map(String::as_str))
    }

    /// Current Merkle root.
    pub fn root_hash(&self) -> String {
        self.inner.lock().tree.root_hash().to_string()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().tree.leaf_count()
    }

    /// All raw lines from the durable log file.
    pub fn read_lines(&self) -> Result<Vec<String>, AuditError> {
        Self::read_lines_from(&self.log_path)
    }

    fn read_lines_from(path: &Path) -> Result<Vec<String>, AuditError> {
        let file = File::open(path)
            .map_err(|e| AuditError::StorageError(format!("Failed to open audit log: {}", e)))?;
        let reader = BufReader::new(file);

        let mut lines = Vec::new();
        for line in reader.lines() {
            let line =
                line.map_err(|e| AuditError::StorageError(format!("Failed to read log line: {}", e)))?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

/// Drop the trailing ` | <merkle root>` field from a stored line, leaving
/// the `timestamp | message` entry the tree leaves are built from.
fn strip_root_field(line: &str) -> String {
    match line.rsplit_once(" | ") {
        Some((entry, _root)) => entry.to_string(),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_event_appends_line_with_root() {
        let dir = tempdir().unwrap();
        let log = AuditEventLog::new(dir.path().join("audit.log")).unwrap();

        let root = log.log_event("record created").unwrap();
        assert_eq!(root.len(), 64);
        assert_eq!(log.entry_count(), 1);

        let lines = log.read_lines().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("record created"));
        assert!(lines[0].ends_with(&root));
    }

    #[test]
    fn test_validate_detects_tampered_line() {
        let dir = tempdir().unwrap();
        let log = AuditEventLog::new(dir.path().join("audit.log")).unwrap();

        for i in 0..5 {
            log.log_event(&format!("event {}", i)).unwrap();
        }

        let lines = log.read_lines().unwrap();
        assert!(log.validate(lines.iter().map(String::as_str)));

        let mut tampered: Vec<String> = lines.clone();
        tampered[2] = tampered[2].replace("event 2", "event X");
        assert!(!log.validate(tampered.iter().map(String::as_str)));
    }

    #[test]
    fn test_reopen_restores_tree_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let root = {
            let log = AuditEventLog::new(&path).unwrap();
            log.log_event("one").unwrap();
            log.log_event("two").unwrap()
        };

        let reopened = AuditEventLog::new(&path).unwrap();
        assert_eq!(reopened.entry_count(), 2);
        assert_eq!(reopened.root_hash(), root);

        let lines = reopened.read_lines().unwrap();
        assert!(reopened.validate(lines.iter().map(String::as_str)));
    }
}
