// Download queue persisted as a single JSON array. Every mutation rewrites
// the whole file; there is no in-memory-only mode.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl EntryStatus {
    /// `completed` and `failed` are terminal; `clear` removes them.
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Downloading => "downloading",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }
}

/// One scheduled download.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub url: String,
    pub system: String,
    /// Remote file name; derived from the URL when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub status: EntryStatus,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `value` must be usable as one path component on the cabinet: non-empty,
/// no `/`, not `.` or `..`.
pub fn check_path_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(Error::InvalidEntry(format!(
            "{} '{}' is not a single path component",
            kind, value
        )));
    }
    Ok(())
}

impl QueueEntry {
    /// A fresh `pending` entry. Empty url or system is rejected, as is a
    /// system or filename that would leave `<roms-root>/<system>/`.
    pub fn new(url: &str, system: &str, filename: Option<&str>) -> Result<Self> {
        let url = url.trim();
        let system = system.trim();
        if url.is_empty() {
            return Err(Error::InvalidEntry("url must not be empty".into()));
        }
        if system.is_empty() {
            return Err(Error::InvalidEntry("system must not be empty".into()));
        }
        check_path_component("system", system)?;
        let filename = filename.map(str::trim).filter(|f| !f.is_empty());
        if let Some(name) = filename {
            check_path_component("filename", name)?;
        }
        Ok(QueueEntry {
            url: url.to_string(),
            system: system.to_string(),
            filename: filename.map(str::to_string),
            status: EntryStatus::Pending,
            added_at: Utc::now(),
            completed_at: None,
            error: None,
        })
    }

    pub fn mark_downloading(&mut self) {
        self.status = EntryStatus::Downloading;
    }

    pub fn mark_completed(&mut self) {
        self.status = EntryStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error = None;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = EntryStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(reason.into());
    }
}

/// The queue plus the file it lives in.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    entries: Vec<QueueEntry>,
}

impl QueueStore {
    /// Read the snapshot at `path`. A missing file is an empty queue.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Vec::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                Error::Queue(format!("cannot parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::Queue(format!("cannot read {}: {}", path.display(), e)))
            }
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "queue loaded");
        Ok(QueueStore { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot on disk with the current list. The new content is
    /// written next to the target and renamed over it.
    pub fn save(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Queue(format!("cannot create {}: {}", dir.display(), e)))?;

        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| Error::Queue(format!("cannot serialize queue: {}", e)))?;
        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|e| Error::Queue(format!("cannot stage queue file: {}", e)))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| Error::Queue(format!("cannot write queue file: {}", e)))?;
        tmp.persist(&self.path).map_err(|e| {
            Error::Queue(format!("cannot replace {}: {}", self.path.display(), e.error))
        })?;
        Ok(())
    }

    /// Append a `pending` entry and persist immediately.
    pub fn add(&mut self, url: &str, system: &str, filename: Option<&str>) -> Result<&QueueEntry> {
        let entry = QueueEntry::new(url, system, filename)?;
        self.entries.push(entry);
        if let Err(e) = self.save() {
            self.entries.pop();
            return Err(e);
        }
        tracing::info!(url, system, "queued download");
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn list(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Drop every terminal entry, persist, and return how many went.
    pub fn clear(&mut self) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|e| !e.status.is_terminal());
        let removed = before - self.entries.len();
        self.save()?;
        Ok(removed)
    }

    /// Positions of the entries that are `pending` right now.
    pub fn pending_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == EntryStatus::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    /// Apply `f` to the entry at `index` and persist the result.
    pub fn update<F>(&mut self, index: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| Error::Queue(format!("no queue entry at position {}", index)))?;
        f(entry);
        self.save()
    }
}
