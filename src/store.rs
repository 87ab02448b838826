use crate::error::SaveLoopError;
use chrono::{DateTime, Local, Utc};
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

pub const DEFAULT_RETENTION: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Stored on request by the operator.
    Manual,
    /// Stored by the poller whenever the game rewrites its save.
    Automatic,
}

impl Category {
    pub fn prefix(self) -> &'static str {
        match self {
            Category::Manual => "save",
            Category::Automatic => "backup",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub sequence: u64,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub category: Category,
}

impl BackupEntry {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// `backup12.sl2 (10/18/26 21:04:55)`
    pub fn describe(&self) -> String {
        format!(
            "{} ({})",
            self.file_name(),
            self.modified
                .with_timezone(&Local)
                .format("%m/%d/%y %H:%M:%S")
        )
    }
}

/// Returns the newest entry strictly older than `cutoff`, scanning from the most
/// recent entry backwards. When nothing qualifies the oldest entry is returned.
pub fn select_older_than(entries: &[BackupEntry], cutoff: DateTime<Utc>) -> Option<&BackupEntry> {
    entries
        .iter()
        .rev()
        .find(|entry| entry.modified < cutoff)
        .or_else(|| entries.first())
}

/// Numbered copies of the live save file for one category, kept in one directory.
pub struct VersionStore {
    category: Category,
    dir: PathBuf,
    extension: Option<String>,
    retention_cap: usize,
    pattern: Regex,
    entries: Vec<BackupEntry>,
}

impl VersionStore {
    /// Creates `dir` if needed and loads every `<prefix><n>[.<ext>]` file in it.
    pub fn open(
        dir: impl Into<PathBuf>,
        category: Category,
        extension: Option<&str>,
        retention_cap: usize,
    ) -> crate::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let pattern = Regex::new(&format!(r"^{}(\d+)(?:\..*)?$", regex::escape(category.prefix())))
            .map_err(|e| SaveLoopError::Configuration(e.to_string()))?;

        let mut store = Self {
            category,
            dir,
            extension: extension.filter(|ext| !ext.is_empty()).map(str::to_string),
            retention_cap: retention_cap.max(1),
            pattern,
            entries: Vec::new(),
        };
        store.scan()?;
        Ok(store)
    }

    fn scan(&mut self) -> crate::Result<()> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(sequence) = name.to_str().and_then(|n| self.parse_sequence(n)) else {
                continue;
            };
            let metadata = dirent.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(BackupEntry {
                sequence,
                path: dirent.path(),
                modified: DateTime::<Utc>::from(metadata.modified()?),
                category: self.category,
            });
        }
        entries.sort_by_key(|e| e.sequence);
        // `save3` and `save3.sl2` would otherwise share a number.
        entries.dedup_by_key(|e| e.sequence);

        debug!(
            "Loaded {} {} files from {}",
            entries.len(),
            self.category,
            self.dir.display()
        );
        self.entries = entries;
        Ok(())
    }

    fn parse_sequence(&self, file_name: &str) -> Option<u64> {
        let captures = self.pattern.captures(file_name)?;
        captures[1].parse::<u64>().ok().filter(|n| *n > 0)
    }

    fn entry_path(&self, sequence: u64) -> PathBuf {
        let name = match &self.extension {
            Some(ext) => format!("{}{}.{}", self.category.prefix(), sequence, ext),
            None => format!("{}{}", self.category.prefix(), sequence),
        };
        self.dir.join(name)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention_cap(&self) -> usize {
        self.retention_cap
    }

    /// Entries in ascending sequence order, which is also chronological order.
    pub fn entries(&self) -> &[BackupEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&BackupEntry> {
        self.entries.last()
    }

    pub fn newest_older_than(&self, cutoff: DateTime<Utc>) -> Option<&BackupEntry> {
        select_older_than(&self.entries, cutoff)
    }

    /// Copies `source` into the next numbered slot and evicts the oldest entries
    /// beyond the retention cap. On error nothing is recorded.
    pub fn commit(&mut self, source: &Path) -> crate::Result<BackupEntry> {
        if !source.exists() {
            return Err(SaveLoopError::SourceMissing(source.to_path_buf()));
        }

        let exhausted = || SaveLoopError::SequenceExhausted(self.dir.clone());
        let mut sequence = match self.entries.last() {
            Some(e) => e.sequence.checked_add(1).ok_or_else(exhausted)?,
            None => 1,
        };
        let mut path = self.entry_path(sequence);
        while path.exists() {
            sequence = sequence.checked_add(1).ok_or_else(exhausted)?;
            path = self.entry_path(sequence);
        }

        let modified = snapshot_file(source, &path)?;
        let entry = BackupEntry {
            sequence,
            path,
            modified,
            category: self.category,
        };
        self.entries.push(entry.clone());
        self.evict();
        Ok(entry)
    }

    fn evict(&mut self) {
        while self.entries.len() > self.retention_cap {
            let oldest = self.entries.remove(0);
            match fs::remove_file(&oldest.path) {
                Ok(()) => debug!("Evicted {}", oldest.file_name()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Unable to delete {}: {}", oldest.path.display(), e),
            }
        }
    }
}

/// Copies `from` to `to` keeping the source's modification time on the copy.
/// Returns that time.
pub fn snapshot_file(from: &Path, to: &Path) -> crate::Result<DateTime<Utc>> {
    let modified = source_modified(from, to)?;
    replace_file(from, to, modified)?;
    Ok(DateTime::from(modified))
}

/// Copies `from` over `to`, stamping the result with the current time so the
/// owning application sees a freshly written file.
pub fn restore_file(from: &Path, to: &Path) -> crate::Result<()> {
    source_modified(from, to)?;
    replace_file(from, to, SystemTime::now())
}

fn source_modified(from: &Path, to: &Path) -> crate::Result<SystemTime> {
    let metadata = match fs::metadata(from) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SaveLoopError::SourceMissing(from.to_path_buf()))
        }
        Err(source) => return Err(copy_failed(from, to, source)),
    };
    metadata.modified().map_err(|source| copy_failed(from, to, source))
}

fn copy_failed(from: &Path, to: &Path, source: io::Error) -> SaveLoopError {
    SaveLoopError::CopyFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    }
}

// Writes a temporary sibling of `to` and renames it into place, so `to` is never
// left holding a partial copy.
fn replace_file(from: &Path, to: &Path, modified: SystemTime) -> crate::Result<()> {
    let parent = to
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let suffix: u64 = thread_rng().gen();
    let tmp = parent.join(format!(".{}.{}.tmp", name, suffix));

    if let Err(source) = write_through(from, &tmp, to, modified) {
        let _ = fs::remove_file(&tmp);
        return Err(copy_failed(from, to, source));
    }
    Ok(())
}

fn write_through(from: &Path, tmp: &Path, to: &Path, modified: SystemTime) -> io::Result<()> {
    fs::copy(from, tmp)?;
    let file = fs::OpenOptions::new().write(true).open(tmp)?;
    file.set_modified(modified)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, to)
}
