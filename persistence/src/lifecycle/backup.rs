//! Directory snapshots of file backends.
//!
//! Each snapshot is a copy of the database directory named
//! `<database>_<backend>_<unix_millis>` under the backup root. Retention
//! keeps the newest snapshots by the embedded timestamp.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::backend::BackendType;
use crate::error::PersistenceError;

/// One snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupDescriptor {
    pub path: PathBuf,
    pub database: String,
    pub backend: BackendType,
    pub created_at_millis: u64,
}

impl BackupDescriptor {
    pub fn dir_name(database: &str, backend: BackendType, created_at_millis: u64) -> String {
        format!("{database}_{backend}_{created_at_millis}")
    }

    /// Parse a snapshot directory. Returns `None` for anything that does not
    /// follow the naming scheme.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let mut parts = name.rsplitn(3, '_');
        let created_at_millis = parts.next()?.parse().ok()?;
        let backend = parts.next()?.parse().ok()?;
        let database = parts.next().filter(|d| !d.is_empty())?;
        Some(Self {
            path: path.to_path_buf(),
            database: database.to_string(),
            backend,
            created_at_millis,
        })
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

impl fmt::Display for BackupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}, {})",
            self.name(),
            self.database,
            self.backend,
            self.created_at_millis
        )
    }
}

fn backup_error(context: &str, err: impl fmt::Display) -> PersistenceError {
    PersistenceError::BackupFailed(format!("{context}: {err}"))
}

/// Recursively copy `src` into the not yet existing `dst`, skipping temp files
/// left by interrupted writes. A `dst` nested inside `src` is not copied into
/// itself.
fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<u64> {
    copy_tree(src, dst, dst)
}

fn copy_tree(src: &Path, dst: &Path, skip: &Path) -> std::io::Result<u64> {
    std::fs::create_dir(dst)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            if skip.starts_with(&path) {
                continue;
            }
            copied += copy_tree(&path, &target, skip)?;
        } else if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
            copied += std::fs::copy(&path, &target)?;
        }
    }
    Ok(copied)
}

/// Snapshot `source` into the backup root.
pub fn create_backup(
    source: &Path,
    backup_root: &Path,
    database: &str,
    backend: BackendType,
    now_millis: u64,
) -> Result<BackupDescriptor, PersistenceError> {
    if !source.is_dir() {
        return Err(backup_error(
            "source directory missing",
            source.display(),
        ));
    }
    std::fs::create_dir_all(backup_root).map_err(|e| backup_error("create backup root", e))?;

    let path = backup_root.join(BackupDescriptor::dir_name(database, backend, now_millis));
    match copy_dir(source, &path) {
        Ok(bytes) => {
            tracing::info!(
                backup = %path.display(),
                bytes,
                "Created backup"
            );
            Ok(BackupDescriptor {
                path,
                database: database.to_string(),
                backend,
                created_at_millis: now_millis,
            })
        }
        Err(e) => {
            // Leave no half-written snapshot behind for retention to count.
            if path.exists() {
                let _ = std::fs::remove_dir_all(&path);
            }
            Err(backup_error("copy data directory", e))
        }
    }
}

/// Snapshots under `backup_root`, newest first. `database` narrows the list
/// to one database.
pub fn list_backups(
    backup_root: &Path,
    database: Option<&str>,
) -> Result<Vec<BackupDescriptor>, PersistenceError> {
    if !backup_root.exists() {
        return Ok(vec![]);
    }
    let entries = std::fs::read_dir(backup_root).map_err(|e| backup_error("list backups", e))?;
    let mut backups: Vec<BackupDescriptor> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| BackupDescriptor::from_path(&entry.path()))
        .filter(|b| database.map_or(true, |db| b.database == db))
        .collect();
    backups.sort_by(|a, b| {
        b.created_at_millis
            .cmp(&a.created_at_millis)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(backups)
}

/// Delete all but the newest `keep` snapshots of `database`. Returns the
/// deleted snapshots.
pub fn prune_backups(
    backup_root: &Path,
    database: &str,
    keep: usize,
) -> Result<Vec<BackupDescriptor>, PersistenceError> {
    let backups = list_backups(backup_root, Some(database))?;
    let mut removed = Vec::new();
    // Oldest first.
    for backup in backups.into_iter().skip(keep).rev() {
        match std::fs::remove_dir_all(&backup.path) {
            Ok(()) => {
                tracing::debug!(backup = %backup.path.display(), "Pruned backup");
                removed.push(backup);
            }
            Err(e) => tracing::warn!("Failed to prune backup {:?}: {}", backup.path, e),
        }
    }
    Ok(removed)
}

/// Replace `target` with the contents of a snapshot. The current directory
/// is moved aside first and put back if the copy fails.
pub fn restore_backup(backup: &BackupDescriptor, target: &Path, now_millis: u64) -> Result<(), PersistenceError> {
    if !backup.path.is_dir() {
        return Err(backup_error("snapshot missing", backup.path.display()));
    }

    let aside = target.with_file_name(format!(
        "{}.pre-restore-{now_millis}",
        target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("data")
    ));
    let had_target = target.exists();
    if had_target {
        std::fs::rename(target, &aside).map_err(|e| backup_error("move current data aside", e))?;
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| backup_error("create data directory", e))?;
    }

    match copy_dir(&backup.path, target) {
        Ok(_) => {
            if had_target {
                if let Err(e) = std::fs::remove_dir_all(&aside) {
                    tracing::warn!("Failed to remove pre-restore copy {:?}: {}", aside, e);
                }
            }
            tracing::info!(backup = %backup.path.display(), "Restored backup");
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_dir_all(target);
            if had_target {
                if let Err(undo) = std::fs::rename(&aside, target) {
                    tracing::error!(
                        "Failed to put original data back from {:?}: {}",
                        aside,
                        undo
                    );
                }
            }
            Err(backup_error("copy snapshot", e))
        }
    }
}
