//! Backups taken before every mutation, plus full rollback snapshots.
//!
//! A file backup lives beside its original as `<path>.backup.<stamp>`. All
//! backups taken by one run share the run's stamp (the "backup set"); a file
//! backed up twice in one run keeps its first, pristine copy.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::effects::Executor;
use crate::error::MigrationError;

pub const BACKUP_INFIX: &str = ".backup.";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Sidecar metadata written next to a rollback archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub domain: String,
    pub archive: PathBuf,
    pub size_bytes: u64,
    pub entries: Vec<PathBuf>,
}

pub struct BackupManager {
    stamp: String,
    records: Vec<BackupRecord>,
}

impl BackupManager {
    pub fn new(stamp: impl Into<String>) -> Self {
        Self {
            stamp: stamp.into(),
            records: Vec::new(),
        }
    }

    /// A manager stamped with the current time.
    pub fn now() -> Self {
        Self::new(Utc::now().format(STAMP_FORMAT).to_string())
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Backups taken by this manager.
    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn backup_path_for(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(BACKUP_INFIX);
        name.push(&self.stamp);
        PathBuf::from(name)
    }

    /// Copy `path` aside and verify the copy.
    ///
    /// Returns `Ok(None)` when the source does not exist (nothing to protect)
    /// or when the copy was only simulated. An invalid copy is an error the
    /// caller must not proceed past.
    pub fn backup(
        &mut self,
        path: &Path,
        exec: &mut Executor,
    ) -> Result<Option<BackupRecord>, MigrationError> {
        if !path.exists() {
            warn!(path = %path.display(), "Nothing to back up; source absent");
            return Ok(None);
        }

        let backup_path = self.backup_path_for(path);
        if let Some(existing) = self.records.iter().find(|r| r.backup_path == backup_path) {
            let existing = existing.clone();
            self.ensure_valid(&existing)?;
            return Ok(Some(existing));
        }

        exec.copy_file(path, &backup_path)?;
        if exec.is_dry_run() {
            return Ok(None);
        }

        let record = BackupRecord {
            original_path: path.to_path_buf(),
            size_bytes: fs::metadata(&backup_path).map(|m| m.len()).unwrap_or(0),
            sha256: sha256_file(&backup_path).unwrap_or_default(),
            backup_path,
            created_at: Utc::now(),
        };
        self.ensure_valid(&record)?;
        info!(
            original = %record.original_path.display(),
            backup = %record.backup_path.display(),
            size = record.size_bytes,
            "Backup verified"
        );
        self.records.push(record.clone());
        Ok(Some(record))
    }

    /// A backup is valid iff it exists, is non-empty, and still matches its digest.
    pub fn verify(record: &BackupRecord) -> bool {
        let Ok(meta) = fs::metadata(&record.backup_path) else {
            return false;
        };
        if !meta.is_file() || meta.len() == 0 || meta.len() != record.size_bytes {
            return false;
        }
        record.sha256.is_empty() || sha256_file(&record.backup_path).as_deref() == Some(&record.sha256)
    }

    fn ensure_valid(&self, record: &BackupRecord) -> Result<(), MigrationError> {
        if Self::verify(record) {
            return Ok(());
        }
        let reason = match fs::metadata(&record.backup_path) {
            Err(_) => "backup file is missing".to_string(),
            Ok(meta) if meta.len() == 0 => "backup file is empty".to_string(),
            Ok(_) => "backup content does not match".to_string(),
        };
        Err(MigrationError::InvalidBackup {
            path: record.original_path.clone(),
            reason,
        })
    }

    /// Restore one record over its original.
    pub fn rollback(record: &BackupRecord, exec: &mut Executor) -> Result<()> {
        if !Self::verify(record) {
            anyhow::bail!(
                "Refusing to restore {} from invalid backup {}",
                record.original_path.display(),
                record.backup_path.display()
            );
        }
        exec.copy_file(&record.backup_path, &record.original_path)
    }

    /// Create the full rollback archive and its sidecar info file.
    pub fn create_snapshot(
        &mut self,
        root: &Path,
        paths: &[PathBuf],
        snapshot_dir: &Path,
        hostname: &str,
        domain: &str,
        exec: &mut Executor,
    ) -> Result<Option<BackupRecord>, MigrationError> {
        let archive = snapshot_dir.join(format!("rollback-{}.tar.gz", self.stamp));
        let info_path = archive.with_extension("").with_extension("info");

        if exec.is_dry_run() {
            exec.write_file(&archive, "", "full rollback snapshot")?;
            exec.write_file(&info_path, "", "snapshot metadata")?;
            return Ok(None);
        }

        fs::create_dir_all(snapshot_dir)?;
        let entries = write_archive(root, paths, &archive)?;
        let record = BackupRecord {
            original_path: root.to_path_buf(),
            size_bytes: fs::metadata(&archive).map(|m| m.len()).unwrap_or(0),
            sha256: sha256_file(&archive).unwrap_or_default(),
            backup_path: archive.clone(),
            created_at: Utc::now(),
        };
        self.ensure_valid(&record)?;

        let info = SnapshotInfo {
            created_at: record.created_at,
            hostname: hostname.to_string(),
            domain: domain.to_string(),
            archive,
            size_bytes: record.size_bytes,
            entries,
        };
        let json = serde_json::to_string_pretty(&info).context("Failed to serialize snapshot info")?;
        fs::write(&info_path, json)
            .with_context(|| format!("Failed to write {}", info_path.display()))?;
        info!(archive = %record.backup_path.display(), size = record.size_bytes, "Rollback snapshot created");

        self.records.push(record.clone());
        Ok(Some(record))
    }
}

/// Newest `<path>.backup.<stamp>` beside `path`.
pub fn latest_backup(path: &Path) -> Option<PathBuf> {
    let parent = path.parent()?;
    let name = path.file_name()?.to_str()?;
    let prefix = format!("{name}{BACKUP_INFIX}");

    fs::read_dir(parent)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let file_name = e.file_name().to_str()?.to_string();
            let stamp = file_name.strip_prefix(&prefix)?.to_string();
            is_stamp(&stamp).then(|| (stamp, e.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, p)| p)
}

/// Stamp of the newest backup among `tracked`.
pub fn latest_backup_set(tracked: &[PathBuf]) -> Option<String> {
    tracked
        .iter()
        .filter_map(|p| latest_backup(p))
        .filter_map(|b| {
            let name = b.file_name()?.to_str()?.to_string();
            name.rsplit_once(BACKUP_INFIX).map(|(_, s)| s.to_string())
        })
        .max()
}

/// Restore the newest backup of each tracked file independently.
///
/// Returns the `(original, backup)` pairs restored.
pub fn revert_files(tracked: &[PathBuf], exec: &mut Executor) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut restored = Vec::new();
    for path in tracked {
        let Some(backup) = latest_backup(path) else {
            debug!(path = %path.display(), "No backup to restore");
            continue;
        };
        let size = fs::metadata(&backup).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            warn!(backup = %backup.display(), "Skipping empty backup");
            continue;
        }
        exec.copy_file(&backup, path)?;
        restored.push((path.clone(), backup));
    }
    Ok(restored)
}

/// Newest rollback archive in `snapshot_dir`.
pub fn latest_snapshot(snapshot_dir: &Path) -> Option<PathBuf> {
    fs::read_dir(snapshot_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("rollback-") && n.ends_with(".tar.gz"))
                .unwrap_or(false)
        })
        .max()
}

/// Extract a rollback archive over `root`, verbatim. Returns the entry count.
pub fn restore_snapshot(archive: &Path, root: &Path) -> Result<usize> {
    let file = fs::File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);

    let mut count = 0;
    for entry in tar
        .entries()
        .with_context(|| format!("Failed to read {}", archive.display()))?
    {
        let mut entry = entry.context("Corrupt archive entry")?;
        entry
            .unpack_in(root)
            .with_context(|| format!("Failed to extract into {}", root.display()))?;
        count += 1;
    }
    Ok(count)
}

fn write_archive(root: &Path, paths: &[PathBuf], archive: &Path) -> Result<Vec<PathBuf>> {
    let file = fs::File::create(archive)
        .with_context(|| format!("Failed to create {}", archive.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut entries = Vec::new();
    for system_path in paths {
        let relative = system_path.strip_prefix("/").unwrap_or(system_path);
        let source = root.join(relative);
        if !source.exists() {
            debug!(path = %source.display(), "Not present; left out of snapshot");
            continue;
        }
        if source.is_dir() {
            builder
                .append_dir_all(relative, &source)
                .with_context(|| format!("Failed to archive {}", source.display()))?;
        } else {
            builder
                .append_path_with_name(&source, relative)
                .with_context(|| format!("Failed to archive {}", source.display()))?;
        }
        entries.push(system_path.clone());
    }

    builder
        .into_inner()
        .context("Failed to finish archive")?
        .finish()
        .context("Failed to finish compression")?;
    Ok(entries)
}

fn sha256_file(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

fn is_stamp(s: &str) -> bool {
    s.len() == 15
        && s.char_indices().all(|(i, c)| {
            if i == 8 {
                c == '_'
            } else {
                c.is_ascii_digit()
            }
        })
}
