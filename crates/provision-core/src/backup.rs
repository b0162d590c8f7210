//! Pre-mutation snapshots of host paths, restorable during rollback.
//!
//! A snapshot is a gzip'd tar where each requested path is stored under its
//! index (`0`, `1`, ...), plus a YAML sidecar describing which path each
//! index maps to and whether it existed at snapshot time.

use crate::error::{BackupError, RestoreError};
use crate::io::{ensure_dir, remove_path};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackedUpPath {
    pub path: PathBuf,
    /// False when the path was absent at snapshot time; restore then removes it.
    pub existed: bool,
    /// Top-level archive entry name holding this path.
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub paths: Vec<BackedUpPath>,
    pub archive: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.yaml"))
    }

    /// Archive `paths`. Paths that do not exist are recorded as absent.
    pub fn snapshot(&self, paths: &[PathBuf]) -> Result<BackupRecord, BackupError> {
        ensure_dir(&self.dir)?;
        let created_at = Utc::now();
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", created_at.format("%Y%m%dT%H%M%S"), &short[..8]);
        let archive = self.dir.join(format!("{id}.tar.gz"));

        let result = write_archive(&archive, paths);
        let backed_up = match result {
            Ok(b) => b,
            Err(e) => {
                let _ = std::fs::remove_file(&archive);
                return Err(e);
            }
        };

        let record = BackupRecord {
            id,
            paths: backed_up,
            archive,
            created_at,
        };
        let manifest = serde_yaml::to_string(&record)?;
        crate::io::atomic_write(&self.manifest_path(&record.id), manifest.as_bytes())?;

        tracing::info!(
            backup = %record.id,
            paths = record.paths.len(),
            archive = %record.archive.display(),
            "backup snapshot written"
        );
        Ok(record)
    }

    /// Put every recorded path back the way it was at snapshot time.
    ///
    /// Destructive: current contents of each target are removed first.
    pub fn restore(&self, record: &BackupRecord) -> Result<(), RestoreError> {
        if !record.archive.exists() {
            return Err(RestoreError::MissingArchive(record.archive.clone()));
        }

        for p in &record.paths {
            remove_path(&p.path).map_err(|source| RestoreError::Path {
                path: p.path.clone(),
                source,
            })?;
        }

        let file = File::open(&record.archive)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.into_owned();
            let mut components = rel.components();
            let Some(Component::Normal(first)) = components.next() else {
                continue;
            };
            let rest = components.as_path();
            if rest.components().any(|c| !matches!(c, Component::Normal(_))) {
                continue;
            }
            let Some(target) = record
                .paths
                .iter()
                .find(|p| p.existed && first.to_str() == Some(p.entry.as_str()))
            else {
                continue;
            };
            let dest = if rest.as_os_str().is_empty() {
                target.path.clone()
            } else {
                target.path.join(rest)
            };
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest).map_err(|source| RestoreError::Path {
                path: dest.clone(),
                source,
            })?;
        }

        tracing::info!(backup = %record.id, "backup restored");
        Ok(())
    }

    /// Stored records, newest first. Unreadable manifests are skipped.
    pub fn list(&self) -> Result<Vec<BackupRecord>, BackupError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            match serde_yaml::from_str::<BackupRecord>(&data) {
                Ok(r) => records.push(r),
                Err(e) => {
                    tracing::warn!(manifest = %path.display(), error = %e, "skipping unreadable backup manifest")
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    pub fn load_record(&self, id: &str) -> Result<Option<BackupRecord>, BackupError> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&data)?))
    }
}

fn write_archive(archive: &Path, paths: &[PathBuf]) -> Result<Vec<BackedUpPath>, BackupError> {
    let file = File::create(archive)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut backed_up = Vec::with_capacity(paths.len());
    for (i, path) in paths.iter().enumerate() {
        let entry = i.to_string();
        let existed = match std::fs::symlink_metadata(path) {
            Ok(meta) => {
                let appended = if meta.is_dir() {
                    builder.append_dir_all(&entry, path)
                } else {
                    builder.append_path_with_name(path, &entry)
                };
                appended.map_err(|source| BackupError::Archive {
                    path: path.clone(),
                    source,
                })?;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(source) => {
                return Err(BackupError::Archive {
                    path: path.clone(),
                    source,
                })
            }
        };
        backed_up.push(BackedUpPath {
            path: path.clone(),
            existed,
            entry,
        });
    }

    builder.into_inner()?.finish()?;
    Ok(backed_up)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
