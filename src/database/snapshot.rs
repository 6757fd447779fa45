//! Local snapshot creation and retention
//!
//! Snapshots are full copies of the live database written into the backup
//! directory under sortable, timestamped names. The backup directory is owned
//! by this module; nothing else writes there.

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Connection, SqliteConnection, sqlite::SqliteConnectOptions};
use tokio::fs as tokio_fs;
use tracing::{debug, info, warn};

use crate::config::{BackupConfig, SnapshotMode};
use crate::database::backup_naming::BackupNamingService;
use crate::database::{BackupError, Result};

/// One point-in-time copy of the database
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub path: PathBuf,
    pub file_name: String,
    /// Taken from the filename, not from filesystem metadata
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// What a rotation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotationReport {
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    /// Files that should have been deleted but could not be
    pub failed: Vec<PathBuf>,
}

/// Creates, lists and rotates snapshots of the live database
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    source_path: PathBuf,
    backup_dir: PathBuf,
    naming: BackupNamingService,
    mode: SnapshotMode,
}

impl SnapshotManager {
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            source_path: config.database_path.clone(),
            backup_dir: config.backup_dir.clone(),
            naming: BackupNamingService::new(&config.file_prefix),
            mode: config.snapshot_mode,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Create the backup directory (and parents) if it does not exist yet
    pub async fn ensure_backup_dir(&self) -> Result<()> {
        tokio_fs::create_dir_all(&self.backup_dir).await?;
        Ok(())
    }

    /// Copy the live database into a new timestamped snapshot
    pub async fn create_snapshot(&self) -> Result<Snapshot> {
        if !tokio_fs::try_exists(&self.source_path).await.unwrap_or(false) {
            return Err(BackupError::SourceMissing(
                self.source_path.display().to_string(),
            ));
        }

        self.ensure_backup_dir().await?;

        let (path, file_name, created_at) = self.next_free_path(Utc::now()).await?;

        match self.mode {
            SnapshotMode::Online => self.online_copy(&path).await?,
            SnapshotMode::Copy => {
                tokio_fs::copy(&self.source_path, &path).await?;
            }
        }

        let size_bytes = tokio_fs::metadata(&path).await?.len();
        info!("Created snapshot {} ({} bytes)", file_name, size_bytes);

        Ok(Snapshot {
            path,
            file_name,
            created_at,
            size_bytes,
        })
    }

    /// Pick a filename that is not taken yet and sorts after every existing
    /// snapshot, even when the clock has stepped back since the last one
    async fn next_free_path(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(PathBuf, String, DateTime<Utc>)> {
        let mut timestamp = match self.latest_snapshot().await? {
            Some(latest) if latest.created_at > now => {
                warn!(
                    "Clock is behind newest snapshot {}, naming the new one after it",
                    latest.file_name
                );
                latest.created_at + Duration::milliseconds(1)
            }
            _ => now,
        };

        loop {
            let file_name = self.naming.file_name_for(timestamp);
            let path = self.backup_dir.join(&file_name);
            if !tokio_fs::try_exists(&path).await.unwrap_or(false) {
                // Names carry millisecond precision only
                let created_at = self.naming.parse_timestamp(&file_name).unwrap_or(timestamp);
                return Ok((path, file_name, created_at));
            }
            timestamp += Duration::milliseconds(1);
        }
    }

    /// Consistent copy through `VACUUM INTO`, falling back to a raw copy when
    /// the engine refuses (for example on a damaged source forced through)
    async fn online_copy(&self, destination: &Path) -> Result<()> {
        match self.vacuum_into(destination).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Online snapshot failed, falling back to file copy: {}", e);
                let _ = tokio_fs::remove_file(destination).await;
                tokio_fs::copy(&self.source_path, destination).await?;
                Ok(())
            }
        }
    }

    async fn vacuum_into(&self, destination: &Path) -> Result<()> {
        let dest = destination
            .to_str()
            .ok_or_else(|| BackupError::Sqlite("Invalid backup path".to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(&self.source_path)
            .read_only(true)
            .create_if_missing(false);
        let mut conn = SqliteConnection::connect_with(&options).await?;

        let result = sqlx::query("VACUUM INTO ?").bind(dest).execute(&mut conn).await;
        let _ = conn.close().await;

        result
            .map(|_| ())
            .map_err(|e| BackupError::Sqlite(format!("Failed to execute VACUUM INTO: {}", e)))
    }

    /// All snapshots in the backup directory, newest first
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut entries = match tokio_fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(created_at) = self.naming.parse_timestamp(&file_name) else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };

            snapshots.push(Snapshot {
                path: entry.path(),
                file_name,
                created_at,
                size_bytes: metadata.len(),
            });
        }

        // String order equals time order for these names
        snapshots.sort_by(|a, b| b.file_name.cmp(&a.file_name));

        Ok(snapshots)
    }

    /// Most recent snapshot, if any
    pub async fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.list_snapshots().await?.into_iter().next())
    }

    /// Delete every snapshot beyond the `retention_count` newest
    ///
    /// A file that cannot be deleted is logged and skipped.
    pub async fn rotate(&self, retention_count: usize) -> Result<RotationReport> {
        self.rotate_with(retention_count, |path: PathBuf| tokio_fs::remove_file(path))
            .await
    }

    async fn rotate_with<F, Fut>(&self, retention_count: usize, remove: F) -> Result<RotationReport>
    where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = std::io::Result<()>>,
    {
        let snapshots = self.list_snapshots().await?;
        let mut report = RotationReport {
            kept: snapshots.len().min(retention_count),
            ..RotationReport::default()
        };

        for snapshot in snapshots.iter().skip(retention_count) {
            match remove(snapshot.path.clone()).await {
                Ok(()) => {
                    debug!("Deleted old snapshot {}", snapshot.file_name);
                    report.deleted.push(snapshot.path.clone());
                }
                Err(e) => {
                    warn!("Failed to delete old snapshot {}: {}", snapshot.file_name, e);
                    report.failed.push(snapshot.path.clone());
                }
            }
        }

        if !report.deleted.is_empty() {
            info!(
                "Rotated snapshots: kept {}, deleted {}",
                report.kept,
                report.deleted.len()
            );
        }

        Ok(report)
    }

    /// Remove a single snapshot, used when a fresh copy fails verification
    pub async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        tokio_fs::remove_file(&snapshot.path).await?;
        Ok(())
    }

    /// Map an operator-supplied filename to a snapshot inside the backup directory
    pub async fn resolve(&self, file_name: &str) -> Result<Snapshot> {
        if file_name.contains(['/', '\\']) || !self.naming.is_snapshot_name(file_name) {
            return Err(BackupError::InvalidSnapshot(format!(
                "{} is not a snapshot name",
                file_name
            )));
        }

        self.list_snapshots()
            .await?
            .into_iter()
            .find(|snapshot| snapshot.file_name == file_name)
            .ok_or(BackupError::BackupNotFound)
    }
}

/// Path of a SQLite sidecar file such as `-wal` or `-shm`
fn sidecar_path(database: &Path, suffix: &str) -> PathBuf {
    let mut name = database.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Delete journal files that belong to a database file being replaced
pub async fn remove_sidecars(database: &Path) {
    for suffix in ["-wal", "-shm", "-journal"] {
        let path = sidecar_path(database, suffix);
        match tokio_fs::remove_file(&path).await {
            Ok(()) => debug!("Removed stale {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

/// Directory a replacement file should be staged in so the final rename stays
/// on one filesystem
pub fn staging_dir(target: &Path) -> PathBuf {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Move a fully written staging file over `target`
pub async fn install_database_file(staged: tempfile::NamedTempFile, target: &Path) -> Result<()> {
    staged.persist(target).map_err(|e| BackupError::Io(e.error))?;
    remove_sidecars(target).await;
    Ok(())
}

/// Replace `target` with a copy of `source`, staged next to the target
pub async fn replace_database_file(source: &Path, target: &Path) -> Result<()> {
    let staged = tempfile::NamedTempFile::new_in(staging_dir(target))?;
    tokio_fs::copy(source, staged.path()).await?;
    install_database_file(staged, target).await
}
