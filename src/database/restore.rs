//! Startup recovery of the live database
//!
//! Runs once before the application serves traffic. Each fallback is tried at
//! most once, in order: the current file, the newest local snapshot, the
//! remote restore source, and finally a freshly initialized schema.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{debug, error, info, warn};

use crate::database::integrity::IntegrityChecker;
use crate::database::snapshot::{
    SnapshotManager, install_database_file, remove_sidecars, replace_database_file, staging_dir,
};
use crate::database::storage::RestoreSource;
use crate::database::{BackupError, Result};
use crate::db::DatabaseService;

/// Which recovery path produced the database this process runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum RestoreDecision {
    AlreadyValid,
    RestoredFromLocal { snapshot: String },
    RestoredFromRemote { source: String },
    FreshInitialized,
}

impl RestoreDecision {
    /// Anything but an untouched database should be captured right away
    pub fn needs_protective_snapshot(&self) -> bool {
        !matches!(self, RestoreDecision::AlreadyValid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestoreState {
    CheckCurrent,
    RestoreLocal,
    RestoreRemote,
    FreshInit,
}

pub struct RestoreCoordinator {
    database: Arc<dyn DatabaseService>,
    snapshots: SnapshotManager,
    checker: IntegrityChecker,
    remote: Option<Arc<dyn RestoreSource>>,
}

impl RestoreCoordinator {
    pub fn new(
        database: Arc<dyn DatabaseService>,
        snapshots: SnapshotManager,
        remote: Option<Arc<dyn RestoreSource>>,
    ) -> Self {
        Self {
            database,
            snapshots,
            checker: IntegrityChecker::new(),
            remote,
        }
    }

    /// Walk the fallback chain until a usable database exists
    ///
    /// Only a failing fresh initialization is an error.
    pub async fn run(&self) -> Result<RestoreDecision> {
        let mut state = RestoreState::CheckCurrent;

        loop {
            debug!("Restore state: {:?}", state);
            state = match state {
                RestoreState::CheckCurrent => {
                    if self.checker.is_valid(self.database.path()).await {
                        info!("Database at {} is valid", self.database.path().display());
                        return Ok(RestoreDecision::AlreadyValid);
                    }
                    warn!(
                        "Database at {} is missing or corrupt, attempting recovery",
                        self.database.path().display()
                    );
                    if let Some(parent) = parent_dir(self.database.path()) {
                        if let Err(e) = tokio_fs::create_dir_all(parent).await {
                            warn!("Failed to create {}: {}", parent.display(), e);
                        }
                    }
                    RestoreState::RestoreLocal
                }
                RestoreState::RestoreLocal => match self.restore_local().await {
                    Some(snapshot) => {
                        info!("Restored database from local snapshot {}", snapshot);
                        return Ok(RestoreDecision::RestoredFromLocal { snapshot });
                    }
                    None => RestoreState::RestoreRemote,
                },
                RestoreState::RestoreRemote => match self.restore_remote().await {
                    Some(source) => {
                        info!("Restored database from remote source {}", source);
                        return Ok(RestoreDecision::RestoredFromRemote { source });
                    }
                    None => RestoreState::FreshInit,
                },
                RestoreState::FreshInit => {
                    self.fresh_init().await?;
                    warn!("Started with a fresh, empty database");
                    return Ok(RestoreDecision::FreshInitialized);
                }
            };
        }
    }

    async fn restore_local(&self) -> Option<String> {
        let latest = match self.snapshots.latest_snapshot().await {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                info!("No local snapshots in {}", self.snapshots.backup_dir().display());
                return None;
            }
            Err(e) => {
                warn!("Failed to list local snapshots: {}", e);
                return None;
            }
        };

        let target = self.database.path();
        if let Err(e) = replace_database_file(&latest.path, target).await {
            warn!("Failed to copy snapshot {}: {}", latest.file_name, e);
            return None;
        }

        if self.checker.is_valid(target).await {
            Some(latest.file_name)
        } else {
            warn!("Database restored from {} is not valid", latest.file_name);
            None
        }
    }

    async fn restore_remote(&self) -> Option<String> {
        let Some(remote) = &self.remote else {
            info!("No remote restore source configured");
            return None;
        };

        let target = self.database.path();
        let staged = match tempfile::NamedTempFile::new_in(staging_dir(target)) {
            Ok(staged) => staged,
            Err(e) => {
                warn!("Failed to create staging file for remote restore: {}", e);
                return None;
            }
        };

        let source = match remote.fetch_latest(staged.path()).await {
            Ok(source) => source,
            Err(e) => {
                warn!("Remote restore failed: {}", e);
                return None;
            }
        };

        if let Err(e) = install_database_file(staged, target).await {
            warn!("Failed to install remote backup: {}", e);
            return None;
        }

        if self.checker.is_valid(target).await {
            Some(source)
        } else {
            warn!("Database downloaded from {} is not valid", source);
            None
        }
    }

    async fn fresh_init(&self) -> Result<()> {
        let target = self.database.path();

        match tokio_fs::remove_file(target).await {
            Ok(()) => info!("Removed unusable database {}", target.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", target.display(), e),
        }
        remove_sidecars(target).await;

        let exhausted = |reason: String| {
            error!("Fresh database initialization failed: {}", reason);
            BackupError::RestoreExhausted(reason)
        };

        if let Some(parent) = parent_dir(target) {
            tokio_fs::create_dir_all(parent)
                .await
                .map_err(|e| exhausted(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        self.database
            .initialize_schema()
            .await
            .map_err(|e| exhausted(e.to_string()))?;

        if !self.checker.is_valid(target).await {
            return Err(exhausted(format!(
                "{} is not valid after initialization",
                target.display()
            )));
        }

        Ok(())
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::database::backup_naming::BackupNamingService;
    use crate::database::storage::MockRestoreSource;
    use crate::database::test_support::{create_corrupt_file, create_sample_database};
    use crate::db::SqliteDatabase;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        db_path: PathBuf,
        backup_dir: PathBuf,
        config: BackupConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("classroom.db");
        let backup_dir = dir.path().join("backups");
        let config = BackupConfig {
            database_path: db_path.clone(),
            backup_dir: backup_dir.clone(),
            ..BackupConfig::default()
        };
        Fixture {
            _dir: dir,
            db_path,
            backup_dir,
            config,
        }
    }

    fn coordinator(fixture: &Fixture, remote: Option<Arc<dyn RestoreSource>>) -> RestoreCoordinator {
        RestoreCoordinator::new(
            Arc::new(SqliteDatabase::new(&fixture.db_path)),
            SnapshotManager::new(&fixture.config),
            remote,
        )
    }

    async fn student_count(path: &Path) -> i64 {
        SqliteDatabase::new(path)
            .system_stats()
            .await
            .and_then(|s| s.total_students)
            .unwrap()
    }

    /// Place a valid snapshot into the backup directory
    async fn seed_local_snapshot(fixture: &Fixture) -> String {
        std::fs::create_dir_all(&fixture.backup_dir).unwrap();
        let name = BackupNamingService::new(&fixture.config.file_prefix)
            .file_name_for(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap());
        create_sample_database(&fixture.backup_dir.join(&name)).await;
        name
    }

    fn untouched_remote() -> Arc<dyn RestoreSource> {
        let mut remote = MockRestoreSource::new();
        remote.expect_fetch_latest().times(0);
        Arc::new(remote)
    }

    #[tokio::test]
    async fn test_valid_database_is_left_alone() {
        let fixture = fixture();
        create_sample_database(&fixture.db_path).await;
        let before = std::fs::read(&fixture.db_path).unwrap();

        let decision = coordinator(&fixture, Some(untouched_remote())).run().await.unwrap();

        assert_eq!(decision, RestoreDecision::AlreadyValid);
        assert!(!decision.needs_protective_snapshot());
        assert_eq!(std::fs::read(&fixture.db_path).unwrap(), before);
        assert!(!fixture.backup_dir.exists());
    }

    #[tokio::test]
    async fn test_corrupt_database_restored_from_local_snapshot() {
        let fixture = fixture();
        create_corrupt_file(&fixture.db_path);
        let name = seed_local_snapshot(&fixture).await;

        let decision = coordinator(&fixture, Some(untouched_remote())).run().await.unwrap();

        assert_eq!(decision, RestoreDecision::RestoredFromLocal { snapshot: name });
        assert!(IntegrityChecker::new().is_valid(&fixture.db_path).await);
        assert_eq!(student_count(&fixture.db_path).await, 3);
    }

    #[tokio::test]
    async fn test_missing_database_without_backups_is_initialized() {
        let fixture = fixture();

        let decision = coordinator(&fixture, None).run().await.unwrap();

        assert_eq!(decision, RestoreDecision::FreshInitialized);
        assert!(decision.needs_protective_snapshot());
        assert!(IntegrityChecker::new().is_valid(&fixture.db_path).await);
        assert_eq!(student_count(&fixture.db_path).await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_database_without_backups_is_initialized() {
        let fixture = fixture();
        create_corrupt_file(&fixture.db_path);

        let decision = coordinator(&fixture, None).run().await.unwrap();

        assert_eq!(decision, RestoreDecision::FreshInitialized);
        assert!(IntegrityChecker::new().is_valid(&fixture.db_path).await);
    }

    #[tokio::test]
    async fn test_invalid_local_snapshot_falls_through_to_remote() {
        let fixture = fixture();
        create_corrupt_file(&fixture.db_path);
        std::fs::create_dir_all(&fixture.backup_dir).unwrap();
        let name = BackupNamingService::new(&fixture.config.file_prefix)
            .file_name_for(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap());
        create_corrupt_file(&fixture.backup_dir.join(name));

        let remote_copy = fixture.backup_dir.join("remote-copy.sqlite");
        create_sample_database(&remote_copy).await;

        let mut remote = MockRestoreSource::new();
        remote
            .expect_fetch_latest()
            .times(1)
            .returning(move |destination| {
                std::fs::copy(&remote_copy, destination).unwrap();
                Ok("https://backups.example/latest.db".to_string())
            });

        let decision = coordinator(&fixture, Some(Arc::new(remote))).run().await.unwrap();

        assert_eq!(
            decision,
            RestoreDecision::RestoredFromRemote {
                source: "https://backups.example/latest.db".to_string()
            }
        );
        assert_eq!(student_count(&fixture.db_path).await, 3);
    }

    #[tokio::test]
    async fn test_failed_remote_is_tried_once_then_fresh() {
        let fixture = fixture();
        create_corrupt_file(&fixture.db_path);

        let mut remote = MockRestoreSource::new();
        remote
            .expect_fetch_latest()
            .times(1)
            .returning(|_| Err(BackupError::Storage("connection refused".to_string())));

        let decision = coordinator(&fixture, Some(Arc::new(remote))).run().await.unwrap();

        assert_eq!(decision, RestoreDecision::FreshInitialized);
        assert!(IntegrityChecker::new().is_valid(&fixture.db_path).await);
    }

    #[tokio::test]
    async fn test_corrupt_remote_download_is_not_retried() {
        let fixture = fixture();
        create_corrupt_file(&fixture.db_path);

        let mut remote = MockRestoreSource::new();
        remote
            .expect_fetch_latest()
            .times(1)
            .returning(|destination| {
                create_corrupt_file(destination);
                Ok("s3://classroom/backups/latest.db".to_string())
            });

        let decision = coordinator(&fixture, Some(Arc::new(remote))).run().await.unwrap();

        assert_eq!(decision, RestoreDecision::FreshInitialized);
    }

    #[tokio::test]
    async fn test_unwritable_location_is_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, b"plain file").unwrap();
        let config = BackupConfig {
            database_path: blocker.join("classroom.db"),
            backup_dir: dir.path().join("backups"),
            ..BackupConfig::default()
        };

        let result = RestoreCoordinator::new(
            Arc::new(SqliteDatabase::new(&config.database_path)),
            SnapshotManager::new(&config),
            None,
        )
        .run()
        .await;

        assert!(matches!(result, Err(BackupError::RestoreExhausted(_))));
    }
}
