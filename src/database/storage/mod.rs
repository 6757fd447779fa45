//! Storage module for off-box backup copies
//!
//! This module provides an abstraction layer over remote locations that hold
//! backups: object storage that snapshots are uploaded to, and sources the
//! startup recovery can download the latest backup from.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::BackupConfig;
use crate::database::Result;

pub mod http_source;
pub mod s3_storage;

/// Provides a unified interface for remote backup storage operations
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store a backup file in the storage backend
    ///
    /// # Arguments
    /// * `backup_path` - Path to the backup file to store
    /// * `backup_name` - Snapshot filename, used as the remote object name
    async fn store_backup(&self, backup_path: &Path, backup_name: &str) -> Result<()>;

    /// Retrieve a backup file from storage
    ///
    /// # Arguments
    /// * `backup_name` - Name of the backup to retrieve
    /// * `destination_path` - Path where the backup should be saved locally
    async fn retrieve_backup(&self, backup_name: &str, destination_path: &Path) -> Result<()>;

    /// List all available backups, newest first
    async fn list_backups(&self) -> Result<Vec<String>>;

    /// Get the name of the most recent backup, or None if no backups exist
    async fn get_latest_backup(&self) -> Result<Option<String>> {
        Ok(self.list_backups().await?.into_iter().next())
    }

    /// Delete a backup from storage
    async fn delete_backup(&self, backup_name: &str) -> Result<()>;

    /// Clean up old backups, keeping only the `keep_count` most recent ones
    async fn cleanup_old_backups(&self, keep_count: usize) -> Result<()> {
        let backups = self.list_backups().await?;
        for backup_name in backups.iter().skip(keep_count) {
            self.delete_backup(backup_name).await?;
        }
        Ok(())
    }
}

/// A remote location the startup recovery can pull the latest backup from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestoreSource: Send + Sync {
    /// Download the most recent backup to `destination`
    ///
    /// Returns a short description of what was fetched, for logging.
    async fn fetch_latest(&self, destination: &Path) -> Result<String>;
}

/// Create the S3 storage provider if the configuration asks for one
///
/// Connectivity problems are logged and disable the provider; they are never
/// fatal.
pub async fn create_storage_provider(
    config: &BackupConfig,
) -> Option<Arc<s3_storage::S3StorageProvider>> {
    if !config.should_use_aws() {
        return None;
    }

    match s3_storage::S3StorageProvider::new(config).await {
        Ok(provider) => Some(Arc::new(provider)),
        Err(e) => {
            warn!("S3 storage disabled: {}", e);
            None
        }
    }
}

/// Pick the remote restore source
///
/// An explicit `REMOTE_BACKUP_URL` wins over object storage.
pub fn create_restore_source(
    config: &BackupConfig,
    object_store: Option<Arc<s3_storage::S3StorageProvider>>,
) -> Result<Option<Arc<dyn RestoreSource>>> {
    if let Some(url) = &config.remote_restore.url {
        let source = http_source::HttpRestoreSource::new(
            url,
            config.remote_restore.token.clone(),
            config.network_timeout,
        )?;
        return Ok(Some(Arc::new(source)));
    }

    Ok(object_store.map(|provider| provider as Arc<dyn RestoreSource>))
}
