//! AWS S3 implementation of the StorageProvider trait
//!
//! Snapshots are uploaded under `{prefix}{snapshot file name}`; because the
//! names are timestamp-sortable, the newest object is simply the greatest key.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::{RestoreSource, StorageProvider};
use crate::config::BackupConfig;
use crate::database::backup_naming::BackupNamingService;
use crate::database::{BackupError, Result};

/// Provides AWS S3 storage for database backups
pub struct S3StorageProvider {
    /// S3 client
    client: S3Client,
    /// S3 bucket name
    bucket: String,
    /// Prefix for backup objects
    prefix: String,
    /// Recognizes snapshot names among the listed keys
    naming: BackupNamingService,
}

impl S3StorageProvider {
    /// Create a new S3StorageProvider with the given configuration
    pub async fn new(config: &BackupConfig) -> Result<Self> {
        let mut loader = aws_config::from_env()
            .region(aws_types::region::Region::new(config.s3.region.clone()));

        // Explicit keys win over the default credential provider chain
        if let (Some(key_id), Some(secret)) =
            (&config.s3.access_key_id, &config.s3.secret_access_key)
        {
            loader = loader.credentials_provider(aws_credential_types::Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "classroom-backup-config",
            ));
        }

        let aws_config = loader.load().await;
        let client = S3Client::new(&aws_config);

        // Verify that the bucket exists and is accessible
        match client.head_bucket().bucket(&config.s3.bucket).send().await {
            Ok(_) => {
                info!("Successfully connected to S3 bucket: {}", &config.s3.bucket);
            }
            Err(err) => {
                error!("Failed to access S3 bucket: {}: {}", &config.s3.bucket, err);
                return Err(BackupError::Aws(format!(
                    "Failed to access S3 bucket {}: {}",
                    &config.s3.bucket, err
                )));
            }
        }

        Ok(Self {
            client,
            bucket: config.s3.bucket.clone(),
            prefix: config.s3.prefix.clone(),
            naming: BackupNamingService::new(&config.file_prefix),
        })
    }

    /// Get the S3 key for a backup with the given name
    fn get_backup_key(&self, backup_name: &str) -> String {
        backup_key(&self.prefix, backup_name)
    }

    /// Map AWS S3 errors to BackupError
    fn map_s3_error<E: std::fmt::Debug>(&self, error: SdkError<E>, operation: &str) -> BackupError {
        match &error {
            SdkError::TimeoutError(_) => {
                BackupError::Aws(format!("S3 timeout during {}: {:?}", operation, error))
            }
            SdkError::ServiceError(service_err) => {
                let status_code = service_err.raw().http().status();
                if operation == "retrieve_backup" && status_code == 404 {
                    BackupError::BackupNotFound
                } else {
                    BackupError::Aws(format!("S3 service error during {}: {:?}", operation, error))
                }
            }
            _ => BackupError::Aws(format!("S3 error during {}: {:?}", operation, error)),
        }
    }
}

/// Object key for a snapshot
fn backup_key(prefix: &str, backup_name: &str) -> String {
    format!("{}{}", prefix, backup_name)
}

/// Snapshot name from an object key, if the key holds one
fn extract_backup_name(prefix: &str, naming: &BackupNamingService, key: &str) -> Option<String> {
    let name = key.strip_prefix(prefix)?;
    naming.is_snapshot_name(name).then(|| name.to_string())
}

#[async_trait]
impl StorageProvider for S3StorageProvider {
    async fn store_backup(&self, backup_path: &Path, backup_name: &str) -> Result<()> {
        let body = tokio_fs::read(backup_path).await?;
        let key = self.get_backup_key(backup_name);

        debug!("Uploading backup {} to S3 bucket {} with key {}", backup_name, self.bucket, key);
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.into())
            .send()
            .await
        {
            Ok(_) => {
                info!("Successfully uploaded backup {} to S3", backup_name);
                Ok(())
            }
            Err(err) => {
                error!("Failed to upload backup to S3: {}", err);
                Err(self.map_s3_error(err, "store_backup"))
            }
        }
    }

    async fn retrieve_backup(&self, backup_name: &str, destination_path: &Path) -> Result<()> {
        let key = self.get_backup_key(backup_name);

        debug!("Retrieving backup {} from S3 bucket {} with key {}", backup_name, self.bucket, key);
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                error!("Failed to retrieve backup from S3: {}", err);
                return Err(self.map_s3_error(err, "retrieve_backup"));
            }
        };

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| BackupError::Aws(format!("Failed to read S3 response body: {}", e)))?;
        let bytes = body.into_bytes();

        let mut file = tokio_fs::File::create(destination_path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;

        info!("Successfully retrieved backup {} from S3", backup_name);
        Ok(())
    }

    async fn list_backups(&self) -> Result<Vec<String>> {
        debug!("Listing backups in S3 bucket {}", self.bucket);

        let mut backup_names = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = match self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    error!("Failed to list backups in S3: {}", err);
                    return Err(self.map_s3_error(err, "list_backups"));
                }
            };

            for obj in resp.contents().unwrap_or_default() {
                if let Some(name) = obj
                    .key()
                    .and_then(|key| extract_backup_name(&self.prefix, &self.naming, key))
                {
                    backup_names.push(name);
                }
            }

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated() => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        backup_names.sort_by(|a, b| b.cmp(a));

        debug!("Found {} backups in S3", backup_names.len());
        Ok(backup_names)
    }

    async fn delete_backup(&self, backup_name: &str) -> Result<()> {
        let key = self.get_backup_key(backup_name);

        debug!("Deleting backup {} from S3 bucket {} with key {}", backup_name, self.bucket, key);
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => {
                info!("Successfully deleted backup {} from S3", backup_name);
                Ok(())
            }
            Err(err) => {
                error!("Failed to delete backup from S3: {}", err);
                Err(self.map_s3_error(err, "delete_backup"))
            }
        }
    }
}

#[async_trait]
impl RestoreSource for S3StorageProvider {
    async fn fetch_latest(&self, destination: &Path) -> Result<String> {
        let latest = self
            .get_latest_backup()
            .await?
            .ok_or(BackupError::BackupNotFound)?;
        self.retrieve_backup(&latest, destination).await?;
        Ok(format!("s3://{}/{}", self.bucket, self.get_backup_key(&latest)))
    }
}
