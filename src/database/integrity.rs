//! Structural validation of SQLite database files

use std::path::Path;

use tokio::fs as tokio_fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::db::run_integrity_check;

/// First sixteen bytes of every SQLite 3 database file
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Decides whether a database file is usable
///
/// Every failure mode maps to `false`; the check never errors and never
/// writes to the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityChecker;

impl IntegrityChecker {
    pub fn new() -> Self {
        Self
    }

    pub async fn is_valid(&self, path: &Path) -> bool {
        match Self::has_sqlite_header(path).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("{} is missing, empty or not a SQLite file", path.display());
                return false;
            }
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                return false;
            }
        }

        match run_integrity_check(path).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Integrity check reported problems in {}", path.display());
                false
            }
            Err(e) => {
                warn!("Integrity check failed for {}: {}", path.display(), e);
                false
            }
        }
    }

    async fn has_sqlite_header(path: &Path) -> std::io::Result<bool> {
        let metadata = match tokio_fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if !metadata.is_file() || metadata.len() < SQLITE_HEADER.len() as u64 {
            return Ok(false);
        }

        let mut header = [0u8; 16];
        let mut file = tokio_fs::File::open(path).await?;
        file.read_exact(&mut header).await?;

        Ok(&header == SQLITE_HEADER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::{
        create_corrupt_file, create_damaged_database, create_sample_database,
    };
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_valid_database() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("classroom.db");
        create_sample_database(&path).await;

        assert!(IntegrityChecker::new().is_valid(&path).await);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("missing.db");

        assert!(!IntegrityChecker::new().is_valid(&path).await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("empty.db");
        std::fs::write(&path, b"").unwrap();

        assert!(!IntegrityChecker::new().is_valid(&path).await);
    }

    #[tokio::test]
    async fn test_corrupted_header() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("corrupt.db");
        create_corrupt_file(&path);

        assert!(!IntegrityChecker::new().is_valid(&path).await);
    }

    #[tokio::test]
    async fn test_valid_header_with_damaged_pages() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("damaged.db");
        create_damaged_database(&path);

        assert!(!IntegrityChecker::new().is_valid(&path).await);
    }

    #[tokio::test]
    async fn test_directory_is_not_valid() {
        let temp_dir = tempdir().unwrap();

        assert!(!IntegrityChecker::new().is_valid(temp_dir.path()).await);
    }

    #[tokio::test]
    async fn test_check_does_not_modify_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("classroom.db");
        create_sample_database(&path).await;
        let before = std::fs::read(&path).unwrap();

        assert!(IntegrityChecker::new().is_valid(&path).await);

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
