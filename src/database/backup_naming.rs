//! Backup naming module for generating and parsing timestamp-based snapshot names
//!
//! Snapshot filenames embed a fixed-width UTC timestamp with colons and
//! periods replaced, so sorting the names as strings sorts them by creation
//! time.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp layout used inside snapshot filenames
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%3f";

/// File extension for snapshot files
pub const SNAPSHOT_EXTENSION: &str = "db";

/// Service for generating snapshot filenames
#[derive(Debug, Clone)]
pub struct BackupNamingService {
    /// Leading part of each filename (e.g. "classroom")
    prefix: String,
}

impl BackupNamingService {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Generate a filename for a snapshot taken at the given time
    ///
    /// Format: {PREFIX}_backup_{YYYY-MM-DD}_{HH-MM-SS-mmm}Z.db
    pub fn file_name_for(&self, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}_backup_{}Z.{}",
            self.prefix,
            timestamp.format(TIMESTAMP_FORMAT),
            SNAPSHOT_EXTENSION
        )
    }

    /// Recover the creation time from a filename produced by this service
    ///
    /// Returns `None` for anything that does not follow the naming convention,
    /// including snapshots written with a different prefix.
    pub fn parse_timestamp(&self, file_name: &str) -> Option<DateTime<Utc>> {
        let stamp = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("_backup_")?
            .strip_suffix(SNAPSHOT_EXTENSION)?
            .strip_suffix('.')?
            .strip_suffix('Z')?;

        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Check whether a filename belongs to this service
    pub fn is_snapshot_name(&self, file_name: &str) -> bool {
        self.parse_timestamp(file_name).is_some()
    }
}
