//! Database Service for the live SQLite file
//!
//! Owns the schema (embedded migrations), the application connection pool and
//! the engine-level consistency check consumed by the backup subsystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::{
    Connection, Pool, Sqlite, SqliteConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::{debug, info};

use crate::database::{BackupError, Result};

// Database connection pool type
pub type DbPool = Pool<Sqlite>;

/// Figures shown in the backup email summary
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub total_students: Option<i64>,
    pub total_point_logs: Option<i64>,
    /// Days since the earliest student record
    pub running_days: Option<i64>,
}

/// Collaborator the backup subsystem relies on for anything schema-related
#[async_trait]
pub trait DatabaseService: Send + Sync {
    /// Location of the live database file
    fn path(&self) -> &Path;

    /// Create the schema in a new (or existing) database file
    async fn initialize_schema(&self) -> Result<()>;

    /// Collect summary statistics; `None` when the database cannot be read
    async fn system_stats(&self) -> Option<SystemStats>;
}

/// File-backed SQLite implementation of [`DatabaseService`]
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DatabaseService for SqliteDatabase {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn initialize_schema(&self) -> Result<()> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let migrated = sqlx::migrate!("./migrations").run(&pool).await;

        // Closing the last connection checkpoints the WAL into the main file
        pool.close().await;
        migrated.map_err(|e| BackupError::Sqlite(format!("Failed to run migrations: {}", e)))?;

        info!("Initialized database schema at {}", self.path.display());
        Ok(())
    }

    async fn system_stats(&self) -> Option<SystemStats> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .read_only(true);
        let mut conn = match SqliteConnection::connect_with(&options).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Could not open database for statistics: {}", e);
                return None;
            }
        };

        let total_students = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM students")
            .fetch_one(&mut conn)
            .await
            .ok();
        let total_point_logs = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM point_logs")
            .fetch_one(&mut conn)
            .await
            .ok();
        let earliest = sqlx::query_scalar::<_, Option<String>>("SELECT MIN(created_at) FROM students")
            .fetch_one(&mut conn)
            .await
            .ok()
            .flatten();

        let _ = conn.close().await;

        Some(SystemStats {
            total_students,
            total_point_logs,
            running_days: earliest.as_deref().and_then(days_since),
        })
    }
}

/// Whole days elapsed since a SQLite `CURRENT_TIMESTAMP` value, rounded up
fn days_since(timestamp: &str) -> Option<i64> {
    let earliest = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S").ok()?;
    let seconds = (Utc::now().naive_utc() - earliest).num_seconds().max(0);
    Some((seconds + 86_399) / 86_400)
}

/// Run SQLite's own consistency check against a database file
///
/// Returns `Ok(true)` only when the check reports a single `ok` row. The
/// connection is opened read-only and closed before returning.
pub async fn run_integrity_check(path: &Path) -> std::result::Result<bool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false);

    let mut conn = SqliteConnection::connect_with(&options).await?;
    let rows = sqlx::query_scalar::<_, String>("PRAGMA integrity_check")
        .fetch_all(&mut conn)
        .await;
    let _ = conn.close().await;

    let rows = rows?;
    Ok(rows.len() == 1 && rows[0] == "ok")
}

/// Open the application pool, running migrations if necessary
pub async fn connect_pool(path: &Path) -> std::result::Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::create_sample_database;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_initialize_schema_creates_valid_database() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("classroom.db");
        let database = SqliteDatabase::new(&db_path);

        database.initialize_schema().await.unwrap();

        assert!(db_path.exists());
        assert!(run_integrity_check(&db_path).await.unwrap());

        let stats = database.system_stats().await.unwrap();
        assert_eq!(stats.total_students, Some(0));
        assert_eq!(stats.total_point_logs, Some(0));
        assert_eq!(stats.running_days, None);
    }

    #[tokio::test]
    async fn test_initialize_schema_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("classroom.db");
        let database = SqliteDatabase::new(&db_path);

        database.initialize_schema().await.unwrap();
        database.initialize_schema().await.unwrap();

        assert!(run_integrity_check(&db_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_system_stats_counts_rows() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("classroom.db");
        create_sample_database(&db_path).await;

        let stats = SqliteDatabase::new(&db_path).system_stats().await.unwrap();

        assert_eq!(stats.total_students, Some(3));
        assert_eq!(stats.total_point_logs, Some(2));
        assert!(stats.running_days.unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_system_stats_tolerates_missing_tables() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("empty.db");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query("CREATE TABLE other (id INTEGER)")
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();

        let stats = SqliteDatabase::new(&db_path).system_stats().await.unwrap();

        assert_eq!(stats, SystemStats::default());
    }

    #[test]
    fn test_days_since_rounds_up() {
        let yesterday = (Utc::now().naive_utc() - chrono::Duration::hours(30))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        assert_eq!(days_since(&yesterday), Some(2));
        assert_eq!(days_since("not a timestamp"), None);
    }
}
