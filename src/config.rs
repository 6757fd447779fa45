use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// How a snapshot is taken from the live database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// SQLite `VACUUM INTO`, a transactionally consistent copy
    Online,
    /// Raw byte-for-byte file copy
    Copy,
}

/// Recurring backup schedule
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Whether the scheduled backup runs at all
    pub auto_backup_enabled: bool,
    /// Five-field cron expression
    pub cron: String,
    /// IANA timezone the cron expression is evaluated in
    pub timezone: String,
}

/// Remote webhook upload target
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

/// SMTP delivery settings
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Snapshots larger than this are not attached
    pub max_attachment_bytes: u64,
    /// Send a plain notice to the recipient when a scheduled run fails
    pub notify_on_failure: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::from("smtp.gmail.com"),
            smtp_port: 587,
            smtp_user: None,
            smtp_password: None,
            from: None,
            to: None,
            cc: Vec::new(),
            bcc: Vec::new(),
            max_attachment_bytes: 25 * 1024 * 1024,
            notify_on_failure: true,
        }
    }
}

/// S3 object storage used for off-box copies and remote restore
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Whether AWS S3 should be used at all
    pub use_aws: bool,
    /// S3 bucket name for database backups
    pub bucket: String,
    /// AWS region for S3 operations
    pub region: String,
    /// Key prefix for backup objects
    pub prefix: String,
    /// Number of remote backups to keep, unlimited when unset
    pub max_count: Option<usize>,
    /// Explicit static credentials; the default provider chain is used otherwise
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            use_aws: false,
            bucket: String::new(),
            region: String::from("us-west-2"),
            prefix: String::from("backups/"),
            max_count: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Plain HTTP location holding the most recent backup
#[derive(Debug, Clone, Default)]
pub struct RemoteRestoreConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

/// Configuration for database backup and restore functionality
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Live SQLite database file
    pub database_path: PathBuf,
    /// Local directory holding timestamped snapshots
    pub backup_dir: PathBuf,
    /// Number of local snapshots to keep
    pub retention_count: usize,
    /// Leading part of every snapshot filename
    pub file_prefix: String,
    pub snapshot_mode: SnapshotMode,
    pub schedule: ScheduleConfig,
    pub webhook: WebhookConfig,
    pub email: EmailConfig,
    pub s3: S3Config,
    pub remote_restore: RemoteRestoreConfig,
    /// Upper bound for any single network operation
    pub network_timeout: Duration,
    /// Delay before the protective snapshot after a startup recovery
    pub startup_snapshot_delay: Duration,
    /// Number of error entries kept in the status registry
    pub status_error_capacity: usize,
    /// Optional append-only run log
    pub run_log_path: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("classroom.db"),
            backup_dir: PathBuf::from("./backups"),
            retention_count: 7,
            file_prefix: String::from("classroom"),
            snapshot_mode: SnapshotMode::Online,
            schedule: ScheduleConfig {
                auto_backup_enabled: true,
                cron: String::from("0 */4 * * *"),
                timezone: String::from("Asia/Hong_Kong"),
            },
            webhook: WebhookConfig::default(),
            email: EmailConfig::default(),
            s3: S3Config::default(),
            remote_restore: RemoteRestoreConfig::default(),
            network_timeout: Duration::from_secs(30),
            startup_snapshot_delay: Duration::from_secs(2),
            status_error_capacity: 50,
            run_log_path: None,
        }
    }
}

impl BackupConfig {
    /// Load backup configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load backup configuration from an arbitrary key/value source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // Blank values count as unset
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());
        let list = |key: &str| {
            get(key)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default()
        };

        let snapshot_mode = match get("BACKUP_SNAPSHOT_MODE").map(|v| v.to_lowercase()) {
            Some(mode) if mode == "copy" => SnapshotMode::Copy,
            _ => SnapshotMode::Online,
        };

        let schedule = ScheduleConfig {
            auto_backup_enabled: get("AUTO_BACKUP_ENABLED")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
            cron: get("BACKUP_CRON_SCHEDULE").unwrap_or(defaults.schedule.cron),
            timezone: get("BACKUP_TIMEZONE")
                .or_else(|| get("TZ"))
                .unwrap_or(defaults.schedule.timezone),
        };

        let smtp_user = get("SMTP_USER");
        let email = EmailConfig {
            smtp_host: get("SMTP_HOST").unwrap_or(defaults.email.smtp_host),
            smtp_port: get("SMTP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.email.smtp_port),
            from: get("BACKUP_FROM_EMAIL").or_else(|| smtp_user.clone()),
            smtp_user,
            smtp_password: get("SMTP_PASS"),
            to: get("BACKUP_TO_EMAIL"),
            cc: list("BACKUP_CC_EMAIL"),
            bcc: list("BACKUP_BCC_EMAIL"),
            max_attachment_bytes: number("BACKUP_MAX_ATTACHMENT_MB")
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(defaults.email.max_attachment_bytes),
            notify_on_failure: get("BACKUP_NOTIFY_ON_FAILURE")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        };

        let s3 = S3Config {
            use_aws: get("BACKUP_USE_AWS")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            bucket: get("BACKUP_S3_BUCKET").unwrap_or_default(),
            region: get("AWS_REGION").unwrap_or(defaults.s3.region),
            prefix: get("BACKUP_S3_PREFIX").unwrap_or(defaults.s3.prefix),
            max_count: number("BACKUP_S3_MAX_COUNT").map(|v| v as usize),
            access_key_id: get("BACKUP_S3_ACCESS_KEY_ID"),
            secret_access_key: get("BACKUP_S3_SECRET_ACCESS_KEY"),
        };

        Self {
            database_path: get("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            backup_dir: get("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            retention_count: number("BACKUP_RETENTION_COUNT")
                .map(|v| v as usize)
                .unwrap_or(defaults.retention_count),
            file_prefix: get("BACKUP_FILE_PREFIX").unwrap_or(defaults.file_prefix),
            snapshot_mode,
            schedule,
            webhook: WebhookConfig {
                url: get("BACKUP_WEBHOOK_URL"),
                token: get("BACKUP_API_KEY"),
            },
            email,
            s3,
            remote_restore: RemoteRestoreConfig {
                url: get("REMOTE_BACKUP_URL"),
                token: get("REMOTE_BACKUP_TOKEN"),
            },
            network_timeout: number("BACKUP_NETWORK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.network_timeout),
            startup_snapshot_delay: number("BACKUP_STARTUP_SNAPSHOT_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_snapshot_delay),
            status_error_capacity: number("BACKUP_STATUS_ERROR_CAP")
                .map(|v| v as usize)
                .unwrap_or(defaults.status_error_capacity),
            run_log_path: get("LOG_FILE").map(PathBuf::from),
        }
    }

    /// Check if S3 is enabled and has a bucket to talk to
    pub fn should_use_aws(&self) -> bool {
        self.s3.use_aws && !self.s3.bucket.is_empty()
    }

    /// Ensure local backup directory exists
    pub async fn ensure_local_backup_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.backup_dir).await
    }
}
