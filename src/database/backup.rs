//! Backup pipeline and operator entry points
//!
//! [`BackupSubsystem`] owns everything a backup run touches: the snapshot
//! directory, the delivery channels, the status registry and the run log. It
//! is constructed once at startup and shared behind an `Arc` with the
//! scheduler and the operator HTTP surface.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::BackupConfig;
use crate::database::delivery::{
    ChannelResult, ChannelSelection, DeliveryContext, DeliveryDispatcher, DeliveryError,
    DeliveryRequest, EmailChannel, EmailConfigSummary, ObjectStoreChannel, WebhookChannel,
};
use crate::database::integrity::IntegrityChecker;
use crate::database::restore::RestoreDecision;
use crate::database::snapshot::{Snapshot, SnapshotManager, replace_database_file};
use crate::database::status::{RunLog, StatusRegistry, StatusSnapshot};
use crate::database::storage::StorageProvider;
use crate::database::{BackupError, Result};
use crate::db::{DatabaseService, DbPool};

/// How a pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupOutcome {
    Success,
    IntegrityFailed,
    SnapshotFailed,
    PartialDeliveryFailure,
}

impl BackupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupOutcome::Success => "success",
            BackupOutcome::IntegrityFailed => "integrity-failed",
            BackupOutcome::SnapshotFailed => "snapshot-failed",
            BackupOutcome::PartialDeliveryFailure => "partial-delivery-failure",
        }
    }
}

impl fmt::Display for BackupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    /// Protective snapshot after a startup recovery
    Startup,
}

impl RunTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "Scheduled",
            RunTrigger::Manual => "Manual",
            RunTrigger::Startup => "Startup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRequest {
    pub trigger: RunTrigger,
    pub delivery: DeliveryRequest,
    /// Skip both integrity checks
    pub force: bool,
}

impl BackupRequest {
    pub fn scheduled() -> Self {
        Self {
            trigger: RunTrigger::Scheduled,
            delivery: DeliveryRequest::all_configured(),
            force: false,
        }
    }

    pub fn manual(include_email: bool, force: bool) -> Self {
        Self {
            trigger: RunTrigger::Manual,
            delivery: DeliveryRequest::manual(include_email),
            force,
        }
    }

    pub fn startup() -> Self {
        Self {
            trigger: RunTrigger::Startup,
            delivery: DeliveryRequest::local_only(),
            force: false,
        }
    }
}

/// One execution of the backup pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trigger: RunTrigger,
    pub outcome: BackupOutcome,
    pub snapshot: Option<Snapshot>,
    pub channel_results: Vec<ChannelResult>,
    pub error: Option<String>,
}

/// Result of an operator restore
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    pub restored_from: String,
    /// Copy of the database that was replaced, if there was one
    pub preserved_copy: Option<PathBuf>,
}

struct RunResult {
    outcome: BackupOutcome,
    snapshot: Option<Snapshot>,
    channel_results: Vec<ChannelResult>,
    error: Option<String>,
}

impl RunResult {
    fn failed(outcome: BackupOutcome, error: String) -> Self {
        Self {
            outcome,
            snapshot: None,
            channel_results: Vec::new(),
            error: Some(error),
        }
    }
}

pub struct BackupSubsystem {
    config: BackupConfig,
    database: Arc<dyn DatabaseService>,
    checker: IntegrityChecker,
    snapshots: SnapshotManager,
    dispatcher: DeliveryDispatcher,
    status: StatusRegistry,
    run_log: RunLog,
    /// Application pool on the live file, closed before an operator restore
    live_pool: Option<DbPool>,
    /// Held for the whole pipeline run; a second trigger is rejected
    run_lock: Mutex<()>,
}

impl BackupSubsystem {
    pub fn new(
        config: BackupConfig,
        database: Arc<dyn DatabaseService>,
        dispatcher: DeliveryDispatcher,
    ) -> Self {
        Self {
            checker: IntegrityChecker::new(),
            snapshots: SnapshotManager::new(&config),
            status: StatusRegistry::new(config.status_error_capacity),
            run_log: RunLog::new(config.run_log_path.clone()),
            live_pool: None,
            run_lock: Mutex::new(()),
            config,
            database,
            dispatcher,
        }
    }

    pub fn with_live_pool(mut self, pool: DbPool) -> Self {
        self.live_pool = Some(pool);
        self
    }

    /// Build the subsystem with real webhook and SMTP channels
    pub fn from_config(
        config: BackupConfig,
        database: Arc<dyn DatabaseService>,
        object_store: Option<Arc<dyn StorageProvider>>,
    ) -> Result<Self> {
        let dispatcher = DeliveryDispatcher::new(
            WebhookChannel::new(&config.webhook, config.network_timeout)?,
            EmailChannel::from_config(&config.email, config.network_timeout)?,
            ObjectStoreChannel::new(object_store, config.s3.max_count),
            config.network_timeout,
        );
        Ok(Self::new(config, database, dispatcher))
    }

    /// Run the pipeline once: check, snapshot, verify, rotate, deliver
    ///
    /// Returns `AlreadyRunning` if another run holds the lock; every other
    /// failure is reported through the returned [`BackupRun`].
    pub async fn run(&self, request: BackupRequest) -> Result<BackupRun> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Backup already in progress, rejecting {:?} trigger", request.trigger);
            return Err(BackupError::AlreadyRunning);
        };

        self.status.begin_run().await;
        let started_at = Utc::now();
        info!("Starting {} backup", request.trigger.label().to_lowercase());

        let result = self.execute(&request).await;
        let run = BackupRun {
            started_at,
            finished_at: Utc::now(),
            trigger: request.trigger,
            outcome: result.outcome,
            snapshot: result.snapshot,
            channel_results: result.channel_results,
            error: result.error,
        };

        self.status.complete_run(&run).await;
        self.log_run(&run).await;
        if run.trigger == RunTrigger::Scheduled && run.outcome != BackupOutcome::Success {
            self.send_failure_notice(&run).await;
        }
        Ok(run)
    }

    /// Scheduled runs have no caller to report to, so failures go out by email
    async fn send_failure_notice(&self, run: &BackupRun) {
        let notice = self.dispatcher.email().notify_failure(run);
        match tokio::time::timeout(self.config.network_timeout, notice).await {
            Ok(Ok(true)) => {
                self.run_log
                    .append("INFO", &format!("Failure notice sent for {} run", run.outcome))
                    .await
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!("Failed to send backup failure notice: {}", e),
            Err(_) => warn!(
                "Backup failure notice timed out after {:?}",
                self.config.network_timeout
            ),
        }
    }

    async fn execute(&self, request: &BackupRequest) -> RunResult {
        let source = self.database.path();

        if !request.force && !self.checker.is_valid(source).await {
            return RunResult::failed(
                BackupOutcome::IntegrityFailed,
                format!("Database {} failed the integrity check", source.display()),
            );
        }

        let snapshot = match self.snapshots.create_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => return RunResult::failed(BackupOutcome::SnapshotFailed, e.to_string()),
        };

        if !request.force && !self.checker.is_valid(&snapshot.path).await {
            if let Err(e) = self.snapshots.delete_snapshot(&snapshot).await {
                warn!("Failed to delete invalid snapshot {}: {}", snapshot.file_name, e);
            }
            return RunResult::failed(
                BackupOutcome::SnapshotFailed,
                format!("Snapshot {} failed the integrity check", snapshot.file_name),
            );
        }

        match self.snapshots.rotate(self.config.retention_count.max(1)).await {
            Ok(report) if !report.failed.is_empty() => {
                warn!("Rotation could not delete {} snapshot(s)", report.failed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Snapshot rotation failed: {}", e),
        }

        let stats = if request.delivery.email == ChannelSelection::Off {
            None
        } else {
            self.database.system_stats().await
        };
        let context = DeliveryContext {
            backup_type: request.trigger.label().to_string(),
            stats,
        };

        let report = self
            .dispatcher
            .deliver(&snapshot, request.delivery, &context)
            .await;

        let (outcome, error) = if report.has_failures() {
            let failures: Vec<String> = report
                .failures()
                .filter_map(|r| r.error().map(|e| format!("{:?}: {}", r.channel, e)))
                .collect();
            (BackupOutcome::PartialDeliveryFailure, Some(failures.join("; ")))
        } else {
            (BackupOutcome::Success, None)
        };

        RunResult {
            outcome,
            snapshot: Some(snapshot),
            channel_results: report.results,
            error,
        }
    }

    async fn log_run(&self, run: &BackupRun) {
        let name = run
            .snapshot
            .as_ref()
            .map(|s| s.file_name.as_str())
            .unwrap_or("-");

        match &run.error {
            None => {
                info!("{} backup finished: {}", run.trigger.label(), name);
                self.run_log
                    .append("INFO", &format!("{} backup {}: {}", run.trigger.label(), run.outcome, name))
                    .await;
            }
            Some(message) => {
                error!("{} backup finished with {}: {}", run.trigger.label(), run.outcome, message);
                self.run_log
                    .append(
                        "ERROR",
                        &format!("{} backup {}: {} ({})", run.trigger.label(), run.outcome, name, message),
                    )
                    .await;
            }
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.status.snapshot().await
    }

    pub async fn set_next_backup(&self, next: Option<DateTime<Utc>>) {
        self.status.set_next_backup(next).await;
    }

    /// Record a failure that happened outside a pipeline run
    pub async fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.run_log.append("ERROR", &message).await;
        self.status.record_error(message).await;
    }

    pub async fn record_restore(&self, decision: RestoreDecision) {
        self.run_log
            .append("INFO", &format!("Startup restore decision: {:?}", decision))
            .await;
        self.status.record_restore(decision).await;
    }

    /// Local snapshots, newest first
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.snapshots.list_snapshots().await
    }

    /// Replace the live database with a named snapshot
    ///
    /// The current file is kept as `<db>.original_<unix-millis>`. The live
    /// pool is closed first, so nothing reaches the replaced file; the process
    /// has to restart before the database can be used again.
    pub async fn restore_from(&self, file_name: &str) -> Result<RestoreReport> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Backup in progress, rejecting restore of {}", file_name);
            return Err(BackupError::AlreadyRunning);
        };

        let snapshot = self.snapshots.resolve(file_name).await?;
        if !self.checker.is_valid(&snapshot.path).await {
            return Err(BackupError::InvalidSnapshot(format!(
                "{} failed the integrity check",
                file_name
            )));
        }

        if let Some(pool) = &self.live_pool {
            info!("Closing database pool before restore");
            pool.close().await;
        }

        let target = self.database.path();
        let preserved_copy = if tokio_fs::try_exists(target).await.unwrap_or(false) {
            let mut preserved = target.as_os_str().to_owned();
            preserved.push(format!(".original_{}", Utc::now().timestamp_millis()));
            let preserved = PathBuf::from(preserved);
            tokio_fs::copy(target, &preserved).await?;
            Some(preserved)
        } else {
            None
        };

        replace_database_file(&snapshot.path, target).await?;

        info!("Database restored from {}", file_name);
        self.run_log
            .append("INFO", &format!("Database restored from {}", file_name))
            .await;

        Ok(RestoreReport {
            restored_from: snapshot.file_name,
            preserved_copy,
        })
    }

    pub async fn recent_log_lines(&self, count: usize) -> Result<Vec<String>> {
        self.run_log.tail(count).await
    }

    pub async fn test_email_connection(&self) -> std::result::Result<bool, DeliveryError> {
        self.dispatcher.email().test_connection().await
    }

    pub fn email_config_summary(&self) -> EmailConfigSummary {
        self.dispatcher.email().config_summary()
    }

    /// Capture a just-recovered database shortly after startup
    pub fn schedule_protective_snapshot(
        self: &Arc<Self>,
        decision: &RestoreDecision,
    ) -> Option<JoinHandle<()>> {
        if !decision.needs_protective_snapshot() {
            return None;
        }

        let subsystem = Arc::clone(self);
        let delay = self.config.startup_snapshot_delay;
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match subsystem.run(BackupRequest::startup()).await {
                Ok(run) => info!("Protective snapshot finished: {}", run.outcome),
                Err(e) => warn!("Protective snapshot skipped: {}", e),
            }
        }))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use super::BackupSubsystem;
    use crate::config::{BackupConfig, WebhookConfig};
    use crate::database::delivery::email::MockMailTransport;
    use crate::database::delivery::{
        DeliveryDispatcher, EmailChannel, ObjectStoreChannel, WebhookChannel,
    };
    use crate::db::SqliteDatabase;

    /// Subsystem whose channels are all unconfigured
    pub fn local_subsystem(config: BackupConfig) -> BackupSubsystem {
        let mut transport = MockMailTransport::new();
        transport.expect_send().times(0);

        let dispatcher = DeliveryDispatcher::new(
            WebhookChannel::new(&WebhookConfig::default(), Duration::from_secs(1)).unwrap(),
            EmailChannel::new(
                crate::config::EmailConfig {
                    to: None,
                    ..config.email.clone()
                },
                Arc::new(transport),
            ),
            ObjectStoreChannel::disabled(),
            Duration::from_secs(1),
        );
        let database = Arc::new(SqliteDatabase::new(&config.database_path));
        BackupSubsystem::new(config, database, dispatcher)
    }
}
