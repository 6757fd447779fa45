//! Recurring trigger for the backup pipeline

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::database::backup::{BackupRequest, BackupSubsystem};
use crate::database::{BackupError, Result};

/// Cron schedule evaluated in a fixed timezone
#[derive(Debug, Clone)]
pub struct Scheduler {
    cron: Cron,
    timezone: Tz,
    expression: String,
}

impl Scheduler {
    pub fn new(expression: &str, timezone: &str) -> Result<Self> {
        let cron = Cron::new(expression).parse().map_err(|e| {
            BackupError::Config(format!("Invalid cron expression '{}': {}", expression, e))
        })?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|e| BackupError::Config(format!("Invalid timezone '{}': {}", timezone, e)))?;

        Ok(Self {
            cron,
            timezone,
            expression: expression.to_string(),
        })
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        Self::new(&config.cron, &config.timezone)
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        match self.cron.find_next_occurrence(&local, false) {
            Ok(next) => Some(next.with_timezone(&Utc)),
            Err(e) => {
                warn!("No next occurrence for '{}': {}", self.expression, e);
                None
            }
        }
    }

    /// Fire scheduled runs until `shutdown` flips or its sender is dropped
    pub fn spawn(
        self,
        subsystem: Arc<BackupSubsystem>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Backup schedule '{}' ({})", self.expression, self.timezone.name());

            loop {
                let Some(next) = self.next_after(Utc::now()) else {
                    subsystem.set_next_backup(None).await;
                    error!("Backup schedule has no further occurrences, scheduler stopped");
                    break;
                };
                subsystem.set_next_backup(Some(next)).await;
                info!("Next scheduled backup at {}", next.with_timezone(&self.timezone));

                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => {
                        info!("Backup scheduler stopping");
                        break;
                    }
                }

                match subsystem.run(BackupRequest::scheduled()).await {
                    Ok(run) => info!("Scheduled backup finished: {}", run.outcome),
                    Err(e) => warn!("Scheduled backup skipped: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::database::backup::test_support::local_subsystem;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_next_occurrence_in_timezone() {
        let scheduler = Scheduler::new("0 */4 * * *", "Asia/Hong_Kong").unwrap();

        // 08:30 in Hong Kong, next slot is 12:00 local
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 0, 30, 0).unwrap();
        assert_eq!(
            scheduler.next_after(after),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 4, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_occurrence_is_strictly_later() {
        let scheduler = Scheduler::new("30 2 * * *", "UTC").unwrap();

        let at_slot = Utc.with_ymd_and_hms(2025, 6, 1, 2, 30, 0).unwrap();
        assert_eq!(
            scheduler.next_after(at_slot),
            Some(Utc.with_ymd_and_hms(2025, 6, 2, 2, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_schedule_is_config_error() {
        assert!(matches!(
            Scheduler::new("every four hours", "UTC"),
            Err(BackupError::Config(_))
        ));
        assert!(matches!(
            Scheduler::new("0 */4 * * *", "Mars/Olympus_Mons"),
            Err(BackupError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_spawned_scheduler_publishes_next_run_and_stops() {
        let dir = tempdir().unwrap();
        let config = BackupConfig {
            database_path: dir.path().join("classroom.db"),
            backup_dir: dir.path().join("backups"),
            ..BackupConfig::default()
        };
        let subsystem = Arc::new(local_subsystem(config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Once a year, so no run fires during the test
        let handle = Scheduler::new("0 0 1 1 *", "UTC")
            .unwrap()
            .spawn(subsystem.clone(), shutdown_rx);

        let mut next = None;
        for _ in 0..50 {
            next = subsystem.status().await.next_backup_at;
            if next.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(next.unwrap() > Utc::now());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subsystem.status().await.total_backups, 0);
    }
}
