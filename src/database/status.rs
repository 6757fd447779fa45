//! In-memory run status and the optional append-only run log

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::database::Result;
use crate::database::backup::{BackupOutcome, BackupRun};
use crate::database::restore::RestoreDecision;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Read-only copy of the registry handed to operators
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub last_backup_at: Option<DateTime<Utc>>,
    pub next_backup_at: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub total_backups: u64,
    /// Oldest first
    pub errors: Vec<ErrorEntry>,
    pub last_run: Option<BackupRun>,
    pub restore_decision: Option<RestoreDecision>,
}

#[derive(Debug, Default)]
struct StatusState {
    last_backup_at: Option<DateTime<Utc>>,
    next_backup_at: Option<DateTime<Utc>>,
    is_running: bool,
    total_backups: u64,
    errors: VecDeque<ErrorEntry>,
    last_run: Option<BackupRun>,
    restore_decision: Option<RestoreDecision>,
}

/// Process-lifetime record of backup activity; never persisted
#[derive(Debug)]
pub struct StatusRegistry {
    state: Mutex<StatusState>,
    error_capacity: usize,
}

impl StatusRegistry {
    pub fn new(error_capacity: usize) -> Self {
        Self {
            state: Mutex::new(StatusState::default()),
            error_capacity: error_capacity.max(1),
        }
    }

    pub async fn begin_run(&self) {
        self.state.lock().await.is_running = true;
    }

    /// Fold a finished run into the counters
    pub async fn complete_run(&self, run: &BackupRun) {
        let mut state = self.state.lock().await;
        state.is_running = false;
        state.last_backup_at = Some(run.started_at);

        if run.outcome == BackupOutcome::Success {
            state.total_backups += 1;
        } else {
            let message = run
                .error
                .clone()
                .unwrap_or_else(|| format!("Backup finished with outcome {}", run.outcome));
            push_bounded(&mut state.errors, self.error_capacity, ErrorEntry {
                at: run.finished_at,
                message,
            });
        }

        state.last_run = Some(run.clone());
    }

    /// Record a failure that happened outside a pipeline run
    pub async fn record_error(&self, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        push_bounded(&mut state.errors, self.error_capacity, ErrorEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub async fn set_next_backup(&self, next: Option<DateTime<Utc>>) {
        self.state.lock().await.next_backup_at = next;
    }

    pub async fn record_restore(&self, decision: RestoreDecision) {
        self.state.lock().await.restore_decision = Some(decision);
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        StatusSnapshot {
            last_backup_at: state.last_backup_at,
            next_backup_at: state.next_backup_at,
            is_running: state.is_running,
            total_backups: state.total_backups,
            errors: state.errors.iter().cloned().collect(),
            last_run: state.last_run.clone(),
            restore_decision: state.restore_decision.clone(),
        }
    }
}

fn push_bounded(errors: &mut VecDeque<ErrorEntry>, capacity: usize, entry: ErrorEntry) {
    while errors.len() >= capacity {
        errors.pop_front();
    }
    errors.push_back(entry);
}

/// Append-only text log, one line per event
#[derive(Debug, Clone)]
pub struct RunLog {
    path: Option<PathBuf>,
}

impl RunLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Failures to write are logged and otherwise ignored
    pub async fn append(&self, level: &str, message: &str) {
        let Some(path) = &self.path else {
            return;
        };

        let line = format!(
            "[{}] [{}] {}\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level,
            message
        );
        if let Err(e) = Self::write_line(path, &line).await {
            warn!("Failed to write run log {}: {}", path.display(), e);
        }
    }

    async fn write_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio_fs::create_dir_all(parent).await?;
        }
        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// The last `count` lines, oldest first
    pub async fn tail(&self, count: usize) -> Result<Vec<String>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };

        let content = match tokio_fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(count);
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }
}
