//! Snapshot delivery as an SMTP attachment

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MessageBuilder, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{debug, info};

use super::{ChannelOutcome, ChannelSelection, DeliveryContext, DeliveryError};
use crate::config::EmailConfig;
use crate::database::backup::BackupRun;
use crate::database::snapshot::Snapshot;
use crate::database::{BackupError, Result};

const ATTACHMENT_CONTENT_TYPE: &str = "application/x-sqlite3";
const SENDER_NAME: &str = "Classroom Backup";

/// Sends fully built messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: Message) -> std::result::Result<(), DeliveryError>;

    /// Open a session and authenticate without sending anything
    async fn test_connection(&self) -> std::result::Result<bool, DeliveryError>;
}

/// SMTP transport; port 465 uses implicit TLS, every other port STARTTLS
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self> {
        let credentials = match (&config.smtp_user, &config.smtp_password) {
            (Some(user), Some(password)) => Some(Credentials::new(user.clone(), password.clone())),
            _ => None,
        };

        let builder = match credentials {
            // No authentication (local relays and test servers)
            None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host),
            Some(credentials) => {
                let builder = if config.smtp_port == 465 {
                    AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                } else {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                }
                .map_err(|e| BackupError::Config(format!("SMTP relay error: {}", e)))?;
                builder.credentials(credentials)
            }
        };

        let transport = builder
            .port(config.smtp_port)
            .timeout(Some(timeout))
            .build();

        Ok(Self { transport })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, message: Message) -> std::result::Result<(), DeliveryError> {
        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| DeliveryError::Transport(format!("Failed to send email: {}", e)))
    }

    async fn test_connection(&self) -> std::result::Result<bool, DeliveryError> {
        self.transport
            .test_connection()
            .await
            .map_err(|e| DeliveryError::Transport(format!("SMTP connection failed: {}", e)))
    }
}

/// Email settings as shown to operators, with secrets removed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailConfigSummary {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub password_configured: bool,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub max_attachment_bytes: u64,
    pub recipient_configured: bool,
}

pub struct EmailChannel {
    config: EmailConfig,
    transport: Arc<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, transport: Arc<dyn MailTransport>) -> Self {
        Self { config, transport }
    }

    /// Channel backed by a real SMTP connection
    pub fn from_config(config: &EmailConfig, timeout: Duration) -> Result<Self> {
        let transport = SmtpMailTransport::new(config, timeout)?;
        Ok(Self::new(config.clone(), Arc::new(transport)))
    }

    pub fn is_configured(&self) -> bool {
        self.config.to.is_some()
    }

    /// A missing recipient is a skip unless the caller asked for email
    pub async fn deliver(
        &self,
        snapshot: &Snapshot,
        selection: ChannelSelection,
        context: &DeliveryContext,
    ) -> ChannelOutcome {
        if !self.is_configured() {
            return match selection {
                ChannelSelection::Required => {
                    ChannelOutcome::Failed(DeliveryError::NoRecipientConfigured)
                }
                _ => ChannelOutcome::Skipped {
                    reason: "no email recipient configured".to_string(),
                },
            };
        }

        match self.send_snapshot(snapshot, context).await {
            Ok(detail) => ChannelOutcome::Succeeded { detail },
            Err(e) => ChannelOutcome::Failed(e),
        }
    }

    async fn send_snapshot(
        &self,
        snapshot: &Snapshot,
        context: &DeliveryContext,
    ) -> std::result::Result<String, DeliveryError> {
        let max = self.config.max_attachment_bytes;
        if snapshot.size_bytes > max {
            return Err(DeliveryError::AttachmentTooLarge {
                size: snapshot.size_bytes,
                max,
            });
        }

        let content = tokio_fs::read(&snapshot.path)
            .await
            .map_err(|e| DeliveryError::Io(e.to_string()))?;
        let message = build_backup_message(&self.config, snapshot, content, context)?;

        debug!("Sending {} by email", snapshot.file_name);
        self.transport.send(message).await?;

        let to = self.config.to.as_deref().unwrap_or_default();
        info!("Backup email sent to {}", to);
        Ok(format!("sent to {}", to))
    }

    /// Tell the recipient that a run did not succeed
    ///
    /// Returns `false` when notices are disabled or no recipient is set.
    pub async fn notify_failure(&self, run: &BackupRun) -> std::result::Result<bool, DeliveryError> {
        if !self.config.notify_on_failure || !self.is_configured() {
            return Ok(false);
        }

        let message = build_failure_notice(&self.config, run)?;
        self.transport.send(message).await?;
        info!("Backup failure notice sent for {} run", run.trigger.label().to_lowercase());
        Ok(true)
    }

    pub async fn test_connection(&self) -> std::result::Result<bool, DeliveryError> {
        self.transport.test_connection().await
    }

    pub fn config_summary(&self) -> EmailConfigSummary {
        EmailConfigSummary {
            smtp_host: self.config.smtp_host.clone(),
            smtp_port: self.config.smtp_port,
            smtp_user: self.config.smtp_user.as_deref().map(mask),
            password_configured: self.config.smtp_password.is_some(),
            from: self.config.from.clone(),
            to: self.config.to.clone(),
            cc: self.config.cc.clone(),
            bcc: self.config.bcc.clone(),
            max_attachment_bytes: self.config.max_attachment_bytes,
            recipient_configured: self.is_configured(),
        }
    }
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().take(3).collect();
    format!("{}***", visible)
}

fn mailbox(address: &str) -> std::result::Result<Mailbox, DeliveryError> {
    address
        .trim()
        .parse()
        .map_err(|e| DeliveryError::InvalidMessage(format!("Invalid address {}: {}", address, e)))
}

/// Sender, recipients and subject shared by every outgoing message
fn addressed(
    config: &EmailConfig,
    subject: String,
) -> std::result::Result<MessageBuilder, DeliveryError> {
    let to = config.to.as_deref().ok_or(DeliveryError::NoRecipientConfigured)?;
    let from = config
        .from
        .as_deref()
        .or(config.smtp_user.as_deref())
        .ok_or_else(|| DeliveryError::InvalidMessage("No sender address configured".to_string()))?;

    let sender = mailbox(from)?;
    let mut builder = Message::builder()
        .from(Mailbox::new(Some(SENDER_NAME.to_string()), sender.email))
        .to(mailbox(to)?)
        .subject(subject);
    for cc in &config.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in &config.bcc {
        builder = builder.bcc(mailbox(bcc)?);
    }
    Ok(builder)
}

/// Build the backup email: an HTML summary plus the snapshot as attachment
pub fn build_backup_message(
    config: &EmailConfig,
    snapshot: &Snapshot,
    content: Vec<u8>,
    context: &DeliveryContext,
) -> std::result::Result<Message, DeliveryError> {
    let builder = addressed(
        config,
        format!(
            "Classroom database backup {}",
            snapshot.created_at.format("%Y-%m-%d %H:%M")
        ),
    )?;

    let content_type = ContentType::parse(ATTACHMENT_CONTENT_TYPE)
        .map_err(|e| DeliveryError::InvalidMessage(e.to_string()))?;
    let attachment = Attachment::new(snapshot.file_name.clone()).body(content, content_type);

    builder
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::html(render_summary(snapshot, context)))
                .singlepart(attachment),
        )
        .map_err(|e| DeliveryError::InvalidMessage(format!("Failed to build email: {}", e)))
}

/// Build the notice for a failed run; no attachment
pub fn build_failure_notice(
    config: &EmailConfig,
    run: &BackupRun,
) -> std::result::Result<Message, DeliveryError> {
    let subject = format!(
        "Classroom backup failed ({}) {}",
        run.outcome,
        run.started_at.format("%Y-%m-%d %H:%M")
    );
    addressed(config, subject)?
        .singlepart(SinglePart::html(render_failure_notice(run)))
        .map_err(|e| DeliveryError::InvalidMessage(format!("Failed to build email: {}", e)))
}

fn render_failure_notice(run: &BackupRun) -> String {
    let error = run.error.as_deref().unwrap_or("no error detail recorded");

    format!(
        "<html><body>\
         <h2>Classroom database backup failed</h2>\
         <table>\
         <tr><th align=\"left\">Backup type</th><td>{}</td></tr>\
         <tr><th align=\"left\">Started</th><td>{}</td></tr>\
         <tr><th align=\"left\">Outcome</th><td>{}</td></tr>\
         </table>\
         <p>Error:</p><pre>{}</pre>\
         <p>Check the service and run a manual backup.</p>\
         </body></html>",
        run.trigger.label(),
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        run.outcome,
        escape_html(error)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_summary(snapshot: &Snapshot, context: &DeliveryContext) -> String {
    let backup_type = if context.backup_type.is_empty() {
        "Manual"
    } else {
        context.backup_type.as_str()
    };

    let mut rows = vec![
        ("File", snapshot.file_name.clone()),
        ("Size", format!("{:.2} KB", snapshot.size_bytes as f64 / 1024.0)),
        (
            "Created",
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("Backup type", backup_type.to_string()),
    ];

    if let Some(stats) = &context.stats {
        if let Some(students) = stats.total_students {
            rows.push(("Students", students.to_string()));
        }
        if let Some(logs) = stats.total_point_logs {
            rows.push(("Point records", logs.to_string()));
        }
        if let Some(days) = stats.running_days {
            rows.push(("Days in use", days.to_string()));
        }
    }

    let table: String = rows
        .iter()
        .map(|(label, value)| format!("<tr><th align=\"left\">{}</th><td>{}</td></tr>", label, value))
        .collect();

    format!(
        "<html><body>\
         <h2>Classroom database backup</h2>\
         <table>{}</table>\
         <p>The database file is attached. Keep it somewhere safe; it can be restored from the backup directory.</p>\
         </body></html>",
        table
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::backup::{BackupOutcome, RunTrigger};
    use crate::database::delivery::test_support::snapshot_of_size;
    use crate::db::SystemStats;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn config() -> EmailConfig {
        EmailConfig {
            smtp_user: Some("backup.sender@school.example".to_string()),
            smtp_password: Some("app-password".to_string()),
            to: Some("teacher@school.example".to_string()),
            cc: vec!["office@school.example".to_string()],
            bcc: vec!["archive@school.example".to_string()],
            ..EmailConfig::default()
        }
    }

    fn context() -> DeliveryContext {
        DeliveryContext {
            backup_type: "Scheduled".to_string(),
            stats: Some(SystemStats {
                total_students: Some(28),
                total_point_logs: Some(412),
                running_days: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_send_builds_message_for_all_recipients() {
        let temp_dir = tempdir().unwrap();
        let snapshot = snapshot_of_size(temp_dir.path(), 512);
        let sent: Arc<Mutex<Vec<Message>>> = Arc::default();

        let mut transport = MockMailTransport::new();
        let captured = sent.clone();
        transport.expect_send().times(1).returning(move |message| {
            captured.lock().unwrap().push(message);
            Ok(())
        });

        let channel = EmailChannel::new(config(), Arc::new(transport));
        let outcome = channel
            .deliver(&snapshot, ChannelSelection::IfConfigured, &context())
            .await;

        assert!(matches!(outcome, ChannelOutcome::Succeeded { .. }));
        let sent = sent.lock().unwrap();
        let recipients: Vec<String> = sent[0]
            .envelope()
            .to()
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert!(recipients.contains(&"teacher@school.example".to_string()));
        assert!(recipients.contains(&"office@school.example".to_string()));
        assert!(recipients.contains(&"archive@school.example".to_string()));
        assert_eq!(
            sent[0].envelope().from().map(|a| a.to_string()),
            Some("backup.sender@school.example".to_string())
        );
    }

    #[tokio::test]
    async fn test_oversized_snapshot_is_never_sent() {
        let temp_dir = tempdir().unwrap();
        let snapshot = snapshot_of_size(temp_dir.path(), 2048);

        let mut transport = MockMailTransport::new();
        transport.expect_send().times(0);

        let channel = EmailChannel::new(
            EmailConfig {
                max_attachment_bytes: 2047,
                ..config()
            },
            Arc::new(transport),
        );
        let outcome = channel
            .deliver(&snapshot, ChannelSelection::Required, &context())
            .await;

        assert_eq!(
            outcome,
            ChannelOutcome::Failed(DeliveryError::AttachmentTooLarge {
                size: 2048,
                max: 2047
            })
        );
    }

    #[tokio::test]
    async fn test_missing_recipient_depends_on_selection() {
        let temp_dir = tempdir().unwrap();
        let snapshot = snapshot_of_size(temp_dir.path(), 16);

        let mut transport = MockMailTransport::new();
        transport.expect_send().times(0);

        let channel = EmailChannel::new(
            EmailConfig {
                to: None,
                ..config()
            },
            Arc::new(transport),
        );

        let skipped = channel
            .deliver(&snapshot, ChannelSelection::IfConfigured, &context())
            .await;
        assert!(matches!(skipped, ChannelOutcome::Skipped { .. }));

        let failed = channel
            .deliver(&snapshot, ChannelSelection::Required, &context())
            .await;
        assert_eq!(failed, ChannelOutcome::Failed(DeliveryError::NoRecipientConfigured));
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let temp_dir = tempdir().unwrap();
        let snapshot = snapshot_of_size(temp_dir.path(), 16);

        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .returning(|_| Err(DeliveryError::Transport("535 authentication failed".to_string())));

        let channel = EmailChannel::new(config(), Arc::new(transport));
        let outcome = channel
            .deliver(&snapshot, ChannelSelection::IfConfigured, &context())
            .await;

        assert!(matches!(outcome, ChannelOutcome::Failed(DeliveryError::Transport(_))));
    }

    #[test]
    fn test_summary_lists_file_and_stats() {
        let temp_dir = tempdir().unwrap();
        let snapshot = snapshot_of_size(temp_dir.path(), 1536);

        let html = render_summary(&snapshot, &context());

        assert!(html.contains(&snapshot.file_name));
        assert!(html.contains("1.50 KB"));
        assert!(html.contains("Scheduled"));
        assert!(html.contains("412"));
        assert!(!html.contains("Days in use"));
    }

    #[test]
    fn test_invalid_recipient_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let snapshot = snapshot_of_size(temp_dir.path(), 16);
        let config = EmailConfig {
            to: Some("not an address".to_string()),
            ..config()
        };

        let result = build_backup_message(&config, &snapshot, vec![0u8; 16], &context());

        assert!(matches!(result, Err(DeliveryError::InvalidMessage(_))));
    }

    fn failed_run() -> BackupRun {
        let started_at = Utc.with_ymd_and_hms(2025, 6, 1, 4, 0, 0).unwrap();
        BackupRun {
            started_at,
            finished_at: started_at,
            trigger: RunTrigger::Scheduled,
            outcome: BackupOutcome::IntegrityFailed,
            snapshot: None,
            channel_results: Vec::new(),
            error: Some("Database classroom.db failed the integrity check <page 3>".to_string()),
        }
    }

    #[tokio::test]
    async fn test_failure_notice_carries_outcome_and_error() {
        let sent: Arc<Mutex<Vec<Message>>> = Arc::default();
        let mut transport = MockMailTransport::new();
        let captured = sent.clone();
        transport.expect_send().times(1).returning(move |message| {
            captured.lock().unwrap().push(message);
            Ok(())
        });
        let channel = EmailChannel::new(config(), Arc::new(transport));

        assert_eq!(channel.notify_failure(&failed_run()).await, Ok(true));

        let sent = sent.lock().unwrap();
        assert_eq!(
            sent[0].headers().get_raw("Subject"),
            Some("Classroom backup failed (integrity-failed) 2025-06-01 04:00")
        );
        let body = render_failure_notice(&failed_run());
        assert!(body.contains("Scheduled"));
        assert!(body.contains("failed the integrity check &lt;page 3&gt;"));
    }

    #[tokio::test]
    async fn test_failure_notice_needs_recipient_and_flag() {
        let mut transport = MockMailTransport::new();
        transport.expect_send().times(0);
        let transport = Arc::new(transport);

        let no_recipient = EmailChannel::new(
            EmailConfig {
                to: None,
                ..config()
            },
            transport.clone(),
        );
        assert_eq!(no_recipient.notify_failure(&failed_run()).await, Ok(false));

        let disabled = EmailChannel::new(
            EmailConfig {
                notify_on_failure: false,
                ..config()
            },
            transport,
        );
        assert_eq!(disabled.notify_failure(&failed_run()).await, Ok(false));
    }

    #[tokio::test]
    async fn test_config_summary_hides_secrets() {
        let mut transport = MockMailTransport::new();
        transport.expect_test_connection().returning(|| Ok(true));
        let channel = EmailChannel::new(config(), Arc::new(transport));

        let summary = channel.config_summary();
        assert_eq!(summary.smtp_user.as_deref(), Some("bac***"));
        assert!(summary.password_configured);
        assert!(summary.recipient_configured);
        assert!(!serde_json::to_string(&summary).unwrap().contains("app-password"));

        assert_eq!(channel.test_connection().await, Ok(true));
    }
}
