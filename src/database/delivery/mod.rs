//! Off-box delivery of snapshots
//!
//! Every channel is independent: each one is selected per run, runs under its
//! own timeout and reports its own outcome. A failing channel never affects
//! its siblings or the local snapshot.

use std::future::Future;
use std::time::Duration;

use futures::future::join3;
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use tracing::{info, warn};

use crate::database::snapshot::Snapshot;
use crate::db::SystemStats;

pub mod email;
pub mod object_store;
pub mod webhook;

pub use email::{EmailChannel, EmailConfigSummary};
pub use object_store::ObjectStoreChannel;
pub use webhook::WebhookChannel;

/// An off-box destination for snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Webhook,
    Email,
    ObjectStore,
}

/// Whether a channel takes part in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelSelection {
    #[default]
    Off,
    /// Deliver when configured, skip silently otherwise
    IfConfigured,
    /// The caller explicitly asked for this channel
    Required,
}

/// Channel selection for one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryRequest {
    pub webhook: ChannelSelection,
    pub email: ChannelSelection,
    pub object_store: ChannelSelection,
}

impl DeliveryRequest {
    /// Keep the snapshot on local disk only
    pub fn local_only() -> Self {
        Self::default()
    }

    /// Every channel that has configuration
    pub fn all_configured() -> Self {
        Self {
            webhook: ChannelSelection::IfConfigured,
            email: ChannelSelection::IfConfigured,
            object_store: ChannelSelection::IfConfigured,
        }
    }

    /// Operator-triggered run; email only goes out when asked for
    pub fn manual(include_email: bool) -> Self {
        Self {
            webhook: ChannelSelection::IfConfigured,
            email: if include_email {
                ChannelSelection::Required
            } else {
                ChannelSelection::Off
            },
            object_store: ChannelSelection::IfConfigured,
        }
    }
}

/// Why a single channel failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Snapshot is {size} bytes, larger than the {max} byte attachment limit")]
    AttachmentTooLarge { size: u64, max: u64 },

    #[error("Email delivery was requested but no recipient is configured")]
    NoRecipientConfigured,

    #[error("Remote endpoint returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// What happened to one channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    NotRequested,
    Skipped { reason: String },
    Succeeded { detail: String },
    Failed(DeliveryError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResult {
    pub channel: Channel,
    pub requested: bool,
    pub outcome: ChannelOutcome,
}

impl ChannelResult {
    /// The channel actually tried to deliver (it was neither off nor skipped)
    pub fn attempted(&self) -> bool {
        matches!(
            self.outcome,
            ChannelOutcome::Succeeded { .. } | ChannelOutcome::Failed(_)
        )
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ChannelOutcome::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        match &self.outcome {
            ChannelOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl Serialize for ChannelResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (status, message) = match &self.outcome {
            ChannelOutcome::NotRequested => ("not_requested", None),
            ChannelOutcome::Skipped { reason } => ("skipped", Some(reason.clone())),
            ChannelOutcome::Succeeded { detail } => ("succeeded", Some(detail.clone())),
            ChannelOutcome::Failed(e) => ("failed", Some(e.to_string())),
        };

        let mut state = serializer.serialize_struct("ChannelResult", 6)?;
        state.serialize_field("channel", &self.channel)?;
        state.serialize_field("requested", &self.requested)?;
        state.serialize_field("attempted", &self.attempted())?;
        state.serialize_field("succeeded", &self.succeeded())?;
        state.serialize_field("status", status)?;
        state.serialize_field("message", &message)?;
        state.end()
    }
}

/// Per-channel results of one delivery
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub results: Vec<ChannelResult>,
}

impl DeliveryReport {
    pub fn failures(&self) -> impl Iterator<Item = &ChannelResult> {
        self.results.iter().filter(|r| r.error().is_some())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Extra information shown alongside a delivered snapshot
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    /// Human readable run type, e.g. "Scheduled"
    pub backup_type: String,
    pub stats: Option<SystemStats>,
}

/// Fans a snapshot out to every selected channel
pub struct DeliveryDispatcher {
    webhook: WebhookChannel,
    email: EmailChannel,
    object_store: ObjectStoreChannel,
    timeout: Duration,
}

impl DeliveryDispatcher {
    pub fn new(
        webhook: WebhookChannel,
        email: EmailChannel,
        object_store: ObjectStoreChannel,
        timeout: Duration,
    ) -> Self {
        info!(
            "Delivery channels configured: webhook={}, email={}, object_store={}",
            webhook.is_configured(),
            email.is_configured(),
            object_store.is_configured()
        );
        Self {
            webhook,
            email,
            object_store,
            timeout,
        }
    }

    pub fn email(&self) -> &EmailChannel {
        &self.email
    }

    pub async fn deliver(
        &self,
        snapshot: &Snapshot,
        request: DeliveryRequest,
        context: &DeliveryContext,
    ) -> DeliveryReport {
        let (webhook, email, object_store) = join3(
            self.run_channel(
                Channel::Webhook,
                request.webhook,
                self.webhook.deliver(snapshot),
            ),
            self.run_channel(
                Channel::Email,
                request.email,
                self.email.deliver(snapshot, request.email, context),
            ),
            self.run_channel(
                Channel::ObjectStore,
                request.object_store,
                self.object_store.deliver(snapshot),
            ),
        )
        .await;

        DeliveryReport {
            results: vec![webhook, email, object_store],
        }
    }

    async fn run_channel<F>(
        &self,
        channel: Channel,
        selection: ChannelSelection,
        delivery: F,
    ) -> ChannelResult
    where
        F: Future<Output = ChannelOutcome>,
    {
        if selection == ChannelSelection::Off {
            return ChannelResult {
                channel,
                requested: false,
                outcome: ChannelOutcome::NotRequested,
            };
        }

        let outcome = match tokio::time::timeout(self.timeout, delivery).await {
            Ok(outcome) => outcome,
            Err(_) => ChannelOutcome::Failed(DeliveryError::Timeout(self.timeout)),
        };

        match &outcome {
            ChannelOutcome::Succeeded { detail } => info!("{:?} delivery succeeded: {}", channel, detail),
            ChannelOutcome::Skipped { reason } => info!("{:?} delivery skipped: {}", channel, reason),
            ChannelOutcome::Failed(e) => warn!("{:?} delivery failed: {}", channel, e),
            ChannelOutcome::NotRequested => {}
        }

        ChannelResult {
            channel,
            requested: true,
            outcome,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use chrono::Utc;

    use crate::database::snapshot::Snapshot;

    /// Write `size` bytes and describe them as a snapshot
    pub fn snapshot_of_size(dir: &Path, size: usize) -> Snapshot {
        let file_name = "classroom_backup_2025-06-01_14-30-00-000Z.db".to_string();
        let path = dir.join(&file_name);
        std::fs::write(&path, vec![7u8; size]).unwrap();
        Snapshot {
            path,
            file_name,
            created_at: Utc::now(),
            size_bytes: size as u64,
        }
    }
}
