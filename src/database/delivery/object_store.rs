//! Upload of snapshots to remote object storage

use std::sync::Arc;

use tracing::warn;

use super::{ChannelOutcome, DeliveryError};
use crate::database::snapshot::Snapshot;
use crate::database::storage::StorageProvider;

pub struct ObjectStoreChannel {
    provider: Option<Arc<dyn StorageProvider>>,
    /// Remote retention, unlimited when unset
    max_count: Option<usize>,
}

impl ObjectStoreChannel {
    pub fn new(provider: Option<Arc<dyn StorageProvider>>, max_count: Option<usize>) -> Self {
        Self {
            provider,
            max_count,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn deliver(&self, snapshot: &Snapshot) -> ChannelOutcome {
        let Some(provider) = &self.provider else {
            return ChannelOutcome::Skipped {
                reason: "object storage not configured".to_string(),
            };
        };

        if let Err(e) = provider
            .store_backup(&snapshot.path, &snapshot.file_name)
            .await
        {
            return ChannelOutcome::Failed(DeliveryError::Transport(e.to_string()));
        }

        // Remote cleanup never fails a completed upload
        if let Some(max_count) = self.max_count {
            if let Err(e) = provider.cleanup_old_backups(max_count).await {
                warn!("Failed to clean up old remote backups: {}", e);
            }
        }

        ChannelOutcome::Succeeded {
            detail: format!("stored {}", snapshot.file_name),
        }
    }
}
