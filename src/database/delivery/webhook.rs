//! Multipart upload of a snapshot to a remote HTTP endpoint

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tokio::fs as tokio_fs;
use tracing::debug;

use super::{ChannelOutcome, DeliveryError};
use crate::config::WebhookConfig;
use crate::database::snapshot::Snapshot;
use crate::database::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: Option<String>,
    token: Option<String>,
    timeout: Duration,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackupError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
            timeout,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// A missing URL is a skip, never a failure
    pub async fn deliver(&self, snapshot: &Snapshot) -> ChannelOutcome {
        let Some(url) = &self.url else {
            return ChannelOutcome::Skipped {
                reason: "webhook URL not configured".to_string(),
            };
        };

        match self.upload(url, snapshot).await {
            Ok(detail) => ChannelOutcome::Succeeded { detail },
            Err(e) => ChannelOutcome::Failed(e),
        }
    }

    async fn upload(&self, url: &str, snapshot: &Snapshot) -> std::result::Result<String, DeliveryError> {
        let bytes = tokio_fs::read(&snapshot.path)
            .await
            .map_err(|e| DeliveryError::Io(e.to_string()))?;
        let size = bytes.len();

        let part = Part::bytes(bytes)
            .file_name(snapshot.file_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| DeliveryError::InvalidMessage(e.to_string()))?;
        let form = Form::new().part("file", part);

        debug!("Uploading {} ({} bytes) to {}", snapshot.file_name, size, url);
        let mut request = self.client.post(url).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::HttpStatus(status.as_u16()));
        }

        Ok(format!("uploaded {} bytes to {} ({})", size, url, status))
    }
}
