//! Plain HTTP(S) location serving the most recent backup

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tracing::{debug, info};

use super::RestoreSource;
use crate::database::{BackupError, Result};

/// Downloads a backup with a single GET request
#[derive(Debug, Clone)]
pub struct HttpRestoreSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpRestoreSource {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackupError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            token,
        })
    }
}

#[async_trait]
impl RestoreSource for HttpRestoreSource {
    async fn fetch_latest(&self, destination: &Path) -> Result<String> {
        debug!("Downloading backup from {}", self.url);

        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackupError::Storage(format!("Remote backup request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackupError::Storage(format!(
                "Remote backup request returned {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| BackupError::Storage(format!("Failed to read remote backup: {}", e)))?;
        tokio_fs::write(destination, &body).await?;

        info!("Downloaded {} bytes from {}", body.len(), self.url);
        Ok(self.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::{HeaderMap, StatusCode}, routing::get};
    use tempfile::tempdir;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_latest_writes_body() {
        let app = Router::new().route(
            "/latest.db",
            get(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some("Bearer token-1") => (StatusCode::OK, b"database bytes".to_vec()),
                    _ => (StatusCode::UNAUTHORIZED, Vec::new()),
                }
            }),
        );
        let base = serve(app).await;
        let temp_dir = tempdir().unwrap();
        let destination = temp_dir.path().join("download.db");

        let source = HttpRestoreSource::new(
            &format!("{}/latest.db", base),
            Some("token-1".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        source.fetch_latest(&destination).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"database bytes");
    }

    #[tokio::test]
    async fn test_fetch_latest_rejects_error_status() {
        let app = Router::new().route("/latest.db", get(|| async { StatusCode::NOT_FOUND }));
        let base = serve(app).await;
        let temp_dir = tempdir().unwrap();
        let destination = temp_dir.path().join("download.db");

        let source =
            HttpRestoreSource::new(&format!("{}/latest.db", base), None, Duration::from_secs(5))
                .unwrap();
        let result = source.fetch_latest(&destination).await;

        assert!(matches!(result, Err(BackupError::Storage(_))));
        assert!(!destination.exists());
    }
}
