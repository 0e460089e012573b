//! Pushes a closed episode file to blob storage through a SAS URL.
//!
//! The local file is left alone; deleting it is up to the caller once the
//! upload has been confirmed.

use crate::error::DeliveryError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use telemetry_types::UploadTarget;

const UPLOAD_TIMEOUT_SECS: u64 = 60;

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, local_file: &Path, target: &UploadTarget) -> Result<(), DeliveryError>;
}

pub struct BlobUploader {
    client: reqwest::Client,
    /// Replaces `https://<host>` from the upload target when set
    endpoint: Option<String>,
}

impl BlobUploader {
    pub fn new(endpoint: Option<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| DeliveryError::Unexpected(format!("failed to build client: {}", e)))?;
        if let Some(endpoint) = &endpoint {
            log::info!("[UPLOAD] Using storage endpoint {}", endpoint);
        }
        Ok(Self { client, endpoint })
    }

    fn url_for(&self, target: &UploadTarget) -> String {
        match &self.endpoint {
            Some(base) => format!(
                "{}/{}/{}?{}",
                base.trim_end_matches('/'),
                target.container_name,
                target.blob_name,
                target.sas_token.trim_start_matches('?')
            ),
            None => target.sas_url(),
        }
    }
}

#[async_trait]
impl Uploader for BlobUploader {
    async fn upload(&self, local_file: &Path, target: &UploadTarget) -> Result<(), DeliveryError> {
        let bytes = tokio::fs::read(local_file).await.map_err(|e| {
            DeliveryError::Unexpected(format!("cannot read {}: {}", local_file.display(), e))
        })?;
        let size = bytes.len();

        // Put Blob replaces any existing blob of the same name, so a retried
        // upload of the same episode never conflicts.
        let response = self
            .client
            .put(self.url_for(target))
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(DeliveryError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::from_status(status, &body));
        }

        log::info!(
            "[UPLOAD] Stored {} ({} bytes) as {}/{}",
            local_file.display(),
            size,
            target.container_name,
            target.blob_name
        );
        Ok(())
    }
}
