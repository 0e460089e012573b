//! Remote client session against the IoT Hub device HTTPS API.
//!
//! A session is a reqwest client plus a SAS token minted from the stored
//! device credential. It is never repaired in place: once marked
//! disconnected, the next `connect()` builds a fresh client and token.

use crate::config::DeviceCredential;
use crate::error::DeliveryError;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use telemetry_types::{UploadNotification, UploadTarget, UploadTargetRequest};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2020-03-13";
const CONNECT_TIMEOUT_SECS: u64 = 10;
/// Re-mint the token this long before it actually expires.
const TOKEN_RENEW_MARGIN_SECS: u64 = 60;

#[async_trait]
pub trait TelemetrySession: Send {
    async fn connect(&mut self) -> Result<(), DeliveryError>;

    async fn disconnect(&mut self);

    /// Cached flag, not a round trip. `send` failing is the ground truth.
    fn is_connected(&self) -> bool;

    async fn send(&mut self, payload: &str) -> Result<(), DeliveryError>;

    async fn request_upload_target(
        &mut self,
        blob_name: &str,
    ) -> Result<UploadTarget, DeliveryError>;

    /// Report the outcome of an upload back to the hub.
    async fn notify_upload(
        &mut self,
        _target: &UploadTarget,
        _success: bool,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}

struct Connection {
    client: reqwest::Client,
    token: String,
    expires_at: u64,
}

pub struct IotHubSession {
    credential: DeviceCredential,
    endpoint: String,
    sas_ttl: Duration,
    conn: Option<Connection>,
}

impl IotHubSession {
    pub fn new(credential: DeviceCredential, sas_ttl: Duration) -> Self {
        let endpoint = format!("https://{}", credential.host_name);
        Self {
            credential,
            endpoint,
            sas_ttl,
            conn: None,
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.credential.host_name, self.credential.device_id)
    }

    fn device_url(&self, path: &str) -> String {
        format!(
            "{}/devices/{}/{}?api-version={}",
            self.endpoint,
            urlencoding::encode(&self.credential.device_id),
            path,
            API_VERSION
        )
    }

    fn mint_token(&self) -> (String, u64) {
        let expires_at = unix_now() + self.sas_ttl.as_secs();
        let token = generate_sas_token(&self.resource_uri(), &self.credential.key, expires_at);
        (token, expires_at)
    }

    /// Current connection, with the token renewed if it is about to lapse.
    fn live_connection(&mut self) -> Result<&Connection, DeliveryError> {
        let needs_renewal = match &self.conn {
            None => return Err(DeliveryError::Connect("session is not connected".to_string())),
            Some(c) => unix_now() + TOKEN_RENEW_MARGIN_SECS >= c.expires_at,
        };
        if needs_renewal {
            let (token, expires_at) = self.mint_token();
            if let Some(conn) = self.conn.as_mut() {
                log::debug!("[SESSION] SAS token renewed");
                conn.token = token;
                conn.expires_at = expires_at;
            }
        }
        self.conn
            .as_ref()
            .ok_or_else(|| DeliveryError::Connect("session is not connected".to_string()))
    }

    /// Post a JSON body to the hub and return the response text.
    async fn post(&mut self, url: String, body: String) -> Result<String, DeliveryError> {
        let conn = self.live_connection()?;
        let result = conn
            .client
            .post(&url)
            .header("Authorization", &conn.token)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                let err = DeliveryError::from_reqwest(e);
                self.drop_if_transient(&err);
                return Err(err);
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let err = DeliveryError::from_status(status, &text);
            self.drop_if_transient(&err);
            return Err(err);
        }
        Ok(text)
    }

    fn drop_if_transient(&mut self, err: &DeliveryError) {
        if err.is_transient() && self.conn.take().is_some() {
            log::info!("[SESSION] Marked disconnected after: {}", err);
        }
    }
}

#[async_trait]
impl TelemetrySession for IotHubSession {
    async fn connect(&mut self) -> Result<(), DeliveryError> {
        self.conn = None;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| DeliveryError::Connect(format!("failed to build client: {}", e)))?;
        let (token, expires_at) = self.mint_token();

        self.conn = Some(Connection {
            client,
            token,
            expires_at,
        });
        log::info!(
            "[SESSION] Device {} connected to {}",
            self.credential.device_id,
            self.credential.host_name
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            log::info!("[SESSION] Disconnected from {}", self.credential.host_name);
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn send(&mut self, payload: &str) -> Result<(), DeliveryError> {
        let url = self.device_url("messages/events");
        self.post(url, payload.to_string()).await.map(|_| ())
    }

    async fn request_upload_target(
        &mut self,
        blob_name: &str,
    ) -> Result<UploadTarget, DeliveryError> {
        let url = self.device_url("files");
        let body = serde_json::to_string(&UploadTargetRequest {
            blob_name: blob_name.to_string(),
        })
        .map_err(|e| DeliveryError::Unexpected(e.to_string()))?;

        let text = self.post(url, body).await?;
        serde_json::from_str(&text)
            .map_err(|e| DeliveryError::Unexpected(format!("invalid upload target: {}", e)))
    }

    async fn notify_upload(
        &mut self,
        target: &UploadTarget,
        success: bool,
    ) -> Result<(), DeliveryError> {
        let url = self.device_url("files/notifications");
        let body = serde_json::to_string(&UploadNotification::for_target(target, success))
            .map_err(|e| DeliveryError::Unexpected(e.to_string()))?;
        self.post(url, body).await.map(|_| ())
    }
}

/// Build a `SharedAccessSignature` header value for `resource_uri`.
pub fn generate_sas_token(resource_uri: &str, key: &[u8], expires_at: u64) -> String {
    let encoded_uri = urlencoding::encode(resource_uri);
    let to_sign = format!("{}\n{}", encoded_uri, expires_at);

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        urlencoding::encode(&signature),
        expires_at
    )
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
