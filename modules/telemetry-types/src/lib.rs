//! Shared types for the telemetry agent, its buffered episode files and the
//! aggregation service that reads them back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =====================================================
// Readings & Wire Payload
// =====================================================

/// One simulated sensor sample.
///
/// Serialized verbatim into both live sends and buffered episode entries, so
/// the aggregation service can decode either with [`Reading::from_payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    /// Unix seconds with sub-second precision
    pub timestamp: f64,
    pub device_id: String,
}

impl Reading {
    /// Encode the reading as the wire payload used for every delivery path.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a wire payload produced by [`Reading::to_payload`].
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

// =====================================================
// Outage Buffer Document
// =====================================================

/// On-disk layout of one outage episode: `{"messages": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferDocument {
    pub messages: Vec<String>,
}

impl BufferDocument {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// =====================================================
// File Upload Contract
// =====================================================

/// Storage location handed out by the hub for a single file upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    #[serde(default)]
    pub correlation_id: String,
    pub host_name: String,
    pub container_name: String,
    pub blob_name: String,
    pub sas_token: String,
}

impl UploadTarget {
    /// Pre-signed URL granting write access to exactly this blob.
    pub fn sas_url(&self) -> String {
        let query = self.sas_token.trim_start_matches('?');
        format!(
            "https://{}/{}/{}?{}",
            self.host_name, self.container_name, self.blob_name, query
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTargetRequest {
    pub blob_name: String,
}

/// Completion report sent back to the hub after an upload attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadNotification {
    pub correlation_id: String,
    pub is_success: bool,
    pub status_code: i32,
    pub status_description: String,
}

impl UploadNotification {
    pub fn for_target(target: &UploadTarget, success: bool) -> Self {
        Self {
            correlation_id: target.correlation_id.clone(),
            is_success: success,
            status_code: if success { 0 } else { -1 },
            status_description: if success { "Success" } else { "Failure" }.to_string(),
        }
    }
}

// =====================================================
// Aggregation Types
// =====================================================

/// A decoded telemetry record as seen by the aggregation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub blob_name: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub timestamp: f64,
}

/// Mean values for one device over one clock hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAverage {
    /// ISO-8601 start of the hour (UTC)
    pub hour_start: String,
    pub avg_temperature: Option<f64>,
    pub avg_humidity: Option<f64>,
    pub data_points: usize,
}

/// Query parameters accepted by the aggregation endpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TelemetryQuery {
    pub avg: Option<String>,
    pub device_id: Option<String>,
}

impl TelemetryQuery {
    pub fn wants_average(&self) -> bool {
        self.avg
            .as_deref()
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    }

    pub fn device_filter(&self) -> Option<String> {
        self.device_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AggregationResponse<T> {
    pub total_devices_processed: usize,
    pub data: BTreeMap<String, Vec<T>>,
}

impl<T> AggregationResponse<T> {
    pub fn new(data: BTreeMap<String, Vec<T>>) -> Self {
        Self {
            total_devices_processed: data.len(),
            data,
        }
    }
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub source: String,
    pub last_scan_at: Option<String>,
    pub last_scan_blobs: usize,
}
