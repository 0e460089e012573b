//! Record decoding and hourly aggregation.
//!
//! Blobs come in two shapes: newline-delimited hub routing records whose
//! `Body` carries the message payload (base64 or inline JSON), and uploaded
//! outage files (`{"messages": [...]}`) holding raw payloads.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use telemetry_types::{BufferDocument, DeviceRecord, HourlyAverage};

pub const UNKNOWN_DEVICE: &str = "N/A";

/// Records grouped by device id
pub type DeviceRecords = BTreeMap<String, Vec<DeviceRecord>>;

/// Fields pulled out of one message payload
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub device_id: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub timestamp: Option<f64>,
}

impl DecodedMessage {
    fn from_value(value: &Value) -> Self {
        Self {
            device_id: value
                .get("device_id")
                .and_then(|v| v.as_str())
                .unwrap_or(UNKNOWN_DEVICE)
                .to_string(),
            temperature: numeric(value.get("temperature")),
            humidity: numeric(value.get("humidity")),
            timestamp: numeric(value.get("timestamp")),
        }
    }
}

/// Numbers only; numeric strings such as `"N/A"` or `"30.1"` are not samples.
fn numeric(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|v| v.is_finite())
}

/// Parse a message payload. Older agents wrote single-quoted dict literals,
/// which become valid JSON once the quotes are swapped.
pub fn parse_payload(payload: &str) -> Result<DecodedMessage, String> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(first) => serde_json::from_str(&payload.replace('\'', "\""))
            .map_err(|_| format!("payload is not JSON: {}", first))?,
    };
    if !value.is_object() {
        return Err("payload is not an object".to_string());
    }
    Ok(DecodedMessage::from_value(&value))
}

/// Decode the `Body` of one routing record.
fn decode_body(body: &Value) -> Result<Option<DecodedMessage>, String> {
    match body {
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => {
            let bytes = BASE64
                .decode(s.as_bytes())
                .map_err(|e| format!("Body is not base64: {}", e))?;
            let text = String::from_utf8(bytes).map_err(|e| format!("Body is not UTF-8: {}", e))?;
            parse_payload(&text).map(Some)
        }
        Value::Object(_) => Ok(Some(DecodedMessage::from_value(body))),
        _ => Ok(None),
    }
}

/// Decode every message in a blob. Bad lines are logged and skipped.
pub fn decode_blob(blob_name: &str, content: &str) -> Vec<DecodedMessage> {
    if let Ok(doc) = serde_json::from_str::<BufferDocument>(content) {
        return doc
            .messages
            .iter()
            .filter_map(|m| match parse_payload(m) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    log::warn!("[AGGREGATOR] Skipping buffered message in {}: {}", blob_name, e);
                    None
                }
            })
            .collect();
    }

    let mut messages = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                log::error!(
                    "[AGGREGATOR] Invalid JSON in {}, line {}: {}",
                    blob_name,
                    line_num + 1,
                    e
                );
                continue;
            }
        };

        match record.get("Body").map(decode_body) {
            Some(Ok(Some(msg))) => messages.push(msg),
            Some(Ok(None)) | None => {
                log::warn!("[AGGREGATOR] No body field in {}, line {}", blob_name, line_num + 1)
            }
            Some(Err(e)) => log::error!(
                "[AGGREGATOR] Bad body in {}, line {}: {}",
                blob_name,
                line_num + 1,
                e
            ),
        }
    }
    messages
}

/// Add a blob's messages to `records`, keeping only numeric timestamps and
/// the requested device (case-insensitive).
pub fn collect_records(
    records: &mut DeviceRecords,
    blob_name: &str,
    messages: Vec<DecodedMessage>,
    device_filter: Option<&str>,
) {
    for msg in messages {
        if let Some(filter) = device_filter {
            if !msg.device_id.eq_ignore_ascii_case(filter) {
                continue;
            }
        }
        let Some(timestamp) = msg.timestamp else {
            log::warn!("[AGGREGATOR] Invalid timestamp in {}", blob_name);
            continue;
        };
        records.entry(msg.device_id).or_default().push(DeviceRecord {
            blob_name: blob_name.to_string(),
            temperature: msg.temperature,
            humidity: msg.humidity,
            timestamp,
        });
    }
}

/// Unix seconds of the start of the hour containing `timestamp` (UTC).
fn hour_start(timestamp: f64) -> i64 {
    let secs = timestamp.floor() as i64;
    secs - secs.rem_euclid(3600)
}

fn mean(samples: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = samples.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Per-device, per-hour means of temperature and humidity.
pub fn hourly_averages(records: &DeviceRecords) -> BTreeMap<String, Vec<HourlyAverage>> {
    let mut result = BTreeMap::new();

    for (device_id, device_records) in records {
        let mut by_hour: BTreeMap<i64, Vec<&DeviceRecord>> = BTreeMap::new();
        for record in device_records {
            by_hour.entry(hour_start(record.timestamp)).or_default().push(record);
        }

        let averages: Vec<HourlyAverage> = by_hour
            .into_iter()
            .map(|(hour, hour_records)| HourlyAverage {
                hour_start: DateTime::<Utc>::from_timestamp(hour, 0)
                    .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_else(|| hour.to_string()),
                avg_temperature: mean(hour_records.iter().filter_map(|r| r.temperature)),
                avg_humidity: mean(hour_records.iter().filter_map(|r| r.humidity)),
                data_points: hour_records.len(),
            })
            .collect();

        if !averages.is_empty() {
            result.insert(device_id.clone(), averages);
        }
    }

    result
}
