//! Error kinds for the delivery path and the outage buffer.

use thiserror::Error;

/// Outcome classification for probe, connect and send.
///
/// Transient kinds drive the outage transition; everything else is logged
/// and the tick is skipped without touching episode state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("network unreachable")]
    Unreachable,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport fault: {0}")]
    Transport(String),

    /// The endpoint answered but refused the request (bad credential, bad payload)
    #[error("rejected by endpoint ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryError::Unreachable
                | DeliveryError::Connect(_)
                | DeliveryError::Send(_)
                | DeliveryError::Transport(_)
        )
    }

    /// Map a reqwest failure onto a delivery error kind.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_connect() {
            DeliveryError::Connect(e.to_string())
        } else if e.is_timeout() || e.is_request() || e.is_body() {
            DeliveryError::Transport(e.to_string())
        } else if e.is_builder() || e.is_decode() {
            DeliveryError::Unexpected(e.to_string())
        } else {
            DeliveryError::Send(e.to_string())
        }
    }

    /// Map a non-success HTTP status. Server-side and throttling responses
    /// are retried like a dropped connection.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            DeliveryError::Send(format!("{}: {}", status, truncate(body)))
        } else {
            DeliveryError::Rejected {
                status: status.as_u16(),
                body: truncate(body).to_string(),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt buffer file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("failed to encode buffer: {0}")]
    Encode(#[from] serde_json::Error),
}

fn truncate(s: &str) -> &str {
    if s.len() > 200 {
        let mut end = 200;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    } else {
        s
    }
}
