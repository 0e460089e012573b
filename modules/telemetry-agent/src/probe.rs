//! Out-of-band reachability check, independent of the telemetry endpoint.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Whether the network looks reachable right now.
    async fn probe(&self) -> bool;
}

/// Opens a TCP connection to a well-known address with a short timeout.
pub struct TcpProber {
    addr: String,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                log::debug!("[PROBE] {} unreachable: {}", self.addr, e);
                false
            }
            Err(_) => {
                log::debug!(
                    "[PROBE] {} timed out after {}ms",
                    self.addr,
                    self.timeout.as_millis()
                );
                false
            }
        }
    }
}
