//! Telemetry Agent: streams simulated sensor readings to IoT Hub.
//!
//! Readings that cannot be delivered are buffered per outage episode in
//! `<started_at>.json` and uploaded to blob storage once the hub is
//! reachable again.
//!
//! Usage: `telemetry-agent [--time_interval <secs>]`

mod buffer;
mod config;
mod episode;
mod error;
mod generator;
mod logging;
mod probe;
mod session;
mod uploader;
mod worker;

#[cfg(test)]
mod test_http;

use clap::Parser;
use config::{AgentConfig, Cli, DeviceCredential};
use logging::channels;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = AgentConfig::from_env(&cli);

    if let Err(e) = logging::init(&config.log_dir) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let credential = match DeviceCredential::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!(target: channels::ERRORS, "Value error: {}", e);
            log::info!("App stopped");
            std::process::exit(1);
        }
    };

    let uploader = match uploader::BlobUploader::new(config.blob_endpoint.clone()) {
        Ok(u) => u,
        Err(e) => {
            log::error!(target: channels::ERRORS, "Failed to initialize uploader: {}", e);
            std::process::exit(1);
        }
    };

    log::info!(
        "Starting agent for device {} (interval: {}s, buffer dir: {})",
        credential.device_id,
        config.time_interval.as_secs(),
        config.buffer_dir.display()
    );

    let device_id = credential.device_id.clone();
    let mut worker = worker::DeliveryLoop::new(
        Box::new(generator::SimulatedSensor::new(device_id)),
        Box::new(probe::TcpProber::new(
            config.probe_addr.clone(),
            config.probe_timeout,
        )),
        Box::new(session::IotHubSession::new(credential, config.sas_ttl)),
        Box::new(uploader),
        buffer::OutageBuffer::new(config.buffer_dir.clone()),
        config.alert_threshold,
    );
    worker.recover_leftovers();
    if !worker.leftovers().is_empty() {
        log::info!(
            "{} outage file(s) will be uploaded once the hub is reachable",
            worker.leftovers().len()
        );
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("App stopped by the user");
                ctrl_c.cancel();
            }
            Err(e) => log::warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    worker.run(config.time_interval, cancel).await;
    if let Some(key) = worker.episode().started_at {
        log::warn!(
            "Stopped during an outage; {} stays on disk for the next run",
            key.file_name()
        );
    }
    log::info!("App stopped");
    log::logger().flush();
}
