//! Delivery loop for the telemetry agent.
//!
//! Every tick generates one reading and tries to deliver it live. Transient
//! failures open (or continue) an outage episode and the message is buffered
//! to `<started_at>.json`. The first successful send after an outage drains
//! the episode file to blob storage and removes the local copy only after the
//! upload has been confirmed.

use crate::buffer::{EpisodeKey, OutageBuffer};
use crate::episode::OutageEpisode;
use crate::error::DeliveryError;
use crate::generator::ReadingSource;
use crate::logging::channels;
use crate::probe::Prober;
use crate::session::TelemetrySession;
use crate::uploader::Uploader;
use std::time::Duration;
use telemetry_types::Reading;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Sent live to the hub
    Delivered,
    /// Written to the current episode's buffer file
    Buffered,
    /// Transient failure, but the buffer write failed as well
    Lost,
    /// Non-transport error; nothing changed
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub alerted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub ticks: u64,
    pub delivered: u64,
    pub buffered: u64,
    pub skipped: u64,
    pub alerts: u64,
    pub episodes_opened: u64,
    pub episodes_closed: u64,
    pub drains_failed: u64,
    pub messages_lost: u64,
}

pub struct DeliveryLoop {
    source: Box<dyn ReadingSource>,
    prober: Box<dyn Prober>,
    session: Box<dyn TelemetrySession>,
    uploader: Box<dyn Uploader>,
    buffer: OutageBuffer,
    alert_threshold: f64,
    episode: OutageEpisode,
    /// Highest episode key used so far, including files found on startup
    last_key: Option<EpisodeKey>,
    /// Episode files from earlier runs still waiting to be drained
    leftovers: Vec<EpisodeKey>,
    stats: DeliveryStats,
}

impl DeliveryLoop {
    pub fn new(
        source: Box<dyn ReadingSource>,
        prober: Box<dyn Prober>,
        session: Box<dyn TelemetrySession>,
        uploader: Box<dyn Uploader>,
        buffer: OutageBuffer,
        alert_threshold: f64,
    ) -> Self {
        Self {
            source,
            prober,
            session,
            uploader,
            buffer,
            alert_threshold,
            episode: OutageEpisode::connected(),
            last_key: None,
            leftovers: Vec::new(),
            stats: DeliveryStats::default(),
        }
    }

    pub fn episode(&self) -> OutageEpisode {
        self.episode
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn leftovers(&self) -> &[EpisodeKey] {
        &self.leftovers
    }

    /// Queue episode files left behind by a previous run.
    pub fn recover_leftovers(&mut self) {
        match self.buffer.leftover_keys() {
            Ok(keys) => {
                if !keys.is_empty() {
                    log::warn!(
                        "[DELIVERY] Found {} undelivered outage file(s) in {}",
                        keys.len(),
                        self.buffer.dir().display()
                    );
                }
                if let Some(max) = keys.last() {
                    self.bump_last_key(*max);
                }
                self.leftovers = keys;
            }
            Err(e) => {
                log::error!(
                    target: channels::ERRORS,
                    "[DELIVERY] Could not scan buffer directory: {}",
                    e
                );
            }
        }
    }

    /// One iteration: read, alert, deliver or buffer, and drain on recovery.
    pub async fn tick(&mut self) -> TickReport {
        self.stats.ticks += 1;
        let reading = self.source.next_reading();

        let alerted = reading.temperature >= self.alert_threshold;
        if alerted {
            self.stats.alerts += 1;
            log::warn!(
                target: channels::ALERTS,
                "Temperature too high: {} (threshold {}, device {})",
                reading.temperature,
                self.alert_threshold,
                reading.device_id
            );
        }

        log::info!(
            target: channels::TELEMETRY,
            "Temperature {} Humidity {}",
            reading.temperature,
            reading.humidity
        );

        let outcome = match self.deliver(&reading).await {
            Ok(()) => {
                self.stats.delivered += 1;
                self.on_delivered().await;
                TickOutcome::Delivered
            }
            Err((e, payload)) if e.is_transient() => self.on_send_failure(&reading, payload, &e),
            Err((e, _)) => {
                self.stats.skipped += 1;
                log::error!(
                    target: channels::ERRORS,
                    "Unexpected error sending message at {}: {}",
                    reading.timestamp,
                    e
                );
                TickOutcome::Skipped
            }
        };

        TickReport { outcome, alerted }
    }

    /// Classify before sending: probe first, then make sure the session is
    /// connected, then send. The payload is handed back on failure so it can
    /// be buffered verbatim.
    async fn deliver(&mut self, reading: &Reading) -> Result<(), (DeliveryError, String)> {
        let payload = reading
            .to_payload()
            .map_err(|e| (DeliveryError::Unexpected(e.to_string()), String::new()))?;

        if !self.prober.probe().await {
            return Err((DeliveryError::Unreachable, payload));
        }

        if !self.session.is_connected() {
            log::info!("[DELIVERY] Session not connected, reconnecting");
            if let Err(e) = self.session.connect().await {
                self.session.disconnect().await;
                return Err((e, payload));
            }
        }

        match self.session.send(&payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_transient() {
                    // Never reuse a handle that just failed
                    self.session.disconnect().await;
                }
                Err((e, payload))
            }
        }
    }

    fn on_send_failure(
        &mut self,
        reading: &Reading,
        payload: String,
        err: &DeliveryError,
    ) -> TickOutcome {
        let before = self.episode;
        self.episode = self.episode.on_failure(reading.timestamp, self.last_key);

        let Some(key) = self.episode.started_at else {
            log::error!(
                target: channels::ERRORS,
                "[DELIVERY] Outage state has no episode key; message at {} lost",
                reading.timestamp
            );
            self.stats.messages_lost += 1;
            return TickOutcome::Lost;
        };

        let written = if OutageEpisode::opened_new(&before, &self.episode) {
            self.stats.episodes_opened += 1;
            self.bump_last_key(key);
            log::warn!("[DELIVERY] Network outage started (episode {}): {}", key, err);
            self.buffer.save(key, &[payload]).map(|_| 1)
        } else {
            if !self.buffer.exists(key) {
                log::error!(
                    target: channels::ERRORS,
                    "Data has been lost: outage file for episode {} not found, creating a new one",
                    key
                );
            }
            log::info!("[DELIVERY] Outage continues (episode {}): {}", key, err);
            self.buffer.append(key, payload)
        };

        match written {
            Ok(count) => {
                self.stats.buffered += 1;
                log::debug!("[DELIVERY] Episode {} now holds {} message(s)", key, count);
                TickOutcome::Buffered
            }
            Err(e) => {
                self.stats.messages_lost += 1;
                log::error!(
                    target: channels::ERRORS,
                    "Data has been lost: could not buffer message at {}: {}",
                    reading.timestamp,
                    e
                );
                TickOutcome::Lost
            }
        }
    }

    /// A live send went through. Close the open episode (if any), then try
    /// the leftovers from earlier runs.
    async fn on_delivered(&mut self) {
        if let (false, Some(key)) = (self.episode.connected, self.episode.started_at) {
            if self.buffer.exists(key) {
                match self.drain(key).await {
                    Ok(()) => {
                        self.stats.episodes_closed += 1;
                        self.episode = self.episode.close();
                        log::info!("[DELIVERY] Outage episode {} recovered", key);
                    }
                    Err(e) => {
                        // Stay in the outage so the next success retries and
                        // further failures keep appending to the same file.
                        self.stats.drains_failed += 1;
                        log::error!(
                            target: channels::ERRORS,
                            "Upload of outage file for episode {} failed, keeping local copy: {}",
                            key,
                            e
                        );
                        return;
                    }
                }
            } else {
                log::error!(
                    target: channels::ERRORS,
                    "Data has been lost: network outage file for episode {} not found",
                    key
                );
                self.stats.episodes_closed += 1;
                self.episode = self.episode.close();
            }
        } else if !self.episode.connected {
            self.episode = self.episode.close();
        }

        self.drain_leftovers().await;
    }

    async fn drain_leftovers(&mut self) {
        if self.leftovers.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut self.leftovers);
        let mut remaining = Vec::new();
        let mut halted = false;

        for key in pending {
            if halted {
                remaining.push(key);
                continue;
            }
            if !self.buffer.exists(key) {
                continue;
            }
            match self.drain(key).await {
                Ok(()) => log::info!("[DELIVERY] Leftover outage file {} recovered", key),
                Err(e) => {
                    self.stats.drains_failed += 1;
                    log::error!(
                        target: channels::ERRORS,
                        "Upload of leftover outage file {} failed: {}",
                        key,
                        e
                    );
                    halted = e.is_transient();
                    remaining.push(key);
                }
            }
        }

        self.leftovers = remaining;
    }

    /// Upload one episode file and delete it once the upload is confirmed.
    async fn drain(&mut self, key: EpisodeKey) -> Result<(), DeliveryError> {
        let path = self.buffer.path_for(key);
        let blob_name = key.file_name();

        let target = self.session.request_upload_target(&blob_name).await?;
        let result = self.uploader.upload(&path, &target).await;

        if let Err(e) = self.session.notify_upload(&target, result.is_ok()).await {
            log::warn!("[DELIVERY] Could not notify hub of upload status: {}", e);
        }
        result?;

        match self.buffer.delete(key) {
            Ok(()) => log::info!("[DELIVERY] Network outage file {} has been removed", blob_name),
            Err(e) => log::warn!(
                "[DELIVERY] Uploaded {} but could not remove local copy: {}",
                blob_name,
                e
            ),
        }
        Ok(())
    }

    fn bump_last_key(&mut self, key: EpisodeKey) {
        match self.last_key {
            Some(prev) if prev.0 >= key.0 => {}
            _ => self.last_key = Some(key),
        }
    }

    /// Tick until cancelled. The sleep between ticks is interruptible; a tick
    /// in progress always runs to completion.
    pub async fn run(&mut self, interval: Duration, cancel: CancellationToken) {
        log::info!(
            "[DELIVERY] Loop started (interval: {}s)",
            interval.as_secs_f64()
        );

        while !cancel.is_cancelled() {
            let report = self.tick().await;
            log::debug!(
                "[DELIVERY] Tick {}: {:?} (alert: {})",
                self.stats.ticks,
                report.outcome,
                report.alerted
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        self.session.disconnect().await;
        let s = &self.stats;
        log::info!(
            "[DELIVERY] Stopped after {} ticks: {} delivered, {} buffered, {} skipped, {} lost, {} alerts, {}/{} episodes closed, {} failed drains",
            s.ticks,
            s.delivered,
            s.buffered,
            s.skipped,
            s.messages_lost,
            s.alerts,
            s.episodes_closed,
            s.episodes_opened,
            s.drains_failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use telemetry_types::{BufferDocument, UploadTarget};

    // =====================================================
    // Fakes
    // =====================================================

    /// Readings at t = 0, 1, 2, ... with a fixed or scripted temperature.
    struct ScriptedSource {
        next_ts: f64,
        temperatures: VecDeque<f64>,
        stop_after: Option<(u64, CancellationToken)>,
        produced: u64,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                next_ts: 0.0,
                temperatures: VecDeque::new(),
                stop_after: None,
                produced: 0,
            }
        }

        fn with_temperatures(mut self, temps: &[f64]) -> Self {
            self.temperatures = temps.iter().copied().collect();
            self
        }
    }

    impl ReadingSource for ScriptedSource {
        fn next_reading(&mut self) -> Reading {
            let ts = self.next_ts;
            self.next_ts += 1.0;
            self.produced += 1;
            if let Some((n, token)) = &self.stop_after {
                if self.produced >= *n {
                    token.cancel();
                }
            }
            Reading {
                temperature: self.temperatures.pop_front().unwrap_or(25.0),
                humidity: 40.0,
                timestamp: ts,
                device_id: "dev-1".to_string(),
            }
        }
    }

    #[derive(Clone)]
    struct FakeProber(Arc<AtomicBool>);

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct SessionLog {
        connected: bool,
        connects: u32,
        disconnects: u32,
        sends: u32,
        sent: Vec<String>,
        script: VecDeque<Result<(), DeliveryError>>,
        upload_targets: Vec<String>,
        notifications: Vec<bool>,
    }

    #[derive(Clone, Default)]
    struct FakeSession(Arc<Mutex<SessionLog>>);

    impl FakeSession {
        fn script(&self, outcomes: Vec<Result<(), DeliveryError>>) {
            self.0.lock().script.extend(outcomes);
        }
    }

    #[async_trait]
    impl TelemetrySession for FakeSession {
        async fn connect(&mut self) -> Result<(), DeliveryError> {
            let mut log = self.0.lock();
            log.connects += 1;
            log.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) {
            let mut log = self.0.lock();
            log.disconnects += 1;
            log.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.0.lock().connected
        }

        async fn send(&mut self, payload: &str) -> Result<(), DeliveryError> {
            let mut log = self.0.lock();
            log.sends += 1;
            let outcome = log.script.pop_front().unwrap_or(Ok(()));
            if outcome.is_ok() {
                log.sent.push(payload.to_string());
            }
            outcome
        }

        async fn request_upload_target(
            &mut self,
            blob_name: &str,
        ) -> Result<UploadTarget, DeliveryError> {
            self.0.lock().upload_targets.push(blob_name.to_string());
            Ok(UploadTarget {
                correlation_id: format!("corr-{}", blob_name),
                host_name: "acct.blob.core.windows.net".to_string(),
                container_name: "telemetry".to_string(),
                blob_name: format!("dev-1/{}", blob_name),
                sas_token: "?sig=x".to_string(),
            })
        }

        async fn notify_upload(
            &mut self,
            _target: &UploadTarget,
            success: bool,
        ) -> Result<(), DeliveryError> {
            self.0.lock().notifications.push(success);
            Ok(())
        }
    }

    /// Records the messages of each uploaded file.
    #[derive(Clone, Default)]
    struct FakeUploader {
        uploads: Arc<Mutex<Vec<(String, Vec<String>)>>>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Uploader for FakeUploader {
        async fn upload(&self, local_file: &Path, target: &UploadTarget) -> Result<(), DeliveryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeliveryError::Send("storage unavailable".to_string()));
            }
            let raw = std::fs::read_to_string(local_file).unwrap();
            let doc: BufferDocument = serde_json::from_str(&raw).unwrap();
            self.uploads
                .lock()
                .push((target.blob_name.clone(), doc.messages));
            Ok(())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        online: Arc<AtomicBool>,
        session: FakeSession,
        uploader: FakeUploader,
        worker: DeliveryLoop,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_source(ScriptedSource::new())
        }

        fn with_source(source: ScriptedSource) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let online = Arc::new(AtomicBool::new(true));
            let session = FakeSession::default();
            let uploader = FakeUploader::default();
            let worker = DeliveryLoop::new(
                Box::new(source),
                Box::new(FakeProber(online.clone())),
                Box::new(session.clone()),
                Box::new(uploader.clone()),
                OutageBuffer::new(dir.path()),
                35.0,
            );
            Self {
                dir,
                online,
                session,
                uploader,
                worker,
            }
        }

        fn buffer(&self) -> OutageBuffer {
            OutageBuffer::new(self.dir.path())
        }

        fn files(&self) -> Vec<EpisodeKey> {
            self.buffer().leftover_keys().unwrap()
        }

        fn fail_next_send(&self) {
            self.session
                .script(vec![Err(DeliveryError::Send("connection reset".to_string()))]);
        }
    }

    fn transient() -> Result<(), DeliveryError> {
        Err(DeliveryError::Transport("timed out".to_string()))
    }

    // =====================================================
    // State machine
    // =====================================================

    #[tokio::test]
    async fn test_connected_ticks_deliver_live() {
        let mut h = Harness::new();
        for _ in 0..3 {
            assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        }
        assert_eq!(h.session.0.lock().sent.len(), 3);
        assert_eq!(h.session.0.lock().connects, 1);
        assert!(h.files().is_empty());
        assert_eq!(h.worker.episode(), OutageEpisode::connected());
    }

    #[tokio::test]
    async fn test_single_failure_then_success() {
        let mut h = Harness::new();
        h.fail_next_send();

        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Buffered);
        assert_eq!(h.files(), vec![EpisodeKey(0.0)]);
        assert!(h.worker.episode().is_outage());

        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        assert!(h.files().is_empty());
        assert_eq!(h.worker.episode(), OutageEpisode::connected());

        let uploads = h.uploader.uploads.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1.len(), 1);
        assert_eq!(h.session.0.lock().notifications, vec![true]);
        assert_eq!(h.worker.stats().episodes_closed, 1);
    }

    #[tokio::test]
    async fn test_two_failures_share_one_file_in_order() {
        let mut h = Harness::new();
        h.session.script(vec![transient(), transient()]);

        h.worker.tick().await;
        h.worker.tick().await;

        assert_eq!(h.files(), vec![EpisodeKey(0.0)]);
        let messages = h.buffer().load(EpisodeKey(0.0)).unwrap();
        assert_eq!(messages.len(), 2);
        let first = Reading::from_payload(&messages[0]).unwrap();
        let second = Reading::from_payload(&messages[1]).unwrap();
        assert_eq!(first.timestamp, 0.0);
        assert_eq!(second.timestamp, 1.0);
    }

    #[tokio::test]
    async fn test_new_episode_gets_greater_key() {
        let mut h = Harness::new();
        h.fail_next_send();
        h.worker.tick().await; // t=0 fails
        h.worker.tick().await; // t=1 recovers
        let first_blob = h.session.0.lock().upload_targets[0].clone();

        h.fail_next_send();
        h.worker.tick().await; // t=2 fails, new episode
        let key = h.worker.episode().started_at.unwrap();
        assert!(key.0 > 0.0);
        assert_eq!(h.files(), vec![EpisodeKey(2.0)]);
        assert_eq!(first_blob, "0.json");
        assert_eq!(h.worker.stats().episodes_opened, 2);
    }

    #[tokio::test]
    async fn test_outage_then_recovery_end_to_end() {
        let mut h = Harness::new();
        h.session.script(vec![transient(), transient(), transient()]);

        for _ in 0..3 {
            assert_eq!(h.worker.tick().await.outcome, TickOutcome::Buffered);
        }
        assert_eq!(h.worker.episode().started_at, Some(EpisodeKey(0.0)));
        assert_eq!(h.buffer().load(EpisodeKey(0.0)).unwrap().len(), 3);

        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        {
            let uploads = h.uploader.uploads.lock();
            assert_eq!(uploads.len(), 1);
            assert_eq!(uploads[0].0, "dev-1/0.json");
            assert_eq!(uploads[0].1.len(), 3);
        }
        assert!(h.files().is_empty());
        assert_eq!(h.worker.episode(), OutageEpisode::connected());

        // Fresh connected state afterwards
        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        assert_eq!(h.uploader.uploads.lock().len(), 1);
        h.fail_next_send();
        h.worker.tick().await;
        assert_eq!(h.worker.episode().started_at, Some(EpisodeKey(5.0)));
    }

    #[tokio::test]
    async fn test_every_tick_is_delivered_or_buffered() {
        let mut h = Harness::new();
        let pattern = [
            false, false, true, true, false, true, false, false, false, true, true, true, false,
            true,
        ];
        for ok in pattern {
            if !ok {
                h.fail_next_send();
            }
            h.worker.tick().await;
        }

        let live = h.session.0.lock().sent.len();
        let uploaded: usize = h.uploader.uploads.lock().iter().map(|(_, m)| m.len()).sum();
        let on_disk: usize = h
            .files()
            .into_iter()
            .map(|k| h.buffer().load(k).unwrap().len())
            .sum();
        assert_eq!(live + uploaded + on_disk, pattern.len());

        let stats = h.worker.stats();
        assert_eq!(stats.delivered + stats.buffered, stats.ticks);
    }

    #[tokio::test]
    async fn test_probe_down_skips_session() {
        let mut h = Harness::new();
        h.online.store(false, Ordering::SeqCst);

        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Buffered);
        {
            let log = h.session.0.lock();
            assert_eq!(log.connects, 0);
            assert_eq!(log.sends, 0);
        }

        h.online.store(true, Ordering::SeqCst);
        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        assert!(h.files().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_forces_fresh_connect() {
        let mut h = Harness::new();
        h.worker.tick().await;
        h.fail_next_send();
        h.worker.tick().await;
        assert!(!h.session.0.lock().connected);

        h.worker.tick().await;
        let log = h.session.0.lock();
        assert_eq!(log.connects, 2);
        assert!(log.connected);
    }

    #[tokio::test]
    async fn test_unexpected_error_leaves_state_untouched() {
        let mut h = Harness::new();
        h.session
            .script(vec![Err(DeliveryError::Unexpected("bad state".to_string()))]);
        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Skipped);
        assert_eq!(h.worker.episode(), OutageEpisode::connected());
        assert!(h.files().is_empty());

        // Inside an outage, a rejection neither extends nor closes the episode
        h.session.script(vec![
            transient(),
            Err(DeliveryError::Rejected {
                status: 400,
                body: "bad payload".to_string(),
            }),
        ]);
        h.worker.tick().await;
        let during = h.worker.episode();
        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Skipped);
        assert_eq!(h.worker.episode(), during);
        assert_eq!(h.buffer().load(EpisodeKey(1.0)).unwrap().len(), 1);
        assert!(h.uploader.uploads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_file_and_retries() {
        let mut h = Harness::new();
        h.fail_next_send();
        h.worker.tick().await;

        h.uploader.fail.store(true, Ordering::SeqCst);
        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        assert_eq!(h.files(), vec![EpisodeKey(0.0)]);
        assert!(h.worker.episode().is_outage());
        assert_eq!(h.session.0.lock().notifications, vec![false]);

        // A further failure lands in the same episode file
        h.fail_next_send();
        h.worker.tick().await;
        assert_eq!(h.buffer().load(EpisodeKey(0.0)).unwrap().len(), 2);

        h.uploader.fail.store(false, Ordering::SeqCst);
        h.worker.tick().await;
        assert!(h.files().is_empty());
        assert_eq!(h.worker.episode(), OutageEpisode::connected());
        assert_eq!(h.uploader.uploads.lock()[0].1.len(), 2);
        assert_eq!(h.worker.stats().drains_failed, 1);
    }

    #[tokio::test]
    async fn test_missing_file_still_recovers() {
        let mut h = Harness::new();
        h.fail_next_send();
        h.worker.tick().await;
        std::fs::remove_file(h.buffer().path_for(EpisodeKey(0.0))).unwrap();

        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        assert_eq!(h.worker.episode(), OutageEpisode::connected());
        assert!(h.uploader.uploads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_restarts_episode_list() {
        let mut h = Harness::new();
        h.fail_next_send();
        h.worker.tick().await;
        std::fs::write(h.buffer().path_for(EpisodeKey(0.0)), "garbage").unwrap();

        h.fail_next_send();
        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Buffered);
        let messages = h.buffer().load(EpisodeKey(0.0)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(Reading::from_payload(&messages[0]).unwrap().timestamp, 1.0);
    }

    #[tokio::test]
    async fn test_leftovers_drained_after_first_success() {
        let mut h = Harness::new();
        h.buffer().save(EpisodeKey(10.5), &["old".to_string()]).unwrap();
        h.buffer().save(EpisodeKey(3.0), &["older".to_string()]).unwrap();
        h.worker.recover_leftovers();
        assert_eq!(h.worker.leftovers(), &[EpisodeKey(3.0), EpisodeKey(10.5)]);

        h.fail_next_send();
        h.worker.tick().await; // t=0 fails; key bumped above 10.5
        let key = h.worker.episode().started_at.unwrap();
        assert!(key.0 > 10.5);

        h.worker.tick().await;
        assert!(h.files().is_empty());
        assert!(h.worker.leftovers().is_empty());
        let blobs: Vec<String> = h
            .uploader
            .uploads
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        assert_eq!(blobs.len(), 3);
        assert_eq!(blobs[1], "dev-1/3.json");
        assert_eq!(blobs[2], "dev-1/10.5.json");
    }

    #[tokio::test]
    async fn test_foreign_json_in_buffer_dir_is_left_alone() {
        let mut h = Harness::new();
        let user_file = h.dir.path().join("2024.json");
        std::fs::write(&user_file, r#"{"name":"my-config","enabled":true}"#).unwrap();
        std::fs::write(h.dir.path().join("1.json"), "[]").unwrap();
        h.buffer().save(EpisodeKey(5.0), &["old".to_string()]).unwrap();

        h.worker.recover_leftovers();
        assert_eq!(h.worker.leftovers(), &[EpisodeKey(5.0)]);

        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Delivered);
        let uploads = h.uploader.uploads.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "dev-1/5.json");
        assert!(user_file.exists());
        assert!(h.dir.path().join("1.json").exists());
        assert!(!h.buffer().exists(EpisodeKey(5.0)));
    }

    // =====================================================
    // Alerts
    // =====================================================

    /// Global logger that keeps every record, tagged with the emitting
    /// thread so parallel tests only see their own output.
    struct CaptureLogger(Mutex<Vec<(std::thread::ThreadId, String, log::Level)>>);

    impl log::Log for CaptureLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            self.0.lock().push((
                std::thread::current().id(),
                record.target().to_string(),
                record.level(),
            ));
        }

        fn flush(&self) {}
    }

    impl CaptureLogger {
        fn install() -> &'static CaptureLogger {
            static LOGGER: std::sync::OnceLock<&'static CaptureLogger> = std::sync::OnceLock::new();
            LOGGER.get_or_init(|| {
                let logger: &'static CaptureLogger =
                    Box::leak(Box::new(CaptureLogger(Mutex::new(Vec::new()))));
                log::set_logger(logger).expect("no other logger in the test binary");
                log::set_max_level(log::LevelFilter::Trace);
                logger
            })
        }

        fn count(&self, target: &str) -> usize {
            let me = std::thread::current().id();
            self.0
                .lock()
                .iter()
                .filter(|(thread, t, _)| *thread == me && t == target)
                .count()
        }
    }

    #[tokio::test]
    async fn test_one_alert_record_per_hot_tick() {
        let logs = CaptureLogger::install();
        let source = ScriptedSource::new().with_temperatures(&[36.0, 20.0, 35.0, 40.0]);
        let mut h = Harness::with_source(source);
        // Hot readings: delivered, send failure, then network down
        h.session.script(vec![Ok(()), Ok(()), transient()]);

        let mut expected = [1, 0, 1, 1].into_iter();
        for _ in 0..3 {
            let before = logs.count(channels::ALERTS);
            h.worker.tick().await;
            assert_eq!(logs.count(channels::ALERTS) - before, expected.next().unwrap());
        }

        h.online.store(false, Ordering::SeqCst);
        let before = logs.count(channels::ALERTS);
        assert_eq!(h.worker.tick().await.outcome, TickOutcome::Buffered);
        assert_eq!(logs.count(channels::ALERTS) - before, expected.next().unwrap());
        assert!(
            logs.0
                .lock()
                .iter()
                .filter(|(_, t, _)| t == channels::ALERTS)
                .all(|(_, _, level)| *level == log::Level::Warn)
        );
    }

    #[tokio::test]
    async fn test_alert_threshold() {
        let source = ScriptedSource::new().with_temperatures(&[35.0, 34.99, 39.5, 20.0]);
        let mut h = Harness::with_source(source);
        h.session.script(vec![Ok(()), Ok(()), transient()]);

        assert!(h.worker.tick().await.alerted);
        assert!(!h.worker.tick().await.alerted);
        let report = h.worker.tick().await;
        assert!(report.alerted);
        assert_eq!(report.outcome, TickOutcome::Buffered);
        assert!(!h.worker.tick().await.alerted);
        assert_eq!(h.worker.stats().alerts, 2);
    }

    // =====================================================
    // Run loop
    // =====================================================

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_disconnects() {
        let cancel = CancellationToken::new();
        let mut source = ScriptedSource::new();
        source.stop_after = Some((3, cancel.clone()));
        let mut h = Harness::with_source(source);

        h.worker.run(Duration::from_millis(5), cancel).await;

        assert_eq!(h.worker.stats().ticks, 3);
        let log = h.session.0.lock();
        assert_eq!(log.sent.len(), 3);
        assert!(!log.connected);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test]
    async fn test_run_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut h = Harness::new();
        h.worker.run(Duration::from_secs(60), cancel).await;
        assert_eq!(h.worker.stats().ticks, 0);
    }
}
