use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span};

use crate::config::RelayConfig;
use crate::error::{RelayError, StreamErrorKind};
use crate::fetch::Fetcher;
use crate::monitor::{LiveMonitor, Monitor, MonitorEvent};
use crate::provider::{CacheProvider, LiveProvider};
use crate::relay::{RelayCore, RelayService, StreamEvent, fail_with, parse_source};

/// Relays a live stream: a rolling window of the newest segments.
pub struct LiveRelay {
    core: RelayCore,
    monitor: LiveMonitor,
    provider: LiveProvider,
}

impl LiveRelay {
    /// Starts monitoring `source`. Notifications arrive on the returned
    /// receiver.
    pub fn start(
        source: &str,
        config: RelayConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>), RelayError> {
        let url = parse_source(source)?;
        let (core, notifications) = RelayCore::new(&config);
        let (monitor, monitor_events) = Monitor::live(url, &config, fetcher);
        let relay = Arc::new(Self {
            core,
            monitor,
            provider: CacheProvider::live(&config),
        });

        info!(source, "starting live relay");
        let span = info_span!("live_relay", source);
        tokio::spawn(Arc::clone(&relay).pump(monitor_events).instrument(span));
        relay.monitor.start();
        Ok((relay, notifications))
    }

    pub fn provider(&self) -> &LiveProvider {
        &self.provider
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Copies every segment into `dir` while the relay runs.
    pub fn start_recording(&self, dir: impl Into<PathBuf>) -> Result<(), RelayError> {
        self.provider.start_mirroring(dir)
    }

    pub fn stop_recording(&self) {
        self.provider.stop_mirroring();
    }

    /// Waits until every recorded segment has reached disk.
    pub async fn flush(&self) {
        self.provider.flush_mirror().await;
    }

    async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MonitorEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.core.token().cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else { break };
            self.handle(event);
        }
        debug!("live relay pump exited");
    }

    fn handle(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::PlaylistUpdated(playlist) => {
                if playlist.is_empty() && !playlist.is_ended() {
                    self.check(self.core.playlist_failed(Some(StatusCode::OK), true));
                    return;
                }
                self.core.playlist_updated();
                self.provider.set_target_duration(playlist.target_duration());
            }
            MonitorEvent::PlaylistUnchanged => self.check(self.core.playlist_unchanged()),
            MonitorEvent::PlaylistFailed { status, .. } => {
                let empty = status == Some(StatusCode::OK);
                self.check(self.core.playlist_failed(status, empty));
            }
            MonitorEvent::SegmentPushed(segment) => {
                self.provider.push(segment);
            }
            MonitorEvent::SegmentReceived { segment, data } => {
                self.provider.fill(&segment, data);
                if self.provider.is_buffer_enough() {
                    self.core.notify_ready();
                }
            }
            MonitorEvent::SegmentFailed { segment, .. } | MonitorEvent::SegmentDropped(segment) => {
                self.provider.drop_segment(&segment);
            }
            MonitorEvent::SegmentsPushed(_) | MonitorEvent::PlaylistEnded(_) => {}
        }
    }

    fn check(&self, failure: Option<StreamErrorKind>) {
        if let Some(kind) = failure {
            fail_with(&self.core, kind, || self.stop());
        }
    }
}

impl RelayService for LiveRelay {
    fn output_playlist(&self) -> Option<String> {
        if !self.core.is_running() {
            return None;
        }
        self.core.touch();
        self.provider.refresh_playlist()
    }

    fn output_segment(&self, name: &str) -> Option<Bytes> {
        self.provider.provide_segment(name)
    }

    fn stop(&self) {
        if !self.core.shut_down() {
            return;
        }
        self.monitor.shutdown();
        self.provider.clean_up();
        info!("live relay stopped");
    }
}
