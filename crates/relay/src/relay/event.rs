use std::sync::Arc;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span};

use crate::config::RelayConfig;
use crate::error::{RelayError, StreamErrorKind};
use crate::fetch::Fetcher;
use crate::monitor::{Admission, EventMonitor, Monitor, MonitorEvent};
use crate::playlist::Segment;
use crate::provider::{CacheProvider, EventProvider};
use crate::relay::{RelayCore, RelayService, StreamEvent, fail_with, parse_source};
use crate::storage::BlobStore;

/// Relays an event stream with its full history, persisting every segment.
///
/// Served segments are handed out once and released from memory. Downloads
/// pause while `event_cache_upper` payloads wait in memory and resume once
/// consumption brings that down to `event_cache_lower`.
pub struct EventRelay {
    core: RelayCore,
    monitor: EventMonitor,
    provider: Arc<EventProvider>,
    cache_upper: usize,
    cache_lower: usize,
}

impl EventRelay {
    pub fn start(
        source: &str,
        config: RelayConfig,
        fetcher: Arc<dyn Fetcher>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>), RelayError> {
        let url = parse_source(source)?;
        let (core, notifications) = RelayCore::new(&config);
        let provider = Arc::new(CacheProvider::event(&config, blobs));
        let admission: Admission = {
            let provider = Arc::clone(&provider);
            Arc::new(move |segment: &Segment| !provider.has_segment_data(segment.name()))
        };
        let (monitor, monitor_events) = Monitor::event(url, &config, fetcher, admission);
        let relay = Arc::new(Self {
            core,
            monitor,
            provider,
            cache_upper: config.server.event_cache_upper,
            cache_lower: config.server.event_cache_lower,
        });

        let span = info_span!("event_relay", source);
        tokio::spawn(Arc::clone(&relay).pump(monitor_events).instrument(span));
        if relay.provider.complete_preload() {
            info!(source, "event already complete in storage, not monitoring");
        } else {
            info!(source, "starting event relay");
            relay.monitor.start();
        }
        if relay.provider.is_buffer_enough() || relay.provider.complete_preload() {
            relay.core.notify_ready();
        }
        Ok((relay, notifications))
    }

    pub fn provider(&self) -> &EventProvider {
        &self.provider
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Waits until every payload and playlist revision has reached storage.
    pub async fn flush(&self) {
        self.provider.flush().await;
    }

    /// Whether downloads are held back by the cache limit.
    pub fn is_downloading_paused(&self) -> bool {
        self.monitor.is_paused()
    }

    /// Stops client idle detection, e.g. while playback is paused.
    pub fn pause_idle_timer(&self) {
        self.core.pause_idle_timer();
    }

    pub fn resume_idle_timer(&self) {
        self.core.resume_idle_timer();
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
        debug!("event relay pump exited");
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
            MonitorEvent::SegmentsPushed(segments) => self.provider.push_all(segments),
            MonitorEvent::SegmentReceived { segment, data } => {
                self.provider.fill(&segment, data);
                if self.provider.cached_count() >= self.cache_upper && !self.monitor.is_paused() {
                    debug!(cached = self.provider.cached_count(), "event cache full, pausing downloads");
                    self.monitor.pause();
                }
                if self.provider.is_buffer_enough() {
                    self.core.notify_ready();
                }
            }
            MonitorEvent::SegmentFailed { segment, .. } => {
                self.provider.drop_segment(&segment);
            }
            MonitorEvent::PlaylistEnded(playlist) => {
                self.provider.end_playlist();
                info!(segments = playlist.segments().len(), "upstream event ended");
                self.core.notify(StreamEvent::PlaylistEnded(playlist));
            }
            MonitorEvent::SegmentPushed(_) | MonitorEvent::SegmentDropped(_) => {}
        }
    }

    fn check(&self, failure: Option<StreamErrorKind>) {
        if let Some(kind) = failure {
            fail_with(&self.core, kind, || self.stop());
        }
    }
}

impl RelayService for EventRelay {
    fn output_playlist(&self) -> Option<String> {
        if !self.core.is_running() {
            return None;
        }
        self.core.touch();
        self.provider.refresh_playlist()
    }

    fn output_segment(&self, name: &str) -> Option<Bytes> {
        let data = self.provider.consume(name);
        if self.monitor.is_paused() && self.provider.cached_count() <= self.cache_lower {
            debug!(cached = self.provider.cached_count(), "event cache drained, resuming downloads");
            self.monitor.resume();
        }
        data
    }

    fn stop(&self) {
        if !self.core.shut_down() {
            return;
        }
        self.monitor.shutdown();
        self.provider.clean_up();
        info!("event relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fetch::testing::FakeFetcher;
    use crate::playlist::Playlist;
    use crate::storage::{MemoryStore, PLAYLIST_KEY};

    const BASE: &str = "http://upstream.test/event/";

    fn playlist_text(count: u32, ended: bool) -> String {
        let mut text = String::from(
            "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:EVENT\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n",
        );
        for i in 0..count {
            text.push_str(&format!("#EXTINF:1.0,\ne{i}.ts\n"));
        }
        if ended {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        text
    }

    fn serve(fetcher: &FakeFetcher, count: u32, ended: bool) -> String {
        let source = format!("{BASE}index.m3u8");
        fetcher.respond_body(&source, playlist_text(count, ended));
        for i in 0..count {
            fetcher.respond_body(&format!("{BASE}e{i}.ts"), format!("data-{i}"));
        }
        source
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("relay channel closed")
    }

    async fn wait_for_end(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Arc<Playlist> {
        loop {
            if let StreamEvent::PlaylistEnded(playlist) = next(rx).await {
                return playlist;
            }
        }
    }

    #[tokio::test]
    async fn downloads_history_persists_and_ends() {
        let fetcher = FakeFetcher::new();
        let source = serve(&fetcher, 4, true);
        let blobs = Arc::new(MemoryStore::new());

        let (relay, mut rx) =
            EventRelay::start(&source, RelayConfig::default(), fetcher.clone(), blobs.clone()).unwrap();
        let ended = wait_for_end(&mut rx).await;
        assert_eq!(ended.segments().len(), 4);

        // segments may still be in flight when the end is reported
        tokio::time::timeout(Duration::from_secs(5), async {
            while (0..4).any(|i| !blobs.exists(&format!("e{i}.ts"))) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let text = relay.output_playlist().unwrap();
        assert!(text.ends_with("#EXT-X-ENDLIST\n"));
        assert_eq!(relay.output_segment("e0.ts").unwrap(), "data-0");
        // consumed from memory, kept on storage
        assert_eq!(relay.output_segment("e0.ts"), None);
        assert!(blobs.exists("e0.ts"));
        relay.stop();
    }

    #[tokio::test]
    async fn complete_storage_replays_without_network() {
        let blobs = Arc::new(MemoryStore::new());
        blobs.save(PLAYLIST_KEY, playlist_text(3, true).as_bytes());
        for i in 0..3 {
            blobs.save(&format!("e{i}.ts"), format!("data-{i}").as_bytes());
        }
        let fetcher = FakeFetcher::new();

        let (relay, mut rx) = EventRelay::start(
            &format!("{BASE}index.m3u8"),
            RelayConfig::default(),
            fetcher.clone(),
            blobs,
        )
        .unwrap();
        assert!(relay.provider().complete_preload());
        assert!(matches!(next(&mut rx).await, StreamEvent::Ready { .. }));

        let text = relay.output_playlist().unwrap();
        assert!(text.contains("http://127.0.0.1:9999/e2.ts"));
        assert!(text.ends_with("#EXT-X-ENDLIST\n"));
        assert_eq!(relay.output_segment("e1.ts").unwrap(), "data-1");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fetcher.requests().is_empty());
        relay.stop();
    }

    #[tokio::test]
    async fn stored_segments_are_not_fetched_again() {
        let blobs = Arc::new(MemoryStore::new());
        blobs.save("e0.ts", b"stored-0");
        blobs.save("e1.ts", b"stored-1");
        let fetcher = FakeFetcher::new();
        let source = serve(&fetcher, 3, true);

        let (relay, mut rx) =
            EventRelay::start(&source, RelayConfig::default(), fetcher.clone(), blobs.clone()).unwrap();
        wait_for_end(&mut rx).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !blobs.exists("e2.ts") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(fetcher.request_count(&format!("{BASE}e0.ts")), 0);
        assert_eq!(fetcher.request_count(&format!("{BASE}e1.ts")), 0);
        assert_eq!(fetcher.request_count(&format!("{BASE}e2.ts")), 1);
        assert_eq!(relay.output_segment("e0.ts").unwrap(), "stored-0");
        relay.stop();
    }

    #[tokio::test]
    async fn downloads_pause_at_cache_limit_and_resume_on_consume() {
        let fetcher = FakeFetcher::new();
        let source = serve(&fetcher, 6, true);
        for i in 0..6 {
            fetcher.delay(&format!("{BASE}e{i}.ts"), Duration::from_millis(30));
        }
        let mut config = RelayConfig::default();
        config.server.event_cache_upper = 3;
        config.server.event_cache_lower = 3;
        config.monitor.concurrent_download_max = 1;

        let (relay, _rx) =
            EventRelay::start(&source, config, fetcher.clone(), Arc::new(MemoryStore::new())).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !relay.is_downloading_paused() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // the fetch running when the limit was hit still lands
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!((3..=4).contains(&relay.provider().cached_count()));
        assert_eq!(fetcher.request_count(&format!("{BASE}e5.ts")), 0);

        assert_eq!(relay.output_segment("e0.ts").unwrap(), "data-0");
        assert!(!relay.is_downloading_paused());
        relay.stop();
    }

    #[tokio::test]
    async fn forbidden_playlist_surfaces_access_denied() {
        let fetcher = FakeFetcher::new();
        let source = format!("{BASE}index.m3u8");
        fetcher.respond_status(&source, 403);

        let (relay, mut rx) = EventRelay::start(
            &source,
            RelayConfig::default(),
            fetcher,
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        assert!(matches!(
            next(&mut rx).await,
            StreamEvent::Failed(StreamErrorKind::AccessDenied)
        ));
        assert!(!relay.is_running());
        assert_eq!(relay.output_playlist(), None);
    }
}
