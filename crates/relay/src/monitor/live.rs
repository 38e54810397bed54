use std::sync::Arc;

use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::config::{LiveMonitorConfig, RelayConfig};
use crate::fetch::Fetcher;
use crate::monitor::engine::Monitor;
use crate::monitor::events::MonitorEvent;
use crate::monitor::selection::{SelectionContext, SelectionPolicy};
use crate::playlist::{Playlist, Segment};

/// Sliding-window selection for live streams.
///
/// Only the newest `window_size` segments are tracked. When the oldest
/// unfetched segment is older than the server is assumed to retain, the
/// gap is skipped and only the newest `catch_up_size` segments are fetched.
#[derive(Debug)]
pub struct LiveSelection {
    window_size: usize,
    alive_size: usize,
    catch_up_size: usize,
    fall_behind: bool,
}

impl LiveSelection {
    pub fn new(config: &LiveMonitorConfig) -> Self {
        Self {
            window_size: config.window_size.max(1),
            alive_size: config.alive_size,
            catch_up_size: config.catch_up_size,
            fall_behind: false,
        }
    }

    pub fn is_falling_behind(&self) -> bool {
        self.fall_behind
    }

    fn download_from(&self, segments: &[Segment], ctx: &mut SelectionContext<'_>) {
        for segment in segments {
            if ctx.is_full() {
                break;
            }
            if ctx.ledger().has_started(segment.name()) {
                continue;
            }
            if ctx.download(segment) {
                ctx.emit(MonitorEvent::SegmentPushed(segment.clone()));
            }
        }
    }
}

impl SelectionPolicy for LiveSelection {
    fn on_playlist(&mut self, playlist: &Arc<Playlist>, ctx: &mut SelectionContext<'_>) {
        let added = ctx.ledger_mut().merge(playlist);
        if !added.is_empty() {
            debug!(added = added.len(), "new live segments");
        }
    }

    fn select(&mut self, ctx: &mut SelectionContext<'_>) {
        for evicted in ctx.ledger_mut().trim_known(self.window_size) {
            if ctx.ledger_mut().cancel(evicted.name()) {
                ctx.emit(MonitorEvent::SegmentDropped(evicted));
            }
        }

        let valid = if self.fall_behind {
            self.catch_up_size
        } else {
            self.alive_size
        };
        let known: Vec<Segment> = ctx.ledger().known().iter().cloned().collect();
        let len = known.len();

        // Fetches older than the valid radius will not be served in time.
        for stale in &known[..len.saturating_sub(valid)] {
            if ctx.ledger_mut().cancel(stale.name()) {
                debug!(segment = %stale.name(), "cancelled stale fetch");
                ctx.emit(MonitorEvent::SegmentDropped(stale.clone()));
            }
        }

        if ctx.is_full() {
            return;
        }

        if ctx.ledger().started_len() == 0 {
            self.download_from(&known, ctx);
        } else {
            let idx = (0..len)
                .rev()
                .take_while(|&i| !ctx.ledger().has_started(known[i].name()))
                .last();
            if let Some(idx) = idx {
                if idx as isize >= len as isize - valid as isize {
                    self.download_from(&known[idx..], ctx);
                } else {
                    debug!(
                        gap = len - idx,
                        catch_up = self.catch_up_size,
                        "fell behind live edge, skipping ahead"
                    );
                    let from = len.saturating_sub(self.catch_up_size);
                    self.download_from(&known[from..], ctx);
                }
            }
        }
        self.fall_behind = false;
    }

    fn on_segment_failed(
        &mut self,
        segment: &Segment,
        status: Option<StatusCode>,
        _ctx: &mut SelectionContext<'_>,
    ) {
        if status == Some(StatusCode::NOT_FOUND) {
            debug!(segment = %segment.name(), "segment already recycled upstream");
            self.fall_behind = true;
        }
    }
}

impl Monitor<LiveSelection> {
    pub fn live(
        playlist_url: Url,
        config: &RelayConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<MonitorEvent>) {
        Self::new(
            playlist_url,
            &config.monitor,
            &config.http,
            fetcher,
            LiveSelection::new(&config.live_monitor),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::fetch::testing::FakeFetcher;
    use crate::monitor::engine::MonitorState;
    use crate::monitor::selection::FetchLedger;

    const BASE: &str = "http://upstream.test/live/";

    fn playlist_text(range: std::ops::Range<u32>) -> String {
        let mut text = format!("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{}\n", range.start);
        for i in range {
            text.push_str(&format!("#EXTINF:2.0,\ns{i}.ts\n"));
        }
        text
    }

    fn names(segments: &[Segment]) -> Vec<String> {
        segments.iter().map(|s| s.name().to_owned()).collect()
    }

    async fn next_event(rx: &mut UnboundedReceiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for monitor event")
            .expect("monitor channel closed")
    }

    #[test]
    fn fresh_start_downloads_from_head_up_to_cap() {
        let root = CancellationToken::new();
        let mut ledger = FetchLedger::new();
        let mut policy = LiveSelection::new(&LiveMonitorConfig::default());
        let playlist = Arc::new(Playlist::parse(&playlist_text(0..4)));

        let mut ctx = SelectionContext::new(&mut ledger, 3, &root);
        policy.on_playlist(&playlist, &mut ctx);
        policy.select(&mut ctx);
        let requested: Vec<_> = ctx.requests.iter().map(|r| r.segment.name().to_owned()).collect();
        assert_eq!(requested, ["s0.ts", "s1.ts", "s2.ts"]);
        assert_eq!(ctx.events.len(), 3);
    }

    #[test]
    fn not_found_triggers_catch_up_to_tail() {
        let root = CancellationToken::new();
        let mut ledger = FetchLedger::new();
        let mut policy = LiveSelection::new(&LiveMonitorConfig::default());
        let playlist = Arc::new(Playlist::parse(&playlist_text(0..10)));

        // s0..s4 started; s0..s3 completed, s4 still in flight
        let mut ctx = SelectionContext::new(&mut ledger, 5, &root);
        policy.on_playlist(&playlist, &mut ctx);
        policy.select(&mut ctx);
        let requests = std::mem::take(&mut ctx.requests);
        drop(ctx);
        assert_eq!(requests.len(), 5);
        for request in &requests[..4] {
            assert!(ledger.complete(request.segment.name(), request.id));
        }

        // s4 comes back 404
        assert!(ledger.complete(requests[4].segment.name(), requests[4].id));
        let mut ctx = SelectionContext::new(&mut ledger, 3, &root);
        policy.on_segment_failed(&requests[4].segment, Some(StatusCode::NOT_FOUND), &mut ctx);
        assert!(policy.is_falling_behind());

        policy.select(&mut ctx);
        let requested: Vec<_> = ctx.requests.iter().map(|r| r.segment.name().to_owned()).collect();
        assert_eq!(requested, ["s8.ts", "s9.ts"]);
        assert!(!policy.is_falling_behind());
    }

    #[test]
    fn window_is_bounded_and_evicted_fetches_are_dropped() {
        let root = CancellationToken::new();
        let mut ledger = FetchLedger::new();
        let mut policy = LiveSelection::new(&LiveMonitorConfig::default());

        let mut ctx = SelectionContext::new(&mut ledger, 3, &root);
        policy.on_playlist(&Arc::new(Playlist::parse(&playlist_text(0..3))), &mut ctx);
        policy.select(&mut ctx);
        assert_eq!(ctx.requests.len(), 3);
        ctx.events.clear();

        policy.on_playlist(&Arc::new(Playlist::parse(&playlist_text(0..14))), &mut ctx);
        policy.select(&mut ctx);
        assert_eq!(ctx.ledger().known_len(), 10);

        let dropped: Vec<_> = ctx
            .events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::SegmentDropped(s) => Some(s.name().to_owned()),
                _ => None,
            })
            .collect();
        assert_eq!(dropped, ["s0.ts", "s1.ts", "s2.ts"]);
        assert!(ctx.requests[..3].iter().all(|r| r.token.is_cancelled()));
    }

    #[tokio::test]
    async fn polls_and_fetches_segments() {
        let fetcher = FakeFetcher::new();
        let playlist_url = format!("{BASE}index.m3u8");
        fetcher.respond_body(&playlist_url, playlist_text(0..2));
        fetcher.respond_body(&format!("{BASE}s0.ts"), "zero");
        fetcher.respond_body(&format!("{BASE}s1.ts"), "one");

        let (monitor, mut rx) = Monitor::live(
            Url::parse(&playlist_url).unwrap(),
            &RelayConfig::default(),
            fetcher.clone(),
        );
        monitor.start();
        assert_eq!(monitor.state(), MonitorState::Polling);

        assert!(matches!(next_event(&mut rx).await, MonitorEvent::PlaylistUpdated(p) if p.segments().len() == 2));

        let mut pushed = Vec::new();
        let mut received = Vec::new();
        while received.len() < 2 {
            match next_event(&mut rx).await {
                MonitorEvent::SegmentPushed(s) => pushed.push(s),
                MonitorEvent::SegmentReceived { segment, data } => {
                    assert!(!data.is_empty());
                    received.push(segment);
                }
                _ => {}
            }
        }
        assert_eq!(names(&pushed), ["s0.ts", "s1.ts"]);
        received.sort_by_key(Segment::sequence);
        assert_eq!(names(&received), ["s0.ts", "s1.ts"]);
        assert_eq!(monitor.in_flight_count(), 0);

        // identical body on the next poll
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::PlaylistUnchanged));

        monitor.shutdown();
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(fetcher.request_count(&format!("{BASE}s0.ts")), 1);
    }

    #[tokio::test]
    async fn failed_playlist_keeps_polling() {
        let fetcher = FakeFetcher::new();
        let playlist_url = format!("{BASE}index.m3u8");
        fetcher.respond_status(&playlist_url, 500);

        let mut config = RelayConfig::default();
        config.monitor.default_poll_interval = Duration::from_millis(20);
        let (monitor, mut rx) =
            Monitor::live(Url::parse(&playlist_url).unwrap(), &config, fetcher.clone());
        monitor.start();

        for _ in 0..2 {
            match next_event(&mut rx).await {
                MonitorEvent::PlaylistFailed { status, .. } => {
                    assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
                }
                other => panic!("unexpected event {}", other.name()),
            }
        }
        monitor.stop();
        assert!(fetcher.request_count(&playlist_url) >= 2);
    }

    #[tokio::test]
    async fn segment_query_is_appended() {
        let fetcher = FakeFetcher::new();
        let playlist_url = format!("{BASE}index.m3u8");
        fetcher.respond_body(&format!("{playlist_url}?p=1"), playlist_text(0..1));
        fetcher.respond_body(&format!("{BASE}s0.ts?t=2"), "zero");

        let mut config = RelayConfig::default();
        config.http.playlist_query = vec![("p".into(), "1".into())];
        config.http.segment_query = vec![("t".into(), "2".into())];
        let (monitor, mut rx) =
            Monitor::live(Url::parse(&playlist_url).unwrap(), &config, fetcher.clone());
        monitor.start();

        loop {
            if let MonitorEvent::SegmentReceived { segment, .. } = next_event(&mut rx).await {
                assert_eq!(segment.name(), "s0.ts");
                break;
            }
        }
        monitor.shutdown();
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_fetches() {
        let fetcher = FakeFetcher::new();
        let playlist_url = format!("{BASE}index.m3u8");
        fetcher.respond_body(&playlist_url, playlist_text(0..1));
        fetcher.respond_body(&format!("{BASE}s0.ts"), "zero");
        fetcher.delay(&format!("{BASE}s0.ts"), Duration::from_secs(30));

        let (monitor, mut rx) = Monitor::live(
            Url::parse(&playlist_url).unwrap(),
            &RelayConfig::default(),
            fetcher.clone(),
        );
        monitor.start();
        loop {
            if let MonitorEvent::SegmentPushed(_) = next_event(&mut rx).await {
                break;
            }
        }
        assert_eq!(monitor.in_flight_count(), 1);
        monitor.shutdown();
        assert_eq!(monitor.in_flight_count(), 0);

        // no completion is delivered for the cancelled fetch
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, MonitorEvent::SegmentReceived { .. }));
        }
    }

    #[tokio::test]
    async fn missing_segment_fails_once_and_is_not_retried() {
        let fetcher = FakeFetcher::new();
        let playlist_url = format!("{BASE}index.m3u8");
        fetcher.respond_body(&playlist_url, playlist_text(0..3));
        fetcher.respond_body(&format!("{BASE}s0.ts"), "zero");
        fetcher.respond_body(&format!("{BASE}s2.ts"), "two");
        fetcher.delay(&format!("{BASE}s1.ts"), Duration::from_millis(50));

        let mut config = RelayConfig::default();
        config.monitor.default_poll_interval = Duration::from_millis(20);
        let (monitor, mut rx) =
            Monitor::live(Url::parse(&playlist_url).unwrap(), &config, fetcher.clone());
        monitor.start();

        let mut failed = Vec::new();
        let mut received = Vec::new();
        while failed.is_empty() || received.len() < 2 {
            match next_event(&mut rx).await {
                MonitorEvent::SegmentFailed { segment, status } => {
                    assert_eq!(status, Some(StatusCode::NOT_FOUND));
                    failed.push(segment);
                }
                MonitorEvent::SegmentReceived { segment, .. } => received.push(segment),
                _ => {}
            }
        }
        assert_eq!(names(&failed), ["s1.ts"]);
        received.sort_by_key(Segment::sequence);
        assert_eq!(names(&received), ["s0.ts", "s2.ts"]);

        // later polls see the same playlist and leave the recycled segment alone
        loop {
            if let MonitorEvent::PlaylistUnchanged = next_event(&mut rx).await {
                break;
            }
        }
        assert_eq!(fetcher.request_count(&format!("{BASE}s1.ts")), 1);
        assert_eq!(monitor.in_flight_count(), 0);
        assert!(!monitor.inspect(|policy, _| policy.is_falling_behind()));
        monitor.shutdown();
    }

    #[tokio::test]
    async fn oversized_target_duration_falls_back_to_default_interval() {
        let fetcher = FakeFetcher::new();
        let playlist_url = format!("{BASE}index.m3u8");
        fetcher.respond_body(
            &playlist_url,
            "#EXTM3U\n#EXT-X-TARGETDURATION:1e20\n#EXTINF:2.0,\ns0.ts\n",
        );
        fetcher.respond_body(&format!("{BASE}s0.ts"), "zero");

        let mut config = RelayConfig::default();
        config.monitor.default_poll_interval = Duration::from_millis(20);
        let (monitor, mut rx) =
            Monitor::live(Url::parse(&playlist_url).unwrap(), &config, fetcher.clone());
        monitor.start();

        assert!(matches!(next_event(&mut rx).await, MonitorEvent::PlaylistUpdated(_)));
        loop {
            if let MonitorEvent::PlaylistUnchanged = next_event(&mut rx).await {
                break;
            }
        }
        assert_eq!(monitor.state(), MonitorState::Polling);
        assert!(fetcher.request_count(&playlist_url) >= 2);
        monitor.shutdown();
    }
}
