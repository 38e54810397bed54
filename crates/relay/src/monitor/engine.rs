use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};
use url::Url;

use crate::config::{HttpConfig, MonitorConfig};
use crate::error::RelayError;
use crate::fetch::{FetchOutcome, Fetcher, with_query};
use crate::monitor::events::MonitorEvent;
use crate::monitor::selection::{FetchLedger, FetchRequest, SelectionContext, SelectionPolicy};
use crate::playlist::{Playlist, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Polling,
}

/// Polls an upstream playlist and fetches its segments, with the choice of
/// segments delegated to a [`SelectionPolicy`].
///
/// Cloning yields another handle to the same monitor.
pub struct Monitor<P: SelectionPolicy> {
    shared: Arc<Shared<P>>,
}

impl<P: SelectionPolicy> Clone for Monitor<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<P> {
    playlist_url: Url,
    concurrent_download_max: usize,
    default_poll_interval: Duration,
    playlist_query: Vec<(String, String)>,
    segment_query: Vec<(String, String)>,
    fetcher: Arc<dyn Fetcher>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    rearm: Notify,
    /// Parent of every session and fetch token; cancelled on shutdown.
    root: CancellationToken,
    inner: Mutex<Inner<P>>,
}

struct Inner<P> {
    state: MonitorState,
    session: Option<CancellationToken>,
    playlist: Option<Arc<Playlist>>,
    last_body: Option<Bytes>,
    ledger: FetchLedger,
    policy: P,
}

enum Next {
    After(Duration),
    Park,
    Exit,
}

impl<P: SelectionPolicy> Monitor<P> {
    pub fn new(
        playlist_url: Url,
        config: &MonitorConfig,
        http: &HttpConfig,
        fetcher: Arc<dyn Fetcher>,
        policy: P,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            playlist_url,
            concurrent_download_max: config.concurrent_download_max.max(1),
            default_poll_interval: config.default_poll_interval,
            playlist_query: http.playlist_query.clone(),
            segment_query: http.segment_query.clone(),
            fetcher,
            events: tx,
            rearm: Notify::new(),
            root: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: MonitorState::Idle,
                session: None,
                playlist: None,
                last_body: None,
                ledger: FetchLedger::new(),
                policy,
            }),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    pub fn playlist_url(&self) -> &Url {
        &self.shared.playlist_url
    }

    pub fn state(&self) -> MonitorState {
        self.shared.inner.lock().state
    }

    /// Latest parsed upstream playlist.
    pub fn playlist(&self) -> Option<Arc<Playlist>> {
        self.shared.inner.lock().playlist.clone()
    }

    pub fn known_segments(&self) -> Vec<Segment> {
        self.shared.inner.lock().ledger.known().iter().cloned().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.inner.lock().ledger.in_flight_len()
    }

    /// Read-only view of the policy and ledger.
    pub fn inspect<R>(&self, f: impl FnOnce(&P, &FetchLedger) -> R) -> R {
        let inner = self.shared.inner.lock();
        f(&inner.policy, &inner.ledger)
    }

    /// Starts polling. No-op while already polling or after shutdown.
    pub fn start(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state == MonitorState::Polling || self.shared.root.is_cancelled() {
            return;
        }
        let token = self.shared.root.child_token();
        inner.session = Some(token.clone());
        inner.state = MonitorState::Polling;
        drop(inner);

        info!(url = %self.shared.playlist_url, "monitor started");
        let monitor = self.clone();
        let span = info_span!("monitor", url = %self.shared.playlist_url);
        tokio::spawn(async move { monitor.poll_loop(token).await }.instrument(span));
    }

    /// Stops polling and cancels the pending playlist request. Segment
    /// fetches already running are left to finish.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        if let Some(token) = inner.session.take() {
            token.cancel();
            debug!(url = %self.shared.playlist_url, "monitor stopped");
        }
        inner.state = MonitorState::Idle;
    }

    /// Stops polling and cancels every fetch. The monitor cannot be
    /// restarted afterwards.
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock();
        if let Some(token) = inner.session.take() {
            token.cancel();
        }
        inner.state = MonitorState::Idle;
        inner.ledger.cancel_all();
        self.shared.root.cancel();
    }

    /// Starts fetching `segment` if a slot is free.
    pub fn download_segment(&self, segment: &Segment) -> bool {
        self.update(|_, ctx| ctx.download(segment))
    }

    /// Runs `f` against the policy under the monitor lock and dispatches
    /// whatever it queued.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut P, &mut SelectionContext<'_>) -> R) -> R {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        self.run_hooks(&mut inner.ledger, &mut inner.policy, f)
    }

    fn run_hooks<R>(
        &self,
        ledger: &mut FetchLedger,
        policy: &mut P,
        f: impl FnOnce(&mut P, &mut SelectionContext<'_>) -> R,
    ) -> R {
        let mut ctx = SelectionContext::new(
            ledger,
            self.shared.concurrent_download_max,
            &self.shared.root,
        );
        let out = f(policy, &mut ctx);
        while std::mem::take(&mut ctx.rerun) {
            policy.select(&mut ctx);
        }
        let (requests, events, rearm) = ctx.into_parts();
        for event in events {
            let _ = self.shared.events.send(event);
        }
        for request in requests {
            self.spawn_fetch(request);
        }
        if rearm {
            self.shared.rearm.notify_one();
        }
        out
    }

    fn segment_url(&self, locator: &str) -> Result<Url, RelayError> {
        let url = self
            .shared
            .playlist_url
            .join(locator)
            .map_err(|e| RelayError::invalid_url(locator, e.to_string()))?;
        Ok(with_query(&url, &self.shared.segment_query))
    }

    fn spawn_fetch(&self, request: FetchRequest) {
        let url = self.segment_url(request.segment.locator());
        let monitor = self.clone();
        tokio::spawn(
            async move {
                let FetchRequest { segment, id, token } = request;
                let outcome = match url {
                    Ok(url) => {
                        trace!(segment = %segment.name(), url = %url, "fetching segment");
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => FetchOutcome::Cancelled,
                            outcome = monitor.shared.fetcher.fetch(&url) => outcome,
                        }
                    }
                    Err(e) => FetchOutcome::failed(None, e.to_string()),
                };
                monitor.complete_segment(segment, id, outcome);
            }
            .in_current_span(),
        );
    }

    fn complete_segment(&self, segment: Segment, id: u64, outcome: FetchOutcome) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if !inner.ledger.complete(segment.name(), id) {
            trace!(segment = %segment.name(), "discarding result of cancelled fetch");
            return;
        }
        let (status, reason) = match outcome {
            FetchOutcome::Cancelled => return,
            FetchOutcome::Success(data) if !data.is_empty() => {
                debug!(segment = %segment.name(), bytes = data.len(), "segment received");
                let accepting = !self.shared.root.is_cancelled();
                self.run_hooks(&mut inner.ledger, &mut inner.policy, |policy, ctx| {
                    ctx.emit(MonitorEvent::SegmentReceived {
                        segment: segment.clone(),
                        data,
                    });
                    policy.on_segment_received(&segment, ctx);
                    finish_segment(policy, &segment, ctx, accepting);
                });
                return;
            }
            FetchOutcome::Success(_) => (Some(StatusCode::OK), "empty body".to_owned()),
            FetchOutcome::Failed { status, reason } => (status, reason),
        };

        warn!(segment = %segment.name(), status = ?status, %reason, "segment fetch failed");
        let accepting = !self.shared.root.is_cancelled();
        self.run_hooks(&mut inner.ledger, &mut inner.policy, |policy, ctx| {
            ctx.emit(MonitorEvent::SegmentFailed {
                segment: segment.clone(),
                status,
            });
            policy.on_segment_failed(&segment, status, ctx);
            finish_segment(policy, &segment, ctx, accepting);
        });
    }

    async fn poll_loop(self, token: CancellationToken) {
        loop {
            if !self.wait_until_pollable(&token).await {
                break;
            }

            let started = Instant::now();
            let url = with_query(&self.shared.playlist_url, &self.shared.playlist_query);
            trace!(url = %url, "requesting playlist");
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outcome = self.shared.fetcher.fetch(&url) => outcome,
            };

            match self.handle_playlist(outcome, &token) {
                Next::After(delay) => {
                    let delay = delay.saturating_sub(started.elapsed());
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Next::Park => debug!("polling parked"),
                Next::Exit => break,
            }
        }
        debug!("poll loop exited");
    }

    /// Waits until the policy allows a playlist request. Returns `false`
    /// when the loop should exit instead.
    async fn wait_until_pollable(&self, token: &CancellationToken) -> bool {
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if token.is_cancelled() {
                    return false;
                }
                if inner.policy.is_finished() {
                    inner.state = MonitorState::Idle;
                    inner.session = None;
                    info!("monitor finished");
                    return false;
                }
                if inner.policy.may_poll() {
                    return true;
                }
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = self.shared.rearm.notified() => {}
            }
        }
    }

    fn handle_playlist(&self, outcome: FetchOutcome, token: &CancellationToken) -> Next {
        let mut guard = self.shared.inner.lock();
        if token.is_cancelled() {
            return Next::Exit;
        }
        let Inner {
            ledger,
            policy,
            playlist,
            last_body,
            ..
        } = &mut *guard;
        let default = self.shared.default_poll_interval;

        match outcome {
            FetchOutcome::Cancelled => Next::Exit,
            FetchOutcome::Success(body) if !body.is_empty() && last_body.as_ref() == Some(&body) => {
                trace!("playlist unchanged");
                let current = playlist.clone();
                let delay = poll_interval(current.as_deref(), default) / 2;
                let keep = self.run_hooks(ledger, policy, |policy, ctx| {
                    ctx.emit(MonitorEvent::PlaylistUnchanged);
                    policy.should_continue_polling(current.as_ref(), ctx)
                });
                next_poll(keep, delay)
            }
            FetchOutcome::Success(body) if !body.is_empty() => {
                let parsed = Arc::new(Playlist::parse(&String::from_utf8_lossy(&body)));
                debug!(
                    segments = parsed.segments().len(),
                    ended = parsed.is_ended(),
                    "playlist updated"
                );
                *playlist = Some(Arc::clone(&parsed));
                *last_body = Some(body);
                let delay = poll_interval(Some(parsed.as_ref()), default);
                let keep = self.run_hooks(ledger, policy, |policy, ctx| {
                    ctx.emit(MonitorEvent::PlaylistUpdated(Arc::clone(&parsed)));
                    policy.on_playlist(&parsed, ctx);
                    policy.select(ctx);
                    policy.should_continue_polling(Some(&parsed), ctx)
                });
                next_poll(keep, delay)
            }
            FetchOutcome::Success(_) => self.playlist_failed(
                ledger,
                policy,
                playlist,
                Some(StatusCode::OK),
                "empty playlist body".to_owned(),
            ),
            FetchOutcome::Failed { status, reason } => {
                self.playlist_failed(ledger, policy, playlist, status, reason)
            }
        }
    }

    fn playlist_failed(
        &self,
        ledger: &mut FetchLedger,
        policy: &mut P,
        playlist: &Option<Arc<Playlist>>,
        status: Option<StatusCode>,
        reason: String,
    ) -> Next {
        warn!(status = ?status, %reason, "playlist request failed");
        let delay = poll_interval(playlist.as_deref(), self.shared.default_poll_interval);
        let keep = self.run_hooks(ledger, policy, |policy, ctx| {
            ctx.emit(MonitorEvent::PlaylistFailed { status, reason });
            policy.should_continue_polling(playlist.as_ref(), ctx)
        });
        next_poll(keep, delay)
    }
}

fn finish_segment<P: SelectionPolicy>(
    policy: &mut P,
    segment: &Segment,
    ctx: &mut SelectionContext<'_>,
    accepting: bool,
) {
    policy.on_segment_finished(segment, ctx);
    if accepting && !ctx.is_full() {
        policy.select(ctx);
    }
}

/// Target duration of `playlist`, or `default` when unknown or too large to
/// represent.
fn poll_interval(playlist: Option<&Playlist>, default: Duration) -> Duration {
    playlist
        .and_then(Playlist::target_duration)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}

fn next_poll(keep: bool, delay: Duration) -> Next {
    if keep { Next::After(delay) } else { Next::Park }
}
