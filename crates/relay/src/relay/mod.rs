//! Relays: a monitor feeding a cache provider, exposed as a local stream.
//!
//! A relay owns the tolerance bookkeeping for its upstream, the client idle
//! timer and the notification channel towards the application.

mod event;
mod live;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::error::{RelayError, StreamErrorKind};
use crate::playlist::Playlist;

pub use event::EventRelay;
pub use live::LiveRelay;

/// What the local endpoint needs from a running relay.
pub trait RelayService: Send + Sync {
    /// Current output playlist, `None` until enough has been buffered.
    fn output_playlist(&self) -> Option<String>;

    /// Payload of the output segment `name`, if available.
    fn output_segment(&self, name: &str) -> Option<Bytes>;

    fn stop(&self);
}

/// Notifications from a relay to the application.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The output is buffered and can be played from `playlist_url`. Sent once.
    Ready { playlist_url: String },
    /// The relay gave up on its upstream and has already stopped.
    Failed(StreamErrorKind),
    PlaylistEnded(Arc<Playlist>),
    /// No playlist request arrived within the client idle timeout.
    ClientIdle,
}

pub(crate) fn parse_source(source: &str) -> Result<Url, RelayError> {
    let url = Url::parse(source).map_err(|e| RelayError::invalid_url(source, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(RelayError::invalid_url(
            source,
            format!("unsupported scheme `{scheme}`"),
        )),
    }
}

#[derive(Debug, Default)]
struct CoreState {
    ready_notified: bool,
    failures: u32,
    unchanged: u32,
    idle_timer: Option<CancellationToken>,
    idle_paused: bool,
}

/// State shared by both relay kinds.
pub(crate) struct RelayCore {
    playlist_url: String,
    failure_max: u32,
    unchanged_max: u32,
    client_idle_timeout: Duration,
    has_credentials: bool,
    events: mpsc::UnboundedSender<StreamEvent>,
    /// Cancelled once the relay stops.
    token: CancellationToken,
    state: Mutex<CoreState>,
}

impl RelayCore {
    pub(crate) fn new(config: &RelayConfig) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Self {
            playlist_url: config.server.playlist_url(),
            failure_max: config.server.playlist_failure_max,
            unchanged_max: config.server.playlist_unchanged_max,
            client_idle_timeout: config.server.client_idle_timeout,
            has_credentials: config.http.credentials.is_some(),
            events: tx,
            token: CancellationToken::new(),
            state: Mutex::new(CoreState::default()),
        };
        (core, rx)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub(crate) fn playlist_updated(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.unchanged = 0;
    }

    pub(crate) fn playlist_unchanged(&self) -> Option<StreamErrorKind> {
        let mut state = self.state.lock();
        state.failures = 0;
        state.unchanged += 1;
        (state.unchanged > self.unchanged_max).then_some(StreamErrorKind::PlaylistUnchanged)
    }

    /// Counts one failed playlist request. `empty` marks a response that
    /// succeeded without any usable content.
    pub(crate) fn playlist_failed(
        &self,
        status: Option<StatusCode>,
        empty: bool,
    ) -> Option<StreamErrorKind> {
        match status {
            Some(StatusCode::NOT_FOUND) => return Some(StreamErrorKind::PlaylistNotFound),
            Some(StatusCode::FORBIDDEN) => return Some(StreamErrorKind::AccessDenied),
            Some(StatusCode::UNAUTHORIZED) if self.has_credentials => {
                return Some(StreamErrorKind::AuthenticationFailed);
            }
            _ => {}
        }
        let mut state = self.state.lock();
        state.failures += 1;
        if state.failures <= self.failure_max {
            return None;
        }
        Some(if empty {
            StreamErrorKind::PlaylistIsEmpty
        } else {
            StreamErrorKind::PlaylistUnavailable
        })
    }

    /// Notifies `Ready` the first time it is called while running.
    pub(crate) fn notify_ready(&self) {
        if !self.is_running() {
            return;
        }
        let mut state = self.state.lock();
        if std::mem::replace(&mut state.ready_notified, true) {
            return;
        }
        info!(url = %self.playlist_url, "stream ready");
        let _ = self.events.send(StreamEvent::Ready {
            playlist_url: self.playlist_url.clone(),
        });
    }

    pub(crate) fn notify(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Marks the relay stopped. Returns `false` if it already was.
    pub(crate) fn shut_down(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        if let Some(timer) = self.state.lock().idle_timer.take() {
            timer.cancel();
        }
        true
    }

    /// Records a client playlist request: re-arms the idle timer unless it
    /// is paused.
    pub(crate) fn touch(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
        if state.idle_paused || !self.is_running() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, client idle timer not armed");
            return;
        };
        let timer = self.token.child_token();
        state.idle_timer = Some(timer.clone());
        let timeout = self.client_idle_timeout;
        let events = self.events.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!(?timeout, "client idle");
                    let _ = events.send(StreamEvent::ClientIdle);
                }
            }
        });
    }

    pub(crate) fn pause_idle_timer(&self) {
        let mut state = self.state.lock();
        state.idle_paused = true;
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
    }

    pub(crate) fn resume_idle_timer(&self) {
        self.state.lock().idle_paused = false;
        self.touch();
    }
}

/// Logs and stops on a surfaced failure. `stop` must tear the relay down
/// before the notification goes out.
pub(crate) fn fail_with(core: &RelayCore, kind: StreamErrorKind, stop: impl FnOnce()) {
    if !core.is_running() {
        return;
    }
    warn!(error = %kind, code = kind.code(), "stream failed");
    stop();
    core.notify(StreamEvent::Failed(kind));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn core(config: &RelayConfig) -> (RelayCore, mpsc::UnboundedReceiver<StreamEvent>) {
        RelayCore::new(config)
    }

    #[test]
    fn source_must_be_http() {
        assert!(parse_source("http://example.com/live.m3u8").is_ok());
        assert!(matches!(
            parse_source("not a url"),
            Err(RelayError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_source("ftp://example.com/live.m3u8"),
            Err(RelayError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn failures_are_tolerated_up_to_max() {
        let (core, _rx) = core(&RelayConfig::default());
        for _ in 0..10 {
            assert_eq!(core.playlist_failed(Some(StatusCode::BAD_GATEWAY), false), None);
        }
        assert_eq!(
            core.playlist_failed(None, false),
            Some(StreamErrorKind::PlaylistUnavailable)
        );
    }

    #[test]
    fn success_resets_counters() {
        let (core, _rx) = core(&RelayConfig::default());
        for _ in 0..10 {
            assert_eq!(core.playlist_unchanged(), None);
        }
        core.playlist_updated();
        for _ in 0..10 {
            assert_eq!(core.playlist_unchanged(), None);
        }
        assert_eq!(core.playlist_unchanged(), Some(StreamErrorKind::PlaylistUnchanged));

        for _ in 0..10 {
            core.playlist_failed(None, true);
        }
        assert_eq!(core.playlist_unchanged(), Some(StreamErrorKind::PlaylistUnchanged));
        assert_eq!(core.playlist_failed(None, true), None);
    }

    #[test]
    fn fatal_statuses_surface_immediately() {
        let (core, _rx) = core(&RelayConfig::default());
        assert_eq!(
            core.playlist_failed(Some(StatusCode::NOT_FOUND), false),
            Some(StreamErrorKind::PlaylistNotFound)
        );
        assert_eq!(
            core.playlist_failed(Some(StatusCode::FORBIDDEN), false),
            Some(StreamErrorKind::AccessDenied)
        );
        // without credentials a 401 is an ordinary failure
        assert_eq!(core.playlist_failed(Some(StatusCode::UNAUTHORIZED), false), None);

        let mut config = RelayConfig::default();
        config.http.credentials = Some(Credentials {
            username: "user".into(),
            password: "secret".into(),
        });
        let (core, _rx) = RelayCore::new(&config);
        assert_eq!(
            core.playlist_failed(Some(StatusCode::UNAUTHORIZED), false),
            Some(StreamErrorKind::AuthenticationFailed)
        );
    }

    #[test]
    fn empty_responses_surface_as_empty() {
        let mut config = RelayConfig::default();
        config.server.playlist_failure_max = 1;
        let (core, _rx) = RelayCore::new(&config);
        assert_eq!(core.playlist_failed(Some(StatusCode::OK), true), None);
        assert_eq!(
            core.playlist_failed(Some(StatusCode::OK), true),
            Some(StreamErrorKind::PlaylistIsEmpty)
        );
    }

    #[test]
    fn ready_is_sent_once_and_not_after_stop() {
        let (core, mut rx) = core(&RelayConfig::default());
        core.notify_ready();
        core.notify_ready();
        assert!(matches!(
            rx.try_recv(),
            Ok(StreamEvent::Ready { playlist_url }) if playlist_url == "http://127.0.0.1:9999/stream.m3u8"
        ));
        assert!(rx.try_recv().is_err());

        let (core, mut rx) = RelayCore::new(&RelayConfig::default());
        assert!(core.shut_down());
        assert!(!core.shut_down());
        core.notify_ready();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failure_stops_before_notifying_once() {
        let (core, mut rx) = core(&RelayConfig::default());
        let stopped = std::cell::Cell::new(0);
        fail_with(&core, StreamErrorKind::PlaylistNotFound, || {
            stopped.set(stopped.get() + 1);
            core.shut_down();
        });
        fail_with(&core, StreamErrorKind::PlaylistNotFound, || {
            stopped.set(stopped.get() + 1);
        });
        assert_eq!(stopped.get(), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(StreamEvent::Failed(StreamErrorKind::PlaylistNotFound))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fires_unless_touched_or_paused() {
        let mut config = RelayConfig::default();
        config.server.client_idle_timeout = Duration::from_secs(5);
        let (core, mut rx) = RelayCore::new(&config);

        core.touch();
        tokio::time::sleep(Duration::from_secs(3)).await;
        core.touch();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(rx.recv().await, Some(StreamEvent::ClientIdle)));

        core.pause_idle_timer();
        core.touch();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        core.resume_idle_timer();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(rx.recv().await, Some(StreamEvent::ClientIdle)));
    }
}
