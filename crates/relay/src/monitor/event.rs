use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, info};
use url::Url;

use crate::config::{EventMonitorConfig, RelayConfig};
use crate::fetch::Fetcher;
use crate::monitor::engine::Monitor;
use crate::monitor::events::MonitorEvent;
use crate::monitor::selection::{SelectionContext, SelectionPolicy};
use crate::playlist::{Playlist, Segment};

/// Decides whether a queued segment still needs to be fetched.
pub type Admission = Arc<dyn Fn(&Segment) -> bool + Send + Sync>;

/// Queue-driven selection for event streams.
///
/// Newly observed segments are queued as pending. Polling is suspended
/// while `pending_max` segments wait, which bounds how far ahead of the
/// downloads the monitor reads.
pub struct EventSelection {
    pending_max: usize,
    window_size: usize,
    pending: VecDeque<Segment>,
    admission: Admission,
    paused: bool,
    suspended: bool,
    ended: bool,
}

impl fmt::Debug for EventSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSelection")
            .field("pending", &self.pending.len())
            .field("paused", &self.paused)
            .field("suspended", &self.suspended)
            .field("ended", &self.ended)
            .finish()
    }
}

impl EventSelection {
    pub fn new(config: &EventMonitorConfig, admission: Admission) -> Self {
        Self {
            pending_max: config.pending_max.max(1),
            window_size: config.window_size.max(1),
            pending: VecDeque::new(),
            admission,
            paused: false,
            suspended: false,
            ended: false,
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &Segment> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn remove_pending(&mut self, name: &str) {
        self.pending.retain(|s| s.name() != name);
    }

    fn resume_from_pending(&mut self, ctx: &mut SelectionContext<'_>) {
        if self.suspended && self.pending.len() < self.pending_max {
            debug!(pending = self.pending.len(), "resuming playlist polling");
            self.suspended = false;
            ctx.rearm();
        }
    }
}

impl SelectionPolicy for EventSelection {
    fn on_playlist(&mut self, playlist: &Arc<Playlist>, ctx: &mut SelectionContext<'_>) {
        let added = ctx.ledger_mut().merge(playlist);
        ctx.ledger_mut().trim_known(self.window_size);
        if added.is_empty() {
            return;
        }
        debug!(added = added.len(), pending = self.pending.len(), "queued event segments");
        self.pending.extend(added.iter().cloned());
        ctx.emit(MonitorEvent::SegmentsPushed(added));
    }

    fn select(&mut self, ctx: &mut SelectionContext<'_>) {
        if self.paused {
            return;
        }
        let mut ignored = Vec::new();
        for segment in &self.pending {
            if ctx.is_full() {
                break;
            }
            if ctx.ledger().is_in_flight(segment.name()) {
                continue;
            }
            if (self.admission)(segment) {
                ctx.download(segment);
            } else {
                ignored.push(segment.name().to_owned());
            }
        }
        if !ignored.is_empty() {
            debug!(ignored = ignored.len(), "skipping segments that need no fetch");
            self.pending.retain(|s| !ignored.iter().any(|name| name == s.name()));
            self.resume_from_pending(ctx);
            ctx.rerun();
        }
    }

    fn should_continue_polling(
        &mut self,
        playlist: Option<&Arc<Playlist>>,
        ctx: &mut SelectionContext<'_>,
    ) -> bool {
        if let Some(playlist) = playlist
            && playlist.is_ended()
            && !self.ended
        {
            info!(segments = playlist.segments().len(), "upstream event playlist ended");
            self.ended = true;
            ctx.emit(MonitorEvent::PlaylistEnded(Arc::clone(playlist)));
        }
        if self.pending.len() >= self.pending_max {
            self.suspended = true;
        }
        !self.suspended && !self.ended
    }

    fn may_poll(&self) -> bool {
        !self.ended && !self.paused && self.pending.len() < self.pending_max
    }

    fn is_finished(&self) -> bool {
        self.ended
    }

    fn on_segment_received(&mut self, segment: &Segment, _ctx: &mut SelectionContext<'_>) {
        self.remove_pending(segment.name());
    }

    fn on_segment_failed(
        &mut self,
        segment: &Segment,
        _status: Option<StatusCode>,
        _ctx: &mut SelectionContext<'_>,
    ) {
        self.remove_pending(segment.name());
    }

    fn on_segment_finished(&mut self, _segment: &Segment, ctx: &mut SelectionContext<'_>) {
        self.resume_from_pending(ctx);
    }
}

impl Monitor<EventSelection> {
    pub fn event(
        playlist_url: Url,
        config: &RelayConfig,
        fetcher: Arc<dyn Fetcher>,
        admission: Admission,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<MonitorEvent>) {
        Self::new(
            playlist_url,
            &config.monitor,
            &config.http,
            fetcher,
            EventSelection::new(&config.event_monitor, admission),
        )
    }

    /// Stops polling and starting new fetches. Fetches already running
    /// complete normally.
    pub fn pause(&self) {
        let newly = self.update(|policy, _| !std::mem::replace(&mut policy.paused, true));
        if newly {
            debug!("event monitor paused");
            self.stop();
        }
    }

    /// Undoes [`pause`](Self::pause) and fetches pending segments right away.
    pub fn resume(&self) {
        let resumed = self.update(|policy, _| std::mem::replace(&mut policy.paused, false));
        if !resumed {
            return;
        }
        debug!("event monitor resumed");
        self.start();
        self.update(|policy, ctx| {
            if !policy.pending.is_empty() {
                policy.select(ctx);
            }
        });
    }

    pub fn is_paused(&self) -> bool {
        self.inspect(|policy, _| policy.is_paused())
    }
}
