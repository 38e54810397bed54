use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::monitor::events::MonitorEvent;
use crate::playlist::{Playlist, Segment};

#[derive(Debug)]
struct InFlight {
    id: u64,
    token: CancellationToken,
}

/// Per-monitor bookkeeping of upstream segments and their fetches.
#[derive(Debug, Default)]
pub struct FetchLedger {
    known: VecDeque<Segment>,
    in_flight: HashMap<String, InFlight>,
    /// Names whose fetch was started, in flight or done.
    started: HashSet<String>,
    next_id: u64,
}

impl FetchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(&self) -> &VecDeque<Segment> {
        &self.known
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known.iter().any(|s| s.name() == name)
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.in_flight.contains_key(name)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_started(&self, name: &str) -> bool {
        self.started.contains(name)
    }

    pub fn started_len(&self) -> usize {
        self.started.len()
    }

    /// Appends the segments of `playlist` newer than the newest known one.
    ///
    /// Segments already evicted from the front are not re-added while the
    /// upstream still lists them.
    pub fn merge(&mut self, playlist: &Playlist) -> Vec<Segment> {
        let segments = playlist.segments();
        let start = self
            .known
            .back()
            .and_then(|newest| segments.iter().position(|s| s == newest))
            .map_or(0, |p| p + 1);

        let mut added = Vec::new();
        for segment in &segments[start..] {
            if !self.is_known(segment.name()) {
                self.known.push_back(segment.clone());
                added.push(segment.clone());
            }
        }
        added
    }

    /// Evicts from the head until at most `max` segments remain.
    pub fn trim_known(&mut self, max: usize) -> Vec<Segment> {
        let mut evicted = Vec::new();
        while self.known.len() > max {
            if let Some(segment) = self.known.pop_front() {
                self.started.remove(segment.name());
                evicted.push(segment);
            }
        }
        evicted
    }

    /// Cancels the fetch for `name`. Returns whether one was in flight.
    /// The name still counts as started.
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.in_flight.remove(name) {
            Some(flight) => {
                flight.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, flight) in self.in_flight.drain() {
            flight.token.cancel();
        }
    }

    fn begin(&mut self, name: &str, parent: &CancellationToken) -> (u64, CancellationToken) {
        self.next_id += 1;
        let token = parent.child_token();
        self.in_flight.insert(
            name.to_owned(),
            InFlight {
                id: self.next_id,
                token: token.clone(),
            },
        );
        self.started.insert(name.to_owned());
        (self.next_id, token)
    }

    /// Releases the slot held by fetch `id` of `name`. Stale ids, left over
    /// from cancelled fetches, are rejected.
    pub(crate) fn complete(&mut self, name: &str, id: u64) -> bool {
        match self.in_flight.get(name) {
            Some(flight) if flight.id == id => {
                self.in_flight.remove(name);
                true
            }
            _ => false,
        }
    }
}

/// A fetch the engine must spawn once the policy hook returns.
#[derive(Debug)]
pub(crate) struct FetchRequest {
    pub(crate) segment: Segment,
    pub(crate) id: u64,
    pub(crate) token: CancellationToken,
}

/// What a policy hook sees of the monitor: the ledger plus a place to queue
/// fetches and notifications. Everything queued is dispatched by the engine
/// while the monitor lock is still held.
pub struct SelectionContext<'a> {
    ledger: &'a mut FetchLedger,
    cap: usize,
    parent: &'a CancellationToken,
    pub(crate) requests: Vec<FetchRequest>,
    pub(crate) events: Vec<MonitorEvent>,
    pub(crate) rearm: bool,
    pub(crate) rerun: bool,
}

impl<'a> SelectionContext<'a> {
    pub(crate) fn new(
        ledger: &'a mut FetchLedger,
        cap: usize,
        parent: &'a CancellationToken,
    ) -> Self {
        Self {
            ledger,
            cap,
            parent,
            requests: Vec::new(),
            events: Vec::new(),
            rearm: false,
            rerun: false,
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<FetchRequest>, Vec<MonitorEvent>, bool) {
        (self.requests, self.events, self.rearm)
    }

    pub fn ledger(&self) -> &FetchLedger {
        &*self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut FetchLedger {
        &mut *self.ledger
    }

    pub fn is_full(&self) -> bool {
        self.ledger.in_flight_len() >= self.cap
    }

    /// Starts fetching `segment` unless every slot is taken or it is
    /// already in flight.
    pub fn download(&mut self, segment: &Segment) -> bool {
        if self.is_full() || self.ledger.is_in_flight(segment.name()) {
            return false;
        }
        let (id, token) = self.ledger.begin(segment.name(), self.parent);
        self.requests.push(FetchRequest {
            segment: segment.clone(),
            id,
            token,
        });
        true
    }

    pub fn emit(&mut self, event: MonitorEvent) {
        self.events.push(event);
    }

    /// Wakes a poll loop waiting on `may_poll`.
    pub fn rearm(&mut self) {
        self.rearm = true;
    }

    /// Asks the engine for one more selection pass after this one.
    pub fn rerun(&mut self) {
        self.rerun = true;
    }
}

/// Strategy deciding which segments a monitor fetches and when it polls.
///
/// Hooks run with the monitor lock held and must not block.
pub trait SelectionPolicy: Send + 'static {
    /// A new playlist body was parsed.
    fn on_playlist(&mut self, playlist: &Arc<Playlist>, ctx: &mut SelectionContext<'_>);

    /// Fill free fetch slots.
    fn select(&mut self, ctx: &mut SelectionContext<'_>);

    /// Called after every playlist response. Returning `false` skips the
    /// poll delay and parks the loop on [`may_poll`](Self::may_poll) until
    /// [`SelectionContext::rearm`] is called.
    fn should_continue_polling(
        &mut self,
        _playlist: Option<&Arc<Playlist>>,
        _ctx: &mut SelectionContext<'_>,
    ) -> bool {
        true
    }

    /// Gate checked before each playlist request.
    fn may_poll(&self) -> bool {
        true
    }

    /// Once true the poll loop exits for good.
    fn is_finished(&self) -> bool {
        false
    }

    fn on_segment_received(&mut self, _segment: &Segment, _ctx: &mut SelectionContext<'_>) {}

    fn on_segment_failed(
        &mut self,
        _segment: &Segment,
        _status: Option<StatusCode>,
        _ctx: &mut SelectionContext<'_>,
    ) {
    }

    /// The slot of `segment` was released.
    fn on_segment_finished(&mut self, _segment: &Segment, _ctx: &mut SelectionContext<'_>) {}
}
