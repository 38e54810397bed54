//! Cache providers: buffer fetched segments and publish an output playlist.
//!
//! One [`CacheProvider`] engine holds the shared state; what gets evicted
//! and how the output advances is up to its [`EvictionPolicy`].

mod event;
mod live;

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{ProviderConfig, ServerConfig};
use crate::playlist::Segment;

pub use event::EventCache;
pub use live::LiveCache;

pub type LiveProvider = CacheProvider<LiveCache>;
pub type EventProvider = CacheProvider<EventCache>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPhase {
    /// Waiting for enough contiguous segments before advancing the output.
    Buffering,
    Serving,
    /// The output is being finalized; terminal.
    Ending,
}

/// How the output playlist is rendered.
#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Base URL segment lines are written against.
    pub service_url: String,
    pub prebuffer_size: usize,
    pub hls_version: u32,
}

impl OutputSettings {
    pub fn new(server: &ServerConfig, provider: &ProviderConfig) -> Self {
        Self {
            service_url: server.service_url.clone(),
            prebuffer_size: provider.prebuffer_size,
            hls_version: provider.hls_version,
        }
    }
}

/// Known segments, output segments and payloads of one provider. Always
/// accessed under the provider lock.
#[derive(Debug, Default)]
pub struct SegmentStore {
    known: Vec<Segment>,
    output: Vec<Segment>,
    cache: HashMap<String, Bytes>,
    output_playlist: Option<String>,
}

impl SegmentStore {
    fn position(&self, name: &str) -> Option<usize> {
        self.known.iter().position(|s| s.name() == name)
    }

    fn is_known(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn is_output(&self, name: &str) -> bool {
        self.output.iter().any(|s| s.name() == name)
    }

    fn is_cached(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }

    /// Index in the known list right after the output tail. `None` when
    /// there is no output yet, when the tail is no longer known, or when
    /// the tail is the newest known segment.
    fn next_output_index(&self) -> Option<usize> {
        let tail = self.output.last()?;
        if self.known.last() == Some(tail) {
            return None;
        }
        self.position(tail.name()).map(|i| i + 1)
    }

    /// Contiguous cached segments following the output tail.
    fn buffered_count(&self) -> usize {
        let start = self.next_output_index().unwrap_or(0);
        self.known[start..]
            .iter()
            .take_while(|s| self.is_cached(s.name()))
            .count()
    }

    fn push_unique(&mut self, segment: Segment) -> bool {
        if self.is_known(segment.name()) {
            return false;
        }
        self.known.push(segment);
        true
    }

    /// Removes `name` from the known list unless its payload is cached.
    fn drop_unfilled(&mut self, name: &str) -> bool {
        if self.is_cached(name) {
            return false;
        }
        match self.position(name) {
            Some(index) => {
                self.known.remove(index);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.known.clear();
        self.output.clear();
        self.cache.clear();
        self.output_playlist = None;
    }
}

/// Strategy plugged into a [`CacheProvider`]. Called with the provider lock
/// held.
pub trait EvictionPolicy: Send + 'static {
    /// Registers an upstream segment. Must be idempotent per name.
    fn push(&mut self, store: &mut SegmentStore, segment: Segment) -> bool;

    /// Stores the payload of `segment`.
    fn fill(&mut self, store: &mut SegmentStore, segment: &Segment, data: Bytes) -> bool;

    /// Gives up on `segment`. A segment that already has data is kept.
    fn drop_segment(&mut self, store: &mut SegmentStore, segment: &Segment) -> bool {
        store.drop_unfilled(segment.name())
    }

    /// Advances the output list and regenerates the output playlist.
    fn refresh(&mut self, store: &mut SegmentStore, settings: &OutputSettings);

    fn phase(&self, store: &SegmentStore) -> ProviderPhase;

    fn set_target_duration(&mut self, duration: Option<f64>);

    fn clean_up(&mut self, store: &mut SegmentStore) {
        store.clear();
    }
}

struct ProviderState<E> {
    store: SegmentStore,
    policy: E,
}

pub struct CacheProvider<E: EvictionPolicy> {
    settings: OutputSettings,
    state: Mutex<ProviderState<E>>,
}

impl<E: EvictionPolicy> CacheProvider<E> {
    pub fn new(settings: OutputSettings, policy: E) -> Self {
        Self::with_store(settings, SegmentStore::default(), policy)
    }

    fn with_store(settings: OutputSettings, store: SegmentStore, policy: E) -> Self {
        Self {
            settings,
            state: Mutex::new(ProviderState { store, policy }),
        }
    }

    pub fn settings(&self) -> &OutputSettings {
        &self.settings
    }

    pub fn push(&self, segment: Segment) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.policy.push(&mut state.store, segment)
    }

    pub fn push_all(&self, segments: impl IntoIterator<Item = Segment>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for segment in segments {
            state.policy.push(&mut state.store, segment);
        }
    }

    pub fn fill(&self, segment: &Segment, data: Bytes) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.policy.fill(&mut state.store, segment, data)
    }

    pub fn drop_segment(&self, segment: &Segment) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.policy.drop_segment(&mut state.store, segment)
    }

    /// Runs one output refresh and returns the resulting playlist text.
    pub fn refresh_playlist(&self) -> Option<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.policy.refresh(&mut state.store, &self.settings);
        state.store.output_playlist.clone()
    }

    /// Last generated output playlist, without refreshing.
    pub fn output_playlist(&self) -> Option<String> {
        self.state.lock().store.output_playlist.clone()
    }

    /// Cached payload of `name`. Never triggers a fetch.
    pub fn provide_segment(&self, name: &str) -> Option<Bytes> {
        self.state.lock().store.cache.get(name).cloned()
    }

    pub fn buffered_count(&self) -> usize {
        self.state.lock().store.buffered_count()
    }

    pub fn is_buffer_enough(&self) -> bool {
        self.buffered_count() >= self.settings.prebuffer_size
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().store.cache.len()
    }

    pub fn phase(&self) -> ProviderPhase {
        let state = self.state.lock();
        state.policy.phase(&state.store)
    }

    pub fn known_segments(&self) -> Vec<Segment> {
        self.state.lock().store.known.clone()
    }

    pub fn output_segments(&self) -> Vec<Segment> {
        self.state.lock().store.output.clone()
    }

    pub fn set_target_duration(&self, duration: Option<f64>) {
        self.state.lock().policy.set_target_duration(duration);
    }

    pub fn clean_up(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.policy.clean_up(&mut state.store);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut E, &mut SegmentStore) -> R) -> R {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        f(&mut state.policy, &mut state.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(name: &str) -> Segment {
        Segment::new(name, 2.0, 0).unwrap()
    }

    fn store(names: &[&str], cached: &[&str], output: &[&str]) -> SegmentStore {
        let mut store = SegmentStore::default();
        for name in names {
            store.push_unique(segment(name));
        }
        for name in cached {
            store.cache.insert((*name).to_owned(), Bytes::from_static(b"x"));
        }
        store.output = output.iter().map(|n| segment(n)).collect();
        store
    }

    #[test]
    fn buffered_count_starts_after_output_tail() {
        let s = store(&["a", "b", "c", "d"], &["a", "b", "d"], &[]);
        assert_eq!(s.buffered_count(), 2);

        let s = store(&["a", "b", "c", "d"], &["c", "d"], &["a", "b"]);
        assert_eq!(s.next_output_index(), Some(2));
        assert_eq!(s.buffered_count(), 2);

        // tail is the newest known segment: nothing follows it
        let s = store(&["a", "b"], &["a", "b"], &["b"]);
        assert_eq!(s.next_output_index(), None);
    }

    #[test]
    fn drop_keeps_filled_segments() {
        let mut s = store(&["a", "b"], &["a"], &[]);
        assert!(!s.drop_unfilled("a"));
        assert!(s.drop_unfilled("b"));
        assert!(!s.drop_unfilled("b"));
        assert_eq!(s.known.len(), 1);
    }

    #[test]
    fn push_is_idempotent() {
        let mut s = SegmentStore::default();
        assert!(s.push_unique(segment("a")));
        assert!(!s.push_unique(segment("a")));
        assert_eq!(s.known.len(), 1);
    }
}
