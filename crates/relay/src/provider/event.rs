use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{EventProviderConfig, RelayConfig};
use crate::playlist::{Playlist, Segment, StreamKind};
use crate::provider::{
    CacheProvider, EvictionPolicy, OutputSettings, ProviderPhase, SegmentStore,
};
use crate::storage::{BlobStore, BlobWriter, PLAYLIST_KEY};

/// Full-history output backed by durable storage.
///
/// Every payload is persisted as it arrives, along with the playlist, so a
/// later run can resume the event or replay it without any network access.
pub struct EventCache {
    writer: BlobWriter,
    /// Every segment ever pushed, persisted under [`PLAYLIST_KEY`].
    playlist: Playlist,
    /// Segments whose payload is on durable storage or queued for it.
    stored: HashSet<String>,
    consumed: HashSet<String>,
    unchanged: usize,
    unchanged_max: usize,
    complete_preload: bool,
    ending: bool,
    buffering: bool,
}

impl EventCache {
    fn persist_playlist(&self) {
        self.writer.save(PLAYLIST_KEY, Bytes::from(self.playlist.to_text()));
    }

    fn has_data(&self, store: &SegmentStore, name: &str) -> bool {
        store.is_cached(name) || self.stored.contains(name)
    }

    fn is_consumed(&self, name: &str) -> bool {
        self.consumed.contains(name)
    }

    /// Appends contiguous available segments from `start`, returning how
    /// many were added.
    fn append_available(&self, store: &mut SegmentStore, start: usize) -> usize {
        let mut added = 0;
        for index in start..store.known.len() {
            let name = store.known[index].name().to_owned();
            if !self.is_consumed(&name) && !self.has_data(store, &name) {
                break;
            }
            if !store.is_output(&name) {
                let segment = store.known[index].clone();
                store.output.push(segment);
                added += 1;
            }
        }
        added
    }

    fn render(&self, store: &mut SegmentStore, settings: &OutputSettings, end: bool) {
        let mut output = Playlist::new(StreamKind::Event);
        output.set_version(settings.hls_version);
        if let Some(duration) = self.playlist.target_duration() {
            output.set_target_duration(duration);
        }
        output.set_sequence(0);
        for segment in &store.output {
            output.add_segment(segment.clone());
        }
        store.output_playlist = Some(output.generate(Some(&settings.service_url), end));
    }

    fn update_output(&mut self, store: &mut SegmentStore, settings: &OutputSettings) -> bool {
        let start = match store.next_output_index() {
            Some(index) => index,
            None if !store.known.is_empty() => 0,
            None => return false,
        };
        if !store.is_cached(store.known[start].name()) {
            return false;
        }

        let added = self.append_available(store, start);
        let mut end = false;
        if self.playlist.is_ended() {
            let tail = store.output.last().map(Segment::name);
            if tail.is_some() && tail == self.playlist.segment_names().last() {
                info!("event output caught up with ended playlist");
                self.ending = true;
                end = true;
            }
        }
        self.render(store, settings, end);

        if !self.playlist.is_ended() && added > 0 {
            self.persist_playlist();
        }
        added > 0
    }

    fn update_ending_list(&mut self, store: &mut SegmentStore, settings: &OutputSettings) {
        if !store.known.is_empty() {
            let start = store.next_output_index().unwrap_or(0);
            self.append_available(store, start);
        }
        let end = store.known.is_empty() || store.output.last() == store.known.last();
        self.render(store, settings, end);
        self.persist_playlist();
    }

    /// Drops the first unfilled segment at or after the output tail so a
    /// segment that will never arrive cannot hold the output back.
    fn release_stalled(&mut self, store: &mut SegmentStore) {
        let start = store.next_output_index().unwrap_or(0);
        let stalled = (start..store.known.len()).find(|&i| !store.is_cached(store.known[i].name()));
        if let Some(index) = stalled {
            let segment = store.known.remove(index);
            store.cache.remove(segment.name());
            warn!(segment = %segment.name(), "output stalled, giving up on segment");
        }
    }
}

impl EvictionPolicy for EventCache {
    fn push(&mut self, store: &mut SegmentStore, segment: Segment) -> bool {
        if self.playlist.contains(segment.name()) {
            return false;
        }
        self.playlist.add_segment(segment.clone());
        store.known.push(segment);
        true
    }

    fn fill(&mut self, store: &mut SegmentStore, segment: &Segment, data: Bytes) -> bool {
        self.writer.save(segment.name(), data.clone());
        self.stored.insert(segment.name().to_owned());
        store.cache.insert(segment.name().to_owned(), data);
        if !self.playlist.is_ended() {
            self.persist_playlist();
        }
        true
    }

    fn refresh(&mut self, store: &mut SegmentStore, settings: &OutputSettings) {
        if store.output.len() < settings.prebuffer_size && !self.ending {
            self.buffering = true;
        }
        if self.buffering {
            if store.buffered_count() >= settings.prebuffer_size {
                debug!("event buffer filled, serving");
                self.buffering = false;
                self.update_output(store, settings);
                self.unchanged = 0;
            }
            self.unchanged += 1;
            if self.unchanged > self.unchanged_max {
                self.unchanged = 0;
                self.release_stalled(store);
            }
        } else if self.ending {
            self.update_ending_list(store, settings);
        } else if !self.update_output(store, settings) {
            debug!("event output unchanged, buffering");
            self.buffering = true;
        }
    }

    fn phase(&self, _store: &SegmentStore) -> ProviderPhase {
        if self.ending {
            ProviderPhase::Ending
        } else if self.buffering {
            ProviderPhase::Buffering
        } else {
            ProviderPhase::Serving
        }
    }

    fn set_target_duration(&mut self, duration: Option<f64>) {
        if let Some(duration) = duration {
            self.playlist.set_target_duration(duration);
        }
    }
}

impl CacheProvider<EventCache> {
    /// Opens the provider over `blobs`, restoring whatever a previous run
    /// persisted there. Stored payloads are read into memory here; later
    /// writes go through a [`BlobWriter`].
    pub fn open(
        settings: OutputSettings,
        config: &EventProviderConfig,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let playlist = blobs
            .load(PLAYLIST_KEY)
            .map(|text| Playlist::parse(&String::from_utf8_lossy(&text)))
            .unwrap_or_else(|| {
                let mut playlist = Playlist::new(StreamKind::Event);
                playlist.set_version(settings.hls_version);
                playlist
            });

        let mut store = SegmentStore::default();
        let mut stored = HashSet::new();
        let mut incomplete = false;
        for segment in playlist.segments() {
            store.known.push(segment.clone());
            match blobs.load(segment.name()) {
                Some(data) => {
                    stored.insert(segment.name().to_owned());
                    store.cache.insert(segment.name().to_owned(), data);
                }
                None => incomplete = true,
            }
        }
        let complete_preload = !incomplete && playlist.is_ended();
        if !playlist.is_empty() {
            info!(
                segments = playlist.segments().len(),
                ended = playlist.is_ended(),
                complete = complete_preload,
                "restored event from storage"
            );
        }

        let policy = EventCache {
            writer: BlobWriter::new(blobs),
            playlist,
            stored,
            consumed: HashSet::new(),
            unchanged: 0,
            unchanged_max: config.unchanged_max,
            complete_preload,
            ending: complete_preload,
            buffering: !complete_preload,
        };
        Self::with_store(settings, store, policy)
    }

    pub fn event(config: &RelayConfig, blobs: Arc<dyn BlobStore>) -> Self {
        Self::open(
            OutputSettings::new(&config.server, &config.provider),
            &config.event_provider,
            blobs,
        )
    }

    /// Whether the persisted event was already ended with every payload
    /// present when the provider was opened.
    pub fn complete_preload(&self) -> bool {
        self.with_state(|policy, _| policy.complete_preload)
    }

    pub fn is_ending(&self) -> bool {
        self.with_state(|policy, _| policy.ending)
    }

    pub fn target_duration(&self) -> Option<f64> {
        self.with_state(|policy, _| policy.playlist.target_duration())
    }

    /// Whether the payload of `name` is in memory or on durable storage.
    pub fn has_segment_data(&self, name: &str) -> bool {
        self.with_state(|policy, store| policy.has_data(store, name))
    }

    /// Whether the playlist ended and every payload in it is available.
    pub fn has_all_segment_data(&self) -> bool {
        self.with_state(|policy, store| {
            policy.playlist.is_ended()
                && policy
                    .playlist
                    .segment_names()
                    .all(|name| policy.has_data(store, name))
        })
    }

    /// Hands out the payload of `name` and releases it from memory. Durable
    /// storage and the playlist history are left untouched.
    pub fn consume(&self, name: &str) -> Option<Bytes> {
        self.with_state(|policy, store| {
            if let Some(index) = store.position(name) {
                policy.consumed.insert(name.to_owned());
                store.known.remove(index);
            }
            store.cache.remove(name)
        })
    }

    /// Waits for every queued storage write to land.
    pub async fn flush(&self) {
        let writer = self.with_state(|policy, _| policy.writer.clone());
        writer.flush().await;
    }

    /// Finalizes the output. One-way.
    pub fn end_playlist(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let policy = &mut state.policy;
        info!("finalizing event output");
        policy.ending = true;
        policy.buffering = false;
        policy.playlist.mark_ended();
        policy.update_ending_list(&mut state.store, &self.settings);
    }
}
