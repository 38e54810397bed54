use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::{LiveProviderConfig, RelayConfig};
use crate::error::RelayError;
use crate::playlist::{Playlist, Segment, StreamKind};
use crate::provider::{
    CacheProvider, EvictionPolicy, OutputSettings, ProviderPhase, SegmentStore,
};
use crate::storage::{BlobWriter, FileStore};

/// Rolling-window output with a bounded payload cache.
///
/// The output keeps the newest `playlist_window` segments and renumbers
/// the media sequence as it slides. Payloads beyond `cache_max` are evicted
/// oldest first, together with their known entry.
pub struct LiveCache {
    cache_max: usize,
    playlist_window: usize,
    target_duration: Option<f64>,
    sequence: u64,
    buffering: bool,
    mirror: Option<BlobWriter>,
}

impl LiveCache {
    pub fn new(config: &LiveProviderConfig) -> Self {
        Self {
            cache_max: config.cache_max.max(1),
            playlist_window: config.playlist_window.max(1),
            target_duration: None,
            sequence: 0,
            buffering: true,
            mirror: None,
        }
    }

    fn evict_over_cap(&self, store: &mut SegmentStore) {
        while store.cache.len() > self.cache_max && !store.known.is_empty() {
            let oldest = store.known.remove(0);
            if store.cache.remove(oldest.name()).is_some() {
                debug!(segment = %oldest.name(), "evicted cached segment");
            }
        }
    }

    fn mirror(&self, name: &str, data: &Bytes) {
        if let Some(mirror) = &self.mirror {
            mirror.save(name, data.clone());
        }
    }

    /// Appends newly available segments. Returns `false` when the output
    /// would not change.
    fn update_output(&mut self, store: &mut SegmentStore, settings: &OutputSettings) -> bool {
        if let Some(tail) = store.output.last() {
            let changed = if store.output.iter().any(|s| !store.is_known(s.name())) {
                true
            } else {
                store
                    .position(tail.name())
                    .and_then(|i| store.known.get(i + 1))
                    .is_some_and(|next| store.is_cached(next.name()))
            };
            if !changed {
                return false;
            }
        }

        let start = store
            .output
            .last()
            .and_then(|tail| store.position(tail.name()))
            .unwrap_or(0);
        let mut appended = Vec::new();
        for segment in &store.known[start..] {
            if !store.is_cached(segment.name()) {
                break;
            }
            if !store.is_output(segment.name()) && !appended.contains(segment) {
                appended.push(segment.clone());
            }
        }
        store.output.extend(appended);

        if store.output.len() > self.playlist_window {
            let offset = store.output.len() - self.playlist_window;
            store.output.drain(..offset);
            self.sequence += offset as u64;
        }

        let mut output = Playlist::new(StreamKind::Live);
        output.set_version(settings.hls_version);
        if let Some(duration) = self.target_duration {
            output.set_target_duration(duration);
        }
        output.set_sequence(self.sequence);
        for segment in &store.output {
            output.add_segment(segment.clone());
        }
        store.output_playlist = Some(output.generate(Some(&settings.service_url), false));
        true
    }
}

impl EvictionPolicy for LiveCache {
    fn push(&mut self, store: &mut SegmentStore, segment: Segment) -> bool {
        store.push_unique(segment)
    }

    fn fill(&mut self, store: &mut SegmentStore, segment: &Segment, data: Bytes) -> bool {
        if !store.is_known(segment.name()) {
            return false;
        }
        self.mirror(segment.name(), &data);
        store.cache.insert(segment.name().to_owned(), data);
        self.evict_over_cap(store);
        true
    }

    fn refresh(&mut self, store: &mut SegmentStore, settings: &OutputSettings) {
        if store.output.len() < settings.prebuffer_size {
            self.buffering = true;
        }
        if self.buffering {
            if store.buffered_count() >= settings.prebuffer_size {
                debug!(sequence = self.sequence, "live buffer filled, serving");
                self.buffering = false;
                self.update_output(store, settings);
            }
        } else if !self.update_output(store, settings) {
            debug!("live output stalled, buffering");
            self.buffering = true;
        }
    }

    fn phase(&self, _store: &SegmentStore) -> ProviderPhase {
        if self.buffering {
            ProviderPhase::Buffering
        } else {
            ProviderPhase::Serving
        }
    }

    fn set_target_duration(&mut self, duration: Option<f64>) {
        if duration.is_some() {
            self.target_duration = duration;
        }
    }

    fn clean_up(&mut self, store: &mut SegmentStore) {
        store.clear();
        self.sequence = 0;
        self.buffering = true;
    }
}

impl CacheProvider<LiveCache> {
    pub fn live(config: &RelayConfig) -> Self {
        Self::new(
            OutputSettings::new(&config.server, &config.provider),
            LiveCache::new(&config.live_provider),
        )
    }

    /// Copies every payload into `dir` from now on. Payloads already cached
    /// are written immediately.
    pub fn start_mirroring(&self, dir: impl Into<PathBuf>) -> Result<(), RelayError> {
        let dir = FileStore::new(dir)?;
        info!(dir = %dir.root().display(), "mirroring live segments");
        let mirror = BlobWriter::new(Arc::new(dir));
        self.with_state(|policy, store| {
            if policy.mirror.is_none() {
                for (name, data) in &store.cache {
                    mirror.save(name.as_str(), data.clone());
                }
            }
            policy.mirror = Some(mirror);
        });
        Ok(())
    }

    pub fn stop_mirroring(&self) {
        self.with_state(|policy, _| {
            if policy.mirror.take().is_some() {
                info!("stopped mirroring live segments");
            }
        });
    }

    pub fn is_mirroring(&self) -> bool {
        self.with_state(|policy, _| policy.mirror.is_some())
    }

    /// Waits for every queued mirror write to land.
    pub async fn flush_mirror(&self) {
        let mirror = self.with_state(|policy, _| policy.mirror.clone());
        if let Some(mirror) = mirror {
            mirror.flush().await;
        }
    }

    /// Media sequence of the first output segment.
    pub fn sequence_number(&self) -> u64 {
        self.with_state(|policy, _| policy.sequence)
    }
}
