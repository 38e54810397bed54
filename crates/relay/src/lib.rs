//! Relay engine: re-serves a remote segmented media stream from a local
//! endpoint.
//!
//! ## Core Types
//!
//! - [`Playlist`] / [`Segment`] - Playlist text model, parser and generator
//! - [`Monitor`] - Polls an upstream playlist and fetches segments, driven by
//!   a [`SelectionPolicy`] ([`LiveSelection`], [`EventSelection`])
//! - [`CacheProvider`] - Buffers payloads and publishes the output playlist,
//!   driven by an [`EvictionPolicy`] ([`LiveCache`], [`EventCache`])
//!
//! ## Relays
//!
//! - [`LiveRelay`] - Rolling-window relay of a live stream
//! - [`EventRelay`] - Full-history relay of an event, persisted to a
//!   [`BlobStore`]
//! - [`RelayService`] - What a local HTTP endpoint serves from

pub mod config;
pub mod error;
pub mod fetch;
pub mod monitor;
pub mod playlist;
pub mod provider;
pub mod relay;
pub mod storage;

pub use config::{
    Credentials, EventMonitorConfig, EventProviderConfig, HttpConfig, LiveMonitorConfig,
    LiveProviderConfig, MonitorConfig, PLAYLIST_FILENAME, ProviderConfig, RelayConfig,
    ServerConfig,
};
pub use error::{RelayError, StreamErrorKind};
pub use fetch::{FetchOutcome, Fetcher, HttpFetcher};
pub use monitor::{
    Admission, EventMonitor, EventSelection, LiveMonitor, LiveSelection, Monitor, MonitorEvent,
    MonitorState, SelectionPolicy,
};
pub use playlist::{Playlist, Segment, StreamKind};
pub use provider::{
    CacheProvider, EventCache, EventProvider, EvictionPolicy, LiveCache, LiveProvider,
    ProviderPhase,
};
pub use relay::{EventRelay, LiveRelay, RelayService, StreamEvent};
pub use storage::{BlobStore, BlobWriter, FileStore, MemoryStore, PLAYLIST_KEY};
