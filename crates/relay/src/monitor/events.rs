use std::sync::Arc;

use bytes::Bytes;
use reqwest::StatusCode;

use crate::playlist::{Playlist, Segment};

/// Notifications emitted by a monitor, in the order they happened.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A playlist body differing from the previous one was parsed.
    PlaylistUpdated(Arc<Playlist>),
    /// The playlist body was byte-identical to the previous one.
    PlaylistUnchanged,
    PlaylistFailed {
        status: Option<StatusCode>,
        reason: String,
    },
    /// A fetch for this segment is about to start (live).
    SegmentPushed(Segment),
    /// Newly observed segments queued for download (event).
    SegmentsPushed(Vec<Segment>),
    SegmentReceived {
        segment: Segment,
        data: Bytes,
    },
    SegmentFailed {
        segment: Segment,
        status: Option<StatusCode>,
    },
    /// The segment left the download window; any fetch for it was cancelled.
    SegmentDropped(Segment),
    /// The upstream playlist reported end-of-stream. Sent once.
    PlaylistEnded(Arc<Playlist>),
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlaylistUpdated(_) => "playlist_updated",
            Self::PlaylistUnchanged => "playlist_unchanged",
            Self::PlaylistFailed { .. } => "playlist_failed",
            Self::SegmentPushed(_) => "segment_pushed",
            Self::SegmentsPushed(_) => "segments_pushed",
            Self::SegmentReceived { .. } => "segment_received",
            Self::SegmentFailed { .. } => "segment_failed",
            Self::SegmentDropped(_) => "segment_dropped",
            Self::PlaylistEnded(_) => "playlist_ended",
        }
    }
}
