//! HLS media playlist model and its line codec.
//!
//! Only the subset of tags a relay needs is understood. Everything else is
//! skipped on parse and never emitted.

use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use url::Url;

use crate::error::RelayError;

const TAG_HEADER: &str = "#EXTM3U";
const TAG_TARGET_DURATION: &str = "#EXT-X-TARGETDURATION:";
const TAG_VERSION: &str = "#EXT-X-VERSION:";
const TAG_MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE:";
const TAG_PLAYLIST_TYPE: &str = "#EXT-X-PLAYLIST-TYPE:";
const TAG_INF: &str = "#EXTINF:";
const TAG_ENDLIST: &str = "#EXT-X-ENDLIST";

/// A single media segment referenced by a playlist.
///
/// Two segments are the same segment when their names match, whatever
/// locator or sequence number they were seen with.
#[derive(Debug, Clone)]
pub struct Segment {
    name: String,
    locator: String,
    duration: f64,
    sequence: u64,
}

impl Segment {
    pub fn new(locator: impl Into<String>, duration: f64, sequence: u64) -> Result<Self, RelayError> {
        let locator = locator.into();
        if !duration.is_finite() || duration <= 0.0 {
            return Err(RelayError::playlist(format!(
                "segment `{locator}` has invalid duration {duration}"
            )));
        }
        let name = segment_name(&locator);
        if name.is_empty() {
            return Err(RelayError::playlist(format!(
                "segment locator `{locator}` has no file name"
            )));
        }
        Ok(Self {
            name,
            locator,
            duration,
            sequence,
        })
    }

    /// Last path component of the locator, query and fragment excluded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locator as it appeared in the upstream playlist, absolute or relative.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Segment {}

impl Hash for Segment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

fn segment_name(locator: &str) -> String {
    if let Ok(url) = Url::parse(locator) {
        return url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_owned();
    }
    let path = locator
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    path.rsplit('/').next().unwrap_or_default().to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Live,
    Event,
    Vod,
}

impl StreamKind {
    fn tag_value(self) -> Option<&'static str> {
        match self {
            Self::Live => None,
            Self::Event => Some("EVENT"),
            Self::Vod => Some("VOD"),
        }
    }
}

impl FromStr for StreamKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "EVENT" => Ok(Self::Event),
            "VOD" => Ok(Self::Vod),
            other => Err(RelayError::playlist(format!("unknown playlist type `{other}`"))),
        }
    }
}

/// A media playlist.
///
/// Target duration, version and media sequence are write-once: the first
/// value set wins. Once ended, a playlist stays ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    kind: StreamKind,
    version: Option<u32>,
    target_duration: Option<f64>,
    sequence: Option<u64>,
    ended: bool,
    segments: Vec<Segment>,
}

impl Playlist {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            version: None,
            target_duration: None,
            sequence: None,
            ended: false,
            segments: Vec::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn target_duration(&self) -> Option<f64> {
        self.target_duration
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(Segment::name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn set_target_duration(&mut self, duration: f64) {
        if self.target_duration.is_none() {
            self.target_duration = Some(duration);
        }
    }

    pub fn set_version(&mut self, version: u32) {
        if self.version.is_none() {
            self.version = Some(version);
        }
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        if self.sequence.is_none() {
            self.sequence = Some(sequence);
        }
    }

    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// Appends `segment` unless one with the same name is already present.
    pub fn add_segment(&mut self, segment: Segment) -> bool {
        if self.contains(segment.name()) {
            return false;
        }
        self.segments.push(segment);
        true
    }

    /// Parses playlist text. Unknown lines are ignored, as are `#EXTINF`
    /// entries that are malformed or not followed directly by a locator.
    pub fn parse(text: &str) -> Self {
        let mut playlist = Self::new(StreamKind::Live);
        let mut kind = None;
        let mut lines = text.lines().map(|l| l.trim_end_matches('\r').trim()).peekable();
        let mut count: u64 = 0;

        while let Some(line) = lines.next() {
            if let Some(value) = line.strip_prefix(TAG_TARGET_DURATION) {
                if let Ok(d) = value.trim().parse::<f64>()
                    && d.is_finite()
                    && d > 0.0
                {
                    playlist.set_target_duration(d);
                }
            } else if let Some(value) = line.strip_prefix(TAG_VERSION) {
                if let Ok(v) = value.trim().parse::<u32>() {
                    playlist.set_version(v);
                }
            } else if let Some(value) = line.strip_prefix(TAG_MEDIA_SEQUENCE) {
                if let Ok(s) = value.trim().parse::<u64>() {
                    playlist.set_sequence(s);
                }
            } else if let Some(value) = line.strip_prefix(TAG_PLAYLIST_TYPE) {
                if kind.is_none()
                    && let Ok(k) = value.parse::<StreamKind>()
                {
                    kind = Some(k);
                }
            } else if let Some(value) = line.strip_prefix(TAG_INF) {
                let Some(locator) = lines.next_if(|next| !next.is_empty() && !next.starts_with('#'))
                else {
                    continue;
                };
                let duration = value.split(',').next().unwrap_or_default().trim();
                let Ok(duration) = duration.parse::<f64>() else {
                    continue;
                };
                let Some(sequence) = playlist.sequence.unwrap_or(0).checked_add(count) else {
                    continue;
                };
                if let Ok(segment) = Segment::new(locator, duration, sequence)
                    && playlist.add_segment(segment)
                {
                    count += 1;
                }
            } else if line == TAG_ENDLIST {
                playlist.mark_ended();
            }
        }

        if let Some(kind) = kind {
            playlist.kind = kind;
        }
        playlist
    }

    /// Renders the playlist. With a `base_url`, segment lines become
    /// `{base_url}/{name}`; otherwise the original locators are written.
    pub fn generate(&self, base_url: Option<&str>, end: bool) -> String {
        let mut out = String::with_capacity(64 + self.segments.len() * 48);
        out.push_str(TAG_HEADER);
        out.push('\n');
        if let Some(kind) = self.kind.tag_value() {
            let _ = writeln!(out, "{TAG_PLAYLIST_TYPE}{kind}");
        }
        if let Some(td) = self.target_duration {
            let _ = writeln!(out, "{TAG_TARGET_DURATION}{td}");
        }
        if let Some(version) = self.version {
            let _ = writeln!(out, "{TAG_VERSION}{version}");
        }
        if let Some(sequence) = self.sequence {
            let _ = writeln!(out, "{TAG_MEDIA_SEQUENCE}{sequence}");
        }
        let base = base_url.map(|b| b.trim_end_matches('/'));
        for segment in &self.segments {
            let _ = writeln!(out, "{TAG_INF}{},", segment.duration);
            match base {
                Some(base) => {
                    let _ = writeln!(out, "{base}/{}", segment.name);
                }
                None => {
                    let _ = writeln!(out, "{}", segment.locator);
                }
            }
        }
        if end {
            out.push_str(TAG_ENDLIST);
            out.push('\n');
        }
        out
    }

    pub fn to_text(&self) -> String {
        self.generate(None, self.ended)
    }
}
