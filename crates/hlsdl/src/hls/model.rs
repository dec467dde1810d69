use std::fmt;

use serde::Serialize;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One video rendition declared by `#EXT-X-STREAM-INF`.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub url: Url,
    /// Peak bits per second.
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    pub audio_group: Option<String>,
    pub subtitle_group: Option<String>,
    pub codecs: Option<String>,
}

impl Variant {
    pub fn height(&self) -> Option<u64> {
        self.resolution.map(|r| r.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenditionKind {
    Audio,
    Subtitles,
}

/// One `#EXT-X-MEDIA` entry of type AUDIO or SUBTITLES.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub group_id: String,
    pub kind: RenditionKind,
    pub language: Option<String>,
    pub name: String,
    pub is_default: bool,
    /// Absent when the rendition is carried inside the variant's own segments.
    pub url: Option<Url>,
}

impl Rendition {
    /// Short label used in file names and warnings: language, else name.
    pub fn label(&self) -> Option<&str> {
        self.language
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .or_else(|| Some(self.name.as_str()).filter(|n| !n.trim().is_empty()))
    }
}

/// Resolved `EXT-X-BYTERANGE`: `length` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Value for the HTTP `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        let last = self.end().saturating_sub(1).max(self.offset);
        format!("bytes={}-{}", self.offset, last)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyMethod {
    Aes128,
    SampleAes,
    Other(String),
}

impl fmt::Display for KeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes128 => f.write_str("AES-128"),
            Self::SampleAes => f.write_str("SAMPLE-AES"),
            Self::Other(method) => f.write_str(method),
        }
    }
}

/// Key reference in effect for a segment. `METHOD=NONE` is represented by no key at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub method: KeyMethod,
    pub url: Option<Url>,
    /// Hex IV from the tag (`0x` prefix allowed).
    pub iv: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub url: Url,
    pub duration: f32,
    /// Position within the playlist; defines assembly order.
    pub sequence: usize,
    /// `EXT-X-MEDIA-SEQUENCE` + position.
    pub media_sequence: u64,
    pub byte_range: Option<ByteRange>,
    pub key: Option<SegmentKey>,
}

/// `EXT-X-MAP` initialization section.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSegment {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
    pub renditions: Vec<Rendition>,
}

impl MasterPlaylist {
    /// Renditions of `kind` in `group_id`, in declaration order.
    pub fn group<'a>(
        &'a self,
        kind: RenditionKind,
        group_id: &'a str,
    ) -> impl Iterator<Item = &'a Rendition> + 'a {
        self.renditions
            .iter()
            .filter(move |r| r.kind == kind && r.group_id == group_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    pub init_segment: Option<InitSegment>,
    /// `#EXT-X-ENDLIST` seen; false means a live snapshot.
    pub end_list: bool,
    pub target_duration: u64,
}

impl MediaPlaylist {
    pub fn is_live(&self) -> bool {
        !self.end_list
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Identifies one track of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum TrackId {
    Video,
    PrimaryAudio,
    ExtraAudio(usize),
    Subtitle(usize),
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::PrimaryAudio => f.write_str("primary audio"),
            Self::ExtraAudio(i) => write!(f, "extra audio #{}", i + 1),
            Self::Subtitle(i) => write!(f, "subtitle #{}", i + 1),
        }
    }
}
