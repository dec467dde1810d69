// HLS building blocks: playlist model and parsing, track selection, segment fetching.

pub mod decryption;
pub mod model;
pub mod playlist;
pub mod pool;
pub mod selection;
pub mod subtitle;

pub use decryption::SegmentCipher;
pub use model::{
    ByteRange, InitSegment, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist, Rendition,
    RenditionKind, Resolution, Segment, SegmentKey, TrackId, Variant,
};
pub use playlist::parse_playlist;
pub use pool::{PoolReport, SegmentOutcome, SegmentPool, SegmentSink, WriterSink};
pub use selection::{PlannedTrack, ResolutionPreference, TrackPlan, select, select_variant};
