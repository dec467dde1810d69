//! HLS (m3u8) retrieval and assembly engine.
//!
//! A [`JobManager`] owns download jobs. Each job resolves its manifest, selects a video
//! variant with its audio and subtitle renditions, fetches every segment through a bounded
//! worker pool and hands the assembled track files to a [`Remuxer`].

pub mod assembler;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod hls;
pub mod job;
pub mod layout;
pub mod remux;
pub mod retry;

#[cfg(test)]
mod test_utils;

pub use assembler::{TrackAssembler, TrackObserver};
pub use config::{DownloaderConfig, EngineConfig};
pub use error::DownloadError;
pub use fetcher::{Fetcher, HttpTransport, ReqwestTransport};
pub use hls::{ResolutionPreference, SegmentOutcome, TrackId};
pub use job::{ImportSummary, JobEvent, JobId, JobManager, JobSnapshot, JobStatus};
pub use remux::{FfmpegRemuxer, Remuxer};
pub use retry::RetryPolicy;
