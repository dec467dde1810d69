use std::path::PathBuf;

use serde::Serialize;

use super::state::{JobId, JobStatus};
use crate::hls::{SegmentOutcome, TrackId};

/// Events published by the job controller on its broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Added {
        id: JobId,
        title: String,
        url: String,
    },
    StatusChanged {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    /// A track's media playlist was resolved.
    TrackPlanned {
        id: JobId,
        track: TrackId,
        label: String,
        total_segments: usize,
    },
    SegmentFinished {
        id: JobId,
        track: TrackId,
        index: usize,
        outcome: SegmentOutcome,
    },
    Warning {
        id: JobId,
        message: String,
    },
    Completed {
        id: JobId,
        outputs: Vec<PathBuf>,
    },
    Failed {
        id: JobId,
        error: String,
    },
    Removed {
        id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Added { id, .. }
            | Self::StatusChanged { id, .. }
            | Self::TrackPlanned { id, .. }
            | Self::SegmentFinished { id, .. }
            | Self::Warning { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::Removed { id } => *id,
        }
    }
}
