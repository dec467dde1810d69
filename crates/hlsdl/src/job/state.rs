//! Job state machine and the per-job record owned by the controller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DownloadError;
use crate::hls::{SegmentOutcome, TrackId, TrackPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Resolving,
    Downloading,
    Merging,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Pending, Resolving) => true,
            (Resolving, Downloading) => true,
            (Downloading, Merging) => true,
            (Merging, Completed) => true,
            (from, Failed | Stopped) if !from.is_terminal() => true,
            (from, Pending) if from.is_terminal() => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Segment counters for one track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackProgress {
    pub label: String,
    pub total: usize,
    pub fetched: usize,
    pub failed: usize,
    pub skipped: usize,
    pub dropped: bool,
}

impl TrackProgress {
    pub fn record(&mut self, outcome: &SegmentOutcome) {
        match outcome {
            SegmentOutcome::Fetched { .. } => self.fetched += 1,
            SegmentOutcome::Failed { .. } => self.failed += 1,
            SegmentOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn completed(&self) -> usize {
        self.fetched + self.failed + self.skipped
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub url: Url,
    pub title: String,
    pub output_dir: PathBuf,
    pub plan: Option<TrackPlan>,
    pub status: JobStatus,
    pub tracks: BTreeMap<TrackId, TrackProgress>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub outputs: Vec<PathBuf>,
}

impl Job {
    pub fn new(id: JobId, url: Url, title: String, output_dir: PathBuf) -> Self {
        Self {
            id,
            url,
            title,
            output_dir,
            plan: None,
            status: JobStatus::Pending,
            tracks: BTreeMap::new(),
            error: None,
            warnings: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn transition(&mut self, to: JobStatus) -> Result<JobStatus, DownloadError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(DownloadError::InvalidStateTransition { from, to });
        }
        self.status = to;
        Ok(from)
    }

    /// Back to `Pending` with progress, error and warnings cleared.
    pub fn requeue(&mut self) -> Result<JobStatus, DownloadError> {
        let from = self.transition(JobStatus::Pending)?;
        self.plan = None;
        self.tracks.clear();
        self.error = None;
        self.warnings.clear();
        self.outputs.clear();
        Ok(from)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let mut tracks: Vec<TrackSnapshot> = self
            .tracks
            .iter()
            .map(|(id, progress)| TrackSnapshot {
                track: *id,
                progress: progress.clone(),
            })
            .collect();
        tracks.sort_by_key(|t| t.track);

        JobSnapshot {
            id: self.id,
            url: self.url.to_string(),
            title: self.title.clone(),
            output_dir: self.output_dir.clone(),
            status: self.status,
            variant: self.plan.as_ref().map(|plan| VariantSummary {
                bandwidth: plan.variant.bandwidth,
                resolution: plan.variant.resolution.map(|r| r.to_string()),
                codecs: plan.variant.codecs.clone(),
            }),
            segments_total: self.tracks.values().map(|t| t.total).sum(),
            segments_fetched: self.tracks.values().map(|t| t.fetched).sum(),
            segments_failed: self.tracks.values().map(|t| t.failed).sum(),
            tracks,
            error: self.error.clone(),
            warnings: self.warnings.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantSummary {
    pub bandwidth: u64,
    pub resolution: Option<String>,
    pub codecs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackSnapshot {
    pub track: TrackId,
    #[serde(flatten)]
    pub progress: TrackProgress,
}

/// Read-only view of a job handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub url: String,
    pub title: String,
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub variant: Option<VariantSummary>,
    pub segments_total: usize,
    pub segments_fetched: usize,
    pub segments_failed: usize,
    pub tracks: Vec<TrackSnapshot>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub outputs: Vec<PathBuf>,
}
