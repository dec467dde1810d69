use crate::job::{JobId, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("manifest parse error: {reason}")]
    ManifestParse { reason: String },

    #[error("{failed} of {total} segments failed (first: {first})")]
    PartialFetch {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("key error: {reason}")]
    Key { reason: String },

    #[error("merge failed: {reason}")]
    Merge { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("import error: {reason}")]
    Import { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: JobStatus, to: JobStatus },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            reason: reason.into(),
        }
    }

    pub fn key(reason: impl Into<String>) -> Self {
        Self::Key {
            reason: reason.into(),
        }
    }

    pub fn merge(reason: impl Into<String>) -> Self {
        Self::Merge {
            reason: reason.into(),
        }
    }

    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Classify a reqwest error raised while talking to `url`.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::network(url, err.to_string())
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::ManifestParse { .. }
            | Self::PartialFetch { .. }
            | Self::Key { .. }
            | Self::Merge { .. }
            | Self::Io { .. }
            | Self::Import { .. }
            | Self::Configuration { .. }
            | Self::JobNotFound(_)
            | Self::InvalidStateTransition { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
