use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::DownloadError;
use crate::hls::ResolutionPreference;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP settings shared by manifest, segment and key requests.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Deadline for a single request, body included.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Extra headers sent with every request; they override the defaults.
    pub headers: HeaderMap,

    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,

    /// Linear backoff step: the n-th retry waits `retry_delay * n`.
    pub retry_delay: Duration,

    /// Upper bound for a single backoff sleep.
    pub max_retry_delay: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(10),
        }
    }
}

impl DownloaderConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
            jitter: true,
        }
    }

    /// Defaults merged with the user supplied headers (user values win).
    pub fn effective_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        for (name, value) in self.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }
}

/// Everything a job needs besides its own URL and title.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory; each job writes into `<output_root>/<title>/`.
    pub output_root: PathBuf,

    pub preference: ResolutionPreference,

    /// Select subtitle renditions of the chosen variant.
    pub download_subtitles: bool,

    /// Concurrent segment fetches within one track.
    pub concurrency: usize,

    /// Jobs allowed past `Pending` at the same time.
    pub max_concurrent_jobs: usize,

    /// Fail the job when a separate primary audio track cannot be fetched.
    /// When false the track is dropped and the video is merged on its own.
    pub require_primary_audio: bool,

    /// Remux tool executable.
    pub ffmpeg_path: PathBuf,

    pub http: DownloaderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("downloads"),
            preference: ResolutionPreference::Best,
            download_subtitles: true,
            concurrency: 8,
            max_concurrent_jobs: 2,
            require_primary_audio: true,
            ffmpeg_path: PathBuf::from(
                std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ),
            http: DownloaderConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.concurrency == 0 {
            return Err(DownloadError::Configuration {
                reason: "segment concurrency must be at least 1".to_string(),
            });
        }
        if self.max_concurrent_jobs == 0 {
            return Err(DownloadError::Configuration {
                reason: "max concurrent jobs must be at least 1".to_string(),
            });
        }
        if self.output_root.as_os_str().is_empty() {
            return Err(DownloadError::Configuration {
                reason: "output root directory is not set".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = EngineConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DownloadError::Configuration { .. })
        ));
    }

    #[test]
    fn user_headers_override_defaults() {
        let mut config = DownloaderConfig::default();
        config
            .headers
            .insert(reqwest::header::ACCEPT, HeaderValue::from_static("video/*"));
        let headers = config.effective_headers();
        assert_eq!(headers.get(reqwest::header::ACCEPT).unwrap(), "video/*");
        assert!(headers.contains_key(reqwest::header::CONNECTION));
    }
}
