use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hlsdl_engine::{DownloaderConfig, EngineConfig, ResolutionPreference};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::cli::Args;
use crate::error::{AppError, Result};

const CONFIG_FILE: &str = "config.toml";

/// Settings read from the optional TOML file. Every field may be omitted.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub resolution: ResolutionPreference,
    pub subtitles: bool,
    pub concurrency: usize,
    pub max_jobs: usize,
    pub require_primary_audio: bool,
    pub ffmpeg: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub headers: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let http = DownloaderConfig::default();
        Self {
            output_dir: engine.output_root,
            resolution: engine.preference,
            subtitles: engine.download_subtitles,
            concurrency: engine.concurrency,
            max_jobs: engine.max_concurrent_jobs,
            require_primary_audio: engine.require_primary_audio,
            ffmpeg: None,
            user_agent: None,
            timeout_secs: http.timeout.as_secs(),
            connect_timeout_secs: http.connect_timeout.as_secs(),
            retries: http.max_retries,
            retry_delay_ms: http.retry_delay.as_millis() as u64,
            headers: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Default file location: `<config dir>/hlsdl/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hlsdl").join(CONFIG_FILE))
    }

    /// Load `path`, or the default file when it exists, or the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        debug!(path = %path.display(), "Loading configuration");
        let text = std::fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Overlay command line flags; flags win over the file.
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(dir) = &args.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(resolution) = args.resolution {
            self.resolution = resolution;
        }
        if args.no_subtitles {
            self.subtitles = false;
        }
        if let Some(n) = args.concurrency {
            self.concurrency = n;
        }
        if let Some(n) = args.max_jobs {
            self.max_jobs = n;
        }
        if args.allow_missing_audio {
            self.require_primary_audio = false;
        }
        if let Some(ffmpeg) = &args.ffmpeg {
            self.ffmpeg = Some(ffmpeg.clone());
        }
        if let Some(ua) = &args.user_agent {
            self.user_agent = Some(ua.clone());
        }
        if let Some(secs) = args.timeout {
            self.timeout_secs = secs;
        }
        if let Some(n) = args.retries {
            self.retries = n;
        }
        for header in &args.headers {
            if let Some((name, value)) = header.split_once(':') {
                self.headers
                    .insert(name.trim().to_string(), value.trim().to_string());
            } else {
                // Kept so engine_config reports it.
                self.headers.insert(header.clone(), String::new());
            }
        }
        self
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let http_defaults = DownloaderConfig::default();

        let http = DownloaderConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or(http_defaults.user_agent.clone()),
            headers: header_map(&self.headers)?,
            max_retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..http_defaults
        };

        let config = EngineConfig {
            output_root: self.output_dir.clone(),
            preference: self.resolution,
            download_subtitles: self.subtitles,
            concurrency: self.concurrency,
            max_concurrent_jobs: self.max_jobs,
            require_primary_audio: self.require_primary_audio,
            ffmpeg_path: self.ffmpeg.clone().unwrap_or(defaults.ffmpeg_path),
            http,
        };
        config.validate()?;
        Ok(config)
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::InvalidInput(format!("header name `{name}`: {e}")))?;
        if value.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "header `{name}` must be written as `Name: value`"
            )));
        }
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| AppError::InvalidInput(format!("header `{name}`: {e}")))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn file_values_and_defaults() {
        let config = AppConfig::parse(
            r#"
            output_dir = "/media/hls"
            resolution = 1080
            subtitles = false

            [headers]
            Referer = "https://example.com/"
            "#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/media/hls"));
        assert_eq!(config.resolution, ResolutionPreference::Height(1080));
        assert!(!config.subtitles);
        assert_eq!(config.concurrency, AppConfig::default().concurrency);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.http.headers["referer"], "https://example.com/");
        assert!(!engine.download_subtitles);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            AppConfig::parse("threads = 4"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn flags_override_file() {
        let file = AppConfig::parse("resolution = \"480p\"\nconcurrency = 2\n").unwrap();
        let args = Args::try_parse_from([
            "hlsdl",
            "-r",
            "best",
            "-j",
            "16",
            "--allow-missing-audio",
            "-H",
            "X-Token: abc",
            "http://h/a.m3u8",
        ])
        .unwrap();
        let config = file.with_args(&args);
        assert_eq!(config.resolution, ResolutionPreference::Best);
        assert_eq!(config.concurrency, 16);
        assert!(!config.require_primary_audio);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.http.headers["x-token"], "abc");
    }

    #[test]
    fn malformed_header_and_zero_concurrency_fail() {
        let args = Args::try_parse_from(["hlsdl", "-H", "no-colon", "http://h/a.m3u8"]).unwrap();
        assert!(AppConfig::default().with_args(&args).engine_config().is_err());

        let config = AppConfig {
            concurrency: 0,
            ..AppConfig::default()
        };
        assert!(matches!(config.engine_config(), Err(AppError::Download(_))));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());

        let present = dir.path().join("config.toml");
        std::fs::write(&present, "max_jobs = 4\n").unwrap();
        assert_eq!(AppConfig::load(Some(&present)).unwrap().max_jobs, 4);
    }
}
