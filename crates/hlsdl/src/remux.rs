//! Remux step: stream-copies the assembled track files into the final container.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DownloadError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// External muxing tool. Implementations write `output` atomically and report failure as
/// [`DownloadError::Merge`].
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Mux `video` (and the separate primary `audio`, when present) into `output`.
    async fn merge(
        &self,
        video: &Path,
        audio: Option<&Path>,
        output: &Path,
    ) -> Result<(), DownloadError>;

    /// Rewrap a standalone audio track into `output`.
    async fn extract_audio(&self, audio: &Path, output: &Path) -> Result<(), DownloadError>;
}

/// `out.mp4` -> `out.part.mp4`; the extension stays last so ffmpeg can pick the muxer.
pub fn part_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{stem}.part.{}", ext.to_string_lossy()),
        None => format!("{stem}.part"),
    };
    output.with_file_name(name)
}

/// Drives the `ffmpeg` executable.
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    ffmpeg_path: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn base_args() -> Vec<OsString> {
        ["-nostdin", "-y", "-hide_banner", "-loglevel", "error"]
            .into_iter()
            .map(OsString::from)
            .collect()
    }

    pub fn build_merge_args(video: &Path, audio: Option<&Path>, output: &Path) -> Vec<OsString> {
        let mut args = Self::base_args();
        args.push("-i".into());
        args.push(video.into());
        if let Some(audio) = audio {
            args.push("-i".into());
            args.push(audio.into());
            for arg in ["-map", "0:v:0?", "-map", "1:a:0?"] {
                args.push(arg.into());
            }
        }
        for arg in ["-c", "copy", "-movflags", "+faststart"] {
            args.push(arg.into());
        }
        args.push(output.into());
        args
    }

    pub fn build_extract_args(audio: &Path, output: &Path) -> Vec<OsString> {
        let mut args = Self::base_args();
        args.push("-i".into());
        args.push(audio.into());
        for arg in ["-vn", "-c", "copy"] {
            args.push(arg.into());
        }
        args.push(output.into());
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.env("LC_ALL", "C").kill_on_drop(true);
        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }

    /// Run ffmpeg writing to a `.part` file, then move it over `output`.
    async fn run(&self, args: Vec<OsString>, part: &Path, output: &Path) -> Result<(), DownloadError> {
        debug!(ffmpeg = %self.ffmpeg_path.display(), ?args, "Running ffmpeg");

        let result = self
            .command()
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                DownloadError::merge(format!(
                    "failed to launch {}: {e}",
                    self.ffmpeg_path.display()
                ))
            });
        let command_output = match result {
            Ok(output) => output,
            Err(e) => {
                let _ = tokio::fs::remove_file(part).await;
                return Err(e);
            }
        };

        if !command_output.status.success() {
            let _ = tokio::fs::remove_file(part).await;
            let stderr = String::from_utf8_lossy(&command_output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("unknown ffmpeg error");
            return Err(DownloadError::merge(format!(
                "ffmpeg exited with code {}: {}",
                command_output.status.code().unwrap_or(-1),
                message.trim()
            )));
        }

        finalize_part(part, output).await
    }
}

/// Check that `part` exists and is non-empty, then rename it to `output`.
pub async fn finalize_part(part: &Path, output: &Path) -> Result<(), DownloadError> {
    match tokio::fs::metadata(part).await {
        Ok(meta) if meta.len() > 0 => {}
        Ok(_) => {
            let _ = tokio::fs::remove_file(part).await;
            return Err(DownloadError::merge(format!(
                "remux produced an empty file: {}",
                part.display()
            )));
        }
        Err(_) => {
            return Err(DownloadError::merge(format!(
                "remux produced no output: {}",
                part.display()
            )));
        }
    }
    tokio::fs::rename(part, output).await?;
    info!(output = %output.display(), "Remux finished");
    Ok(())
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn merge(
        &self,
        video: &Path,
        audio: Option<&Path>,
        output: &Path,
    ) -> Result<(), DownloadError> {
        let part = part_path(output);
        let args = Self::build_merge_args(video, audio, &part);
        self.run(args, &part, output).await
    }

    async fn extract_audio(&self, audio: &Path, output: &Path) -> Result<(), DownloadError> {
        let part = part_path(output);
        let args = Self::build_extract_args(audio, &part);
        self.run(args, &part, output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn part_path_keeps_extension_last() {
        assert_eq!(
            part_path(Path::new("/out/T/T.mp4")),
            Path::new("/out/T/T.part.mp4")
        );
        assert_eq!(
            part_path(Path::new("/out/T/T.audio.es.m4a")),
            Path::new("/out/T/T.audio.es.part.m4a")
        );
    }

    #[test]
    fn merge_args_map_video_and_audio() {
        let args = FfmpegRemuxer::build_merge_args(
            Path::new("v.ts"),
            Some(Path::new("a.ts")),
            Path::new("out.part.mp4"),
        );
        assert_eq!(
            strings(&args),
            vec![
                "-nostdin", "-y", "-hide_banner", "-loglevel", "error", "-i", "v.ts", "-i",
                "a.ts", "-map", "0:v:0?", "-map", "1:a:0?", "-c", "copy", "-movflags",
                "+faststart", "out.part.mp4",
            ]
        );
    }

    #[test]
    fn merge_args_without_audio_copy_everything() {
        let args = FfmpegRemuxer::build_merge_args(Path::new("v.ts"), None, Path::new("o.mp4"));
        let args = strings(&args);
        assert!(!args.contains(&"-map".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("o.mp4"));
    }

    #[test]
    fn extract_args_drop_video() {
        let args = FfmpegRemuxer::build_extract_args(Path::new("a.ts"), Path::new("o.part.m4a"));
        let args = strings(&args);
        assert!(args.contains(&"-vn".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("o.part.m4a"));
    }

    #[tokio::test]
    async fn missing_executable_is_merge_error() {
        let dir = tempfile::tempdir().unwrap();
        let remuxer = FfmpegRemuxer::new(dir.path().join("no-such-ffmpeg"));
        let err = remuxer
            .merge(
                &dir.path().join("v.ts"),
                None,
                &dir.path().join("out.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Merge { .. }));
    }

    #[tokio::test]
    async fn empty_part_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("o.part.mp4");
        tokio::fs::write(&part, b"").await.unwrap();
        let err = finalize_part(&part, &dir.path().join("o.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Merge { .. }));
        assert!(!dir.path().join("o.mp4").exists());
    }

    #[tokio::test]
    async fn part_is_renamed_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("o.part.mp4");
        tokio::fs::write(&part, b"container").await.unwrap();
        finalize_part(&part, &dir.path().join("o.mp4")).await.unwrap();
        assert!(!part.exists());
        assert_eq!(std::fs::read(dir.path().join("o.mp4")).unwrap(), b"container");
    }
}
