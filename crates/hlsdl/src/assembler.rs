// Track assembly for one job: resolve the manifest, fetch every selected track into the work
// directory, then hand the track files to the remuxer.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::DownloadError;
use crate::fetcher::Fetcher;
use crate::hls::subtitle::{ensure_webvtt_header, join_webvtt};
use crate::hls::{
    MediaPlaylist, PlannedTrack, Playlist, ResolutionPreference, SegmentCipher, SegmentOutcome,
    SegmentPool, SegmentSink, TrackId, TrackPlan, WriterSink, parse_playlist, select,
};
use crate::layout::OutputLayout;
use crate::remux::Remuxer;

/// Receives progress from the assembler. The job controller implements it; the assembler
/// never touches job state directly.
pub trait TrackObserver: Send + Sync {
    fn track_planned(&self, track: TrackId, label: &str, total_segments: usize);
    fn segment_finished(&self, track: TrackId, index: usize, outcome: &SegmentOutcome);
    fn track_dropped(&self, track: TrackId, label: &str, reason: &str);
    fn warning(&self, message: String);
}

/// Outcome of manifest resolution.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub plan: TrackPlan,
    /// Set when the source URL was itself a media playlist; reused for the video track.
    pub video_playlist: Option<MediaPlaylist>,
}

#[derive(Debug, Clone)]
pub struct FetchedTrack {
    pub id: TrackId,
    pub label: String,
    pub path: PathBuf,
}

/// Track files waiting in the work directory.
#[derive(Debug, Clone, Default)]
pub struct FetchedTracks {
    pub video: Option<PathBuf>,
    pub primary_audio: Option<PathBuf>,
    pub extra_audio: Vec<FetchedTrack>,
    pub subtitles: Vec<FetchedTrack>,
}

/// Settings the assembler reads from the engine configuration.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    pub preference: ResolutionPreference,
    pub download_subtitles: bool,
    pub require_primary_audio: bool,
    pub concurrency: usize,
}

pub struct TrackAssembler {
    fetcher: Fetcher,
    pool: SegmentPool,
    remuxer: Arc<dyn Remuxer>,
    options: AssemblyOptions,
    layout: OutputLayout,
    work_dir: PathBuf,
}

impl TrackAssembler {
    pub fn new(
        fetcher: Fetcher,
        remuxer: Arc<dyn Remuxer>,
        options: AssemblyOptions,
        layout: OutputLayout,
        work_name: &str,
    ) -> Self {
        let cipher = SegmentCipher::new(fetcher.clone());
        let pool = SegmentPool::new(fetcher.clone(), cipher, options.concurrency);
        let work_dir = layout.dir().join(work_name);
        Self {
            fetcher,
            pool,
            remuxer,
            options,
            layout,
            work_dir,
        }
    }

    /// Fetch the source manifest and select tracks.
    pub async fn resolve(
        &self,
        source: &Url,
        token: &CancellationToken,
    ) -> Result<ResolvedPlan, DownloadError> {
        let body = self.fetcher.fetch(source, token).await?;
        match parse_playlist(&body, source)? {
            Playlist::Master(master) => {
                let plan = select(
                    &master,
                    self.options.preference,
                    self.options.download_subtitles,
                )?;
                info!(
                    url = %plan.variant.url,
                    bandwidth = plan.variant.bandwidth,
                    resolution = ?plan.variant.resolution.map(|r| r.to_string()),
                    extra_audio = plan.extra_audio.len(),
                    subtitles = plan.subtitles.len(),
                    "Selected variant"
                );
                Ok(ResolvedPlan {
                    plan,
                    video_playlist: None,
                })
            }
            Playlist::Media(media) => {
                debug!(url = %source, "Source is a media playlist");
                Ok(ResolvedPlan {
                    plan: TrackPlan::implicit(source.clone()),
                    video_playlist: Some(media),
                })
            }
        }
    }

    async fn load_media(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<MediaPlaylist, DownloadError> {
        let body = self.fetcher.fetch(url, token).await?;
        match parse_playlist(&body, url)? {
            Playlist::Media(media) => Ok(media),
            Playlist::Master(_) => Err(DownloadError::manifest(format!(
                "expected a media playlist at {url}"
            ))),
        }
    }

    /// Fetch every track of `resolved` in order: video, primary audio, extra audio,
    /// subtitles. Cancellation is checked between tracks.
    pub async fn fetch_tracks(
        &self,
        resolved: ResolvedPlan,
        token: &CancellationToken,
        observer: &dyn TrackObserver,
    ) -> Result<FetchedTracks, DownloadError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let ResolvedPlan {
            plan,
            mut video_playlist,
        } = resolved;
        let mut fetched = FetchedTracks::default();

        for track in plan.tracks() {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let result = match track.id {
                TrackId::Subtitle(_) => self.fetch_subtitle(&track, token, observer).await,
                _ => {
                    let preloaded = match track.id {
                        TrackId::Video => video_playlist.take(),
                        _ => None,
                    };
                    self.fetch_media_track(&track, preloaded, token, observer)
                        .await
                }
            };

            match result {
                Ok(path) => match track.id {
                    TrackId::Video => fetched.video = Some(path),
                    TrackId::PrimaryAudio => fetched.primary_audio = Some(path),
                    TrackId::ExtraAudio(_) => fetched.extra_audio.push(FetchedTrack {
                        id: track.id,
                        label: track.label.clone(),
                        path,
                    }),
                    TrackId::Subtitle(_) => fetched.subtitles.push(FetchedTrack {
                        id: track.id,
                        label: track.label.clone(),
                        path,
                    }),
                },
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) if self.is_mandatory(track.id) => {
                    warn!(track = %track.id, error = %e, "Mandatory track failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(track = %track.id, label = %track.label, error = %e, "Dropping track");
                    observer.track_dropped(track.id, &track.label, &e.to_string());
                }
            }
        }

        Ok(fetched)
    }

    fn is_mandatory(&self, id: TrackId) -> bool {
        match id {
            TrackId::Video => true,
            TrackId::PrimaryAudio => self.options.require_primary_audio,
            TrackId::ExtraAudio(_) | TrackId::Subtitle(_) => false,
        }
    }

    fn track_file(&self, id: TrackId, ext: &str) -> PathBuf {
        let stem = match id {
            TrackId::Video => "video".to_string(),
            TrackId::PrimaryAudio => "audio".to_string(),
            TrackId::ExtraAudio(i) => format!("audio-{i}"),
            TrackId::Subtitle(i) => format!("subtitle-{i}"),
        };
        self.work_dir.join(format!("{stem}.{ext}"))
    }

    async fn fetch_media_track(
        &self,
        track: &PlannedTrack,
        preloaded: Option<MediaPlaylist>,
        token: &CancellationToken,
        observer: &dyn TrackObserver,
    ) -> Result<PathBuf, DownloadError> {
        let media = match preloaded {
            Some(media) => media,
            None => self.load_media(&track.url, token).await?,
        };
        if media.is_live() {
            observer.warning(format!(
                "{} playlist is live; downloading the {} segments present at resolution time",
                track.label,
                media.segments.len()
            ));
        }
        observer.track_planned(track.id, &track.label, media.segments.len());

        let ext = if media.init_segment.is_some() { "mp4" } else { "ts" };
        let path = self.track_file(track.id, ext);
        let mut sink = WriterSink::new(BufWriter::new(File::create(&path).await?));

        if let Some(init) = &media.init_segment {
            let data = self
                .fetcher
                .fetch_range(&init.url, init.byte_range, token)
                .await?;
            sink.write_segment(data).await?;
        }

        let id = track.id;
        let report = self
            .pool
            .fetch_into(
                &media.segments,
                token,
                |index, outcome| observer.segment_finished(id, index, outcome),
                &mut sink,
            )
            .await?;
        sink.finish().await?;

        debug!(
            track = %track.id,
            fetched = report.fetched,
            skipped = report.skipped,
            path = %path.display(),
            "Track assembled"
        );
        Ok(path)
    }

    /// A subtitle URL may be a media playlist of WebVTT fragments or the file itself.
    async fn fetch_subtitle(
        &self,
        track: &PlannedTrack,
        token: &CancellationToken,
        observer: &dyn TrackObserver,
    ) -> Result<PathBuf, DownloadError> {
        let body = self.fetcher.fetch(&track.url, token).await?;
        let is_playlist = String::from_utf8_lossy(&body[..body.len().min(64)])
            .trim_start_matches('\u{feff}')
            .trim_start()
            .starts_with("#EXTM3U");

        let text = if is_playlist {
            let media = match parse_playlist(&body, &track.url)? {
                Playlist::Media(media) => media,
                Playlist::Master(_) => {
                    return Err(DownloadError::manifest(format!(
                        "expected a subtitle playlist at {}",
                        track.url
                    )));
                }
            };
            observer.track_planned(track.id, &track.label, media.segments.len());
            let id = track.id;
            let fragments = self
                .pool
                .fetch_all(&media.segments, token, |index, outcome| {
                    observer.segment_finished(id, index, outcome)
                })
                .await?;
            join_webvtt(&fragments)
        } else {
            observer.track_planned(track.id, &track.label, 1);
            observer.segment_finished(
                track.id,
                0,
                &SegmentOutcome::Fetched { bytes: body.len() },
            );
            ensure_webvtt_header(&body)
        };

        let path = self.track_file(track.id, "vtt");
        tokio::fs::write(&path, text).await?;
        Ok(path)
    }

    /// Mux the container, rewrap extra audio and move subtitles into the output directory.
    /// Returns the final files. Once started this runs to completion.
    pub async fn finalize(
        &mut self,
        fetched: FetchedTracks,
        observer: &dyn TrackObserver,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let video = fetched
            .video
            .ok_or_else(|| DownloadError::merge("no video track was assembled"))?;
        tokio::fs::create_dir_all(self.layout.dir()).await?;

        let container = self.layout.container();
        self.remuxer
            .merge(&video, fetched.primary_audio.as_deref(), &container)
            .await?;
        let mut outputs = vec![container];

        for track in &fetched.extra_audio {
            let output = self.layout.extra_audio(Some(&track.label));
            match self.remuxer.extract_audio(&track.path, &output).await {
                Ok(()) => outputs.push(output),
                Err(e) => {
                    warn!(label = %track.label, error = %e, "Extra audio extraction failed");
                    observer.track_dropped(track.id, &track.label, &e.to_string());
                }
            }
        }

        for track in &fetched.subtitles {
            let output = self.layout.subtitle(Some(&track.label));
            match tokio::fs::rename(&track.path, &output).await {
                Ok(()) => outputs.push(output),
                Err(e) => {
                    warn!(label = %track.label, error = %e, "Failed to move subtitle");
                    observer.track_dropped(track.id, &track.label, &e.to_string());
                }
            }
        }

        info!(outputs = outputs.len(), dir = %self.layout.dir().display(), "Job output written");
        Ok(outputs)
    }

    /// Remove the work directory, and the output directory too if nothing else is in it.
    pub async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.work_dir.display(), error = %e, "Failed to remove work directory"),
        }
        // Fails harmlessly when the directory holds outputs.
        let _ = tokio::fs::remove_dir(self.layout.dir()).await;
    }
}
