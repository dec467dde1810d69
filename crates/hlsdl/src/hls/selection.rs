use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use super::model::{MasterPlaylist, Rendition, RenditionKind, TrackId, Variant};
use crate::error::DownloadError;

/// Preferred video height, or the highest-bandwidth variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPreference {
    #[default]
    Best,
    Height(u64),
}

impl FromStr for ResolutionPreference {
    type Err = DownloadError;

    /// Accepts `best`, `720` or `720p` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        if value == "best" {
            return Ok(Self::Best);
        }
        let digits = value.strip_suffix('p').unwrap_or(&value);
        match digits.parse::<u64>() {
            Ok(height) if height > 0 => Ok(Self::Height(height)),
            _ => Err(DownloadError::Configuration {
                reason: format!("invalid resolution preference `{s}` (expected `best` or a height such as `720p`)"),
            }),
        }
    }
}

impl fmt::Display for ResolutionPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => f.write_str("best"),
            Self::Height(h) => write!(f, "{h}p"),
        }
    }
}

impl Serialize for ResolutionPreference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResolutionPreference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(h) => h.to_string().parse().map_err(serde::de::Error::custom),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// The resolved track selection for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPlan {
    pub variant: Variant,
    pub primary_audio: Option<Rendition>,
    pub extra_audio: Vec<Rendition>,
    pub subtitles: Vec<Rendition>,
}

/// A track that has its own media playlist to fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrack {
    pub id: TrackId,
    pub label: String,
    pub url: Url,
}

impl TrackPlan {
    /// Plan for a source URL that is already a media playlist.
    pub fn implicit(url: Url) -> Self {
        Self {
            variant: Variant {
                url,
                bandwidth: 0,
                resolution: None,
                audio_group: None,
                subtitle_group: None,
                codecs: None,
            },
            primary_audio: None,
            extra_audio: Vec::new(),
            subtitles: Vec::new(),
        }
    }

    /// Tracks in processing order: video, primary audio, extra audio, subtitles.
    /// Renditions without a playlist URL are carried by the variant and are left out.
    pub fn tracks(&self) -> Vec<PlannedTrack> {
        let mut tracks = vec![PlannedTrack {
            id: TrackId::Video,
            label: "video".to_string(),
            url: self.variant.url.clone(),
        }];

        if let Some(audio) = &self.primary_audio
            && let Some(url) = &audio.url
        {
            tracks.push(PlannedTrack {
                id: TrackId::PrimaryAudio,
                label: audio.label().unwrap_or("audio").to_string(),
                url: url.clone(),
            });
        }

        for (index, audio) in self.extra_audio.iter().enumerate() {
            if let Some(url) = &audio.url {
                tracks.push(PlannedTrack {
                    id: TrackId::ExtraAudio(index),
                    label: audio.label().unwrap_or("audio").to_string(),
                    url: url.clone(),
                });
            }
        }

        for (index, subtitle) in self.subtitles.iter().enumerate() {
            if let Some(url) = &subtitle.url {
                tracks.push(PlannedTrack {
                    id: TrackId::Subtitle(index),
                    label: subtitle.label().unwrap_or("sub").to_string(),
                    url: url.clone(),
                });
            }
        }

        tracks
    }
}

/// Pick the variant for `preference`.
///
/// An exact height match wins (first declared). Otherwise the highest bandwidth, ties going
/// to the taller variant and then to the earlier one.
pub fn select_variant(
    variants: &[Variant],
    preference: ResolutionPreference,
) -> Option<&Variant> {
    if let ResolutionPreference::Height(height) = preference
        && let Some(exact) = variants.iter().find(|v| v.height() == Some(height))
    {
        return Some(exact);
    }

    let mut best: Option<&Variant> = None;
    for variant in variants {
        let better = match best {
            None => true,
            Some(current) => {
                (variant.bandwidth, variant.height().unwrap_or(0))
                    > (current.bandwidth, current.height().unwrap_or(0))
            }
        };
        if better {
            best = Some(variant);
        }
    }
    best
}

/// Build the track plan for a master playlist. Deterministic for a given manifest and
/// preference.
pub fn select(
    master: &MasterPlaylist,
    preference: ResolutionPreference,
    download_subtitles: bool,
) -> Result<TrackPlan, DownloadError> {
    let variant = select_variant(&master.variants, preference)
        .ok_or_else(|| DownloadError::manifest("master playlist declares no variants"))?
        .clone();

    let (primary_audio, extra_audio) = match variant.audio_group.as_deref() {
        Some(group) => {
            let audio: Vec<&Rendition> = master.group(RenditionKind::Audio, group).collect();
            let primary_index = audio.iter().position(|r| r.is_default).unwrap_or(0);
            let primary = audio.get(primary_index).map(|r| (*r).clone());
            let extras = audio
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != primary_index)
                .map(|(_, r)| (*r).clone())
                .collect();
            (primary, extras)
        }
        None => (None, Vec::new()),
    };

    let subtitles = match (download_subtitles, variant.subtitle_group.as_deref()) {
        (true, Some(group)) => master
            .group(RenditionKind::Subtitles, group)
            .cloned()
            .collect(),
        _ => Vec::new(),
    };

    Ok(TrackPlan {
        variant,
        primary_audio,
        extra_audio,
        subtitles,
    })
}
