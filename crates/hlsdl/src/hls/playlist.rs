// Playlist parsing: m3u8-rs output turned into resolved, absolute descriptors.

use m3u8_rs::{AlternativeMediaType, parse_playlist_res};
use tracing::{debug, warn};
use url::Url;

use super::model::{
    ByteRange, InitSegment, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist, Rendition,
    RenditionKind, Resolution, Segment, SegmentKey, Variant,
};
use crate::error::DownloadError;

/// Parse master or media playlist text. Relative URIs resolve against `base_url`, the URL the
/// playlist was fetched from.
pub fn parse_playlist(bytes: &[u8], base_url: &Url) -> Result<Playlist, DownloadError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| DownloadError::manifest(format!("playlist is not valid UTF-8: {e}")))?;
    let text = text.trim_start_matches('\u{feff}');
    if !text.trim_start().starts_with("#EXTM3U") {
        return Err(DownloadError::manifest("missing #EXTM3U header"));
    }

    match parse_playlist_res(text.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => {
            convert_master(pl, base_url).map(Playlist::Master)
        }
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => {
            convert_media(pl, &key_resets(text), base_url).map(Playlist::Media)
        }
        Err(e) => Err(DownloadError::manifest(format!(
            "failed to parse playlist: {e}"
        ))),
    }
}

fn resolve(base_url: &Url, uri: &str) -> Result<Url, DownloadError> {
    base_url
        .join(uri.trim())
        .map_err(|e| DownloadError::invalid_url(uri, e.to_string()))
}

fn convert_master(pl: m3u8_rs::MasterPlaylist, base_url: &Url) -> Result<MasterPlaylist, DownloadError> {
    let mut variants = Vec::with_capacity(pl.variants.len());
    for variant in pl.variants.into_iter().filter(|v| !v.is_i_frame) {
        if variant.uri.trim().is_empty() {
            warn!("Skipping variant without URI");
            continue;
        }
        variants.push(Variant {
            url: resolve(base_url, &variant.uri)?,
            bandwidth: variant.bandwidth,
            resolution: variant.resolution.map(|r| Resolution {
                width: r.width,
                height: r.height,
            }),
            audio_group: variant.audio,
            subtitle_group: variant.subtitles,
            codecs: variant.codecs,
        });
    }

    if variants.is_empty() {
        return Err(DownloadError::manifest("master playlist declares no variants"));
    }

    let mut renditions = Vec::new();
    for media in pl.alternatives {
        let kind = match media.media_type {
            AlternativeMediaType::Audio => RenditionKind::Audio,
            AlternativeMediaType::Subtitles => RenditionKind::Subtitles,
            _ => continue,
        };
        let url = match media.uri.as_deref().map(str::trim) {
            Some(uri) if !uri.is_empty() => Some(resolve(base_url, uri)?),
            _ => None,
        };
        renditions.push(Rendition {
            group_id: media.group_id,
            kind,
            language: media.language,
            name: media.name,
            is_default: media.default,
            url,
        });
    }

    debug!(
        variants = variants.len(),
        renditions = renditions.len(),
        "Parsed master playlist"
    );
    Ok(MasterPlaylist {
        variants,
        renditions,
    })
}

fn convert_key(key: &m3u8_rs::Key, base_url: &Url) -> Result<Option<SegmentKey>, DownloadError> {
    let method = match &key.method {
        m3u8_rs::KeyMethod::None => return Ok(None),
        m3u8_rs::KeyMethod::AES128 => KeyMethod::Aes128,
        m3u8_rs::KeyMethod::SampleAES => KeyMethod::SampleAes,
        m3u8_rs::KeyMethod::Other(other) => KeyMethod::Other(other.clone()),
    };
    let url = match key.uri.as_deref().map(str::trim) {
        Some(uri) if !uri.is_empty() => Some(resolve(base_url, uri)?),
        _ => None,
    };
    Ok(Some(SegmentKey {
        method,
        url,
        iv: key.iv.clone(),
    }))
}

fn convert_map(map: &m3u8_rs::Map, base_url: &Url) -> Result<InitSegment, DownloadError> {
    Ok(InitSegment {
        url: resolve(base_url, &map.uri)?,
        byte_range: map.byte_range.as_ref().map(|r| ByteRange {
            length: r.length,
            offset: r.offset.unwrap_or(0),
        }),
    })
}

/// m3u8-rs attaches `EXT-X-MAP` to the following segment; a map declared with no segment
/// after it only shows up as an unknown tag.
fn playlist_level_map(pl: &m3u8_rs::MediaPlaylist) -> Option<m3u8_rs::Map> {
    let tag = pl.unknown_tags.iter().find(|t| t.tag == "X-MAP")?;
    let rest = tag.rest.as_deref()?;
    let mut uri = None;
    let mut byte_range = None;
    for part in rest.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        if key.trim().eq_ignore_ascii_case("URI") {
            uri = Some(value.to_string());
        } else if key.trim().eq_ignore_ascii_case("BYTERANGE") {
            let (length, offset) = value.split_once('@').unwrap_or((value, ""));
            if let Ok(length) = length.parse::<u64>() {
                byte_range = Some(m3u8_rs::ByteRange {
                    length,
                    offset: offset.parse::<u64>().ok(),
                });
            }
        }
    }
    Some(m3u8_rs::Map {
        uri: uri?,
        byte_range,
        other_attributes: Default::default(),
    })
}

/// m3u8-rs drops `#EXT-X-KEY:METHOD=NONE`, so encryption resets are read from the text.
/// One entry per segment URI line, true when the last key tag before it was `METHOD=NONE`.
fn key_resets(text: &str) -> Vec<bool> {
    let mut resets = Vec::new();
    let mut pending = false;
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            pending = attrs
                .split(',')
                .filter_map(|attr| attr.split_once('='))
                .any(|(name, value)| {
                    name.trim().eq_ignore_ascii_case("METHOD")
                        && value.trim().eq_ignore_ascii_case("NONE")
                });
        } else if !line.starts_with('#') {
            resets.push(pending);
            pending = false;
        }
    }
    resets
}

fn convert_media(
    pl: m3u8_rs::MediaPlaylist,
    key_resets: &[bool],
    base_url: &Url,
) -> Result<MediaPlaylist, DownloadError> {
    let mut init_segment = None;
    let mut current_key: Option<SegmentKey> = None;
    let mut last_range: Option<(String, u64)> = None;
    let mut segments = Vec::with_capacity(pl.segments.len());

    for (position, segment) in pl.segments.iter().enumerate() {
        if let Some(key) = &segment.key {
            current_key = convert_key(key, base_url)?;
        } else if key_resets.get(position).copied().unwrap_or(false) {
            current_key = None;
        }
        if init_segment.is_none()
            && let Some(map) = &segment.map
        {
            init_segment = Some(convert_map(map, base_url)?);
        }

        let uri = segment.uri.trim();
        if uri.is_empty() {
            warn!(position, "Skipping segment with empty URI");
            continue;
        }

        let byte_range = match &segment.byte_range {
            Some(range) => {
                let offset = range.offset.unwrap_or_else(|| match &last_range {
                    Some((prev_uri, end)) if prev_uri == uri => *end,
                    _ => 0,
                });
                let resolved = ByteRange {
                    length: range.length,
                    offset,
                };
                last_range = Some((uri.to_string(), resolved.end()));
                Some(resolved)
            }
            None => {
                last_range = None;
                None
            }
        };

        segments.push(Segment {
            url: resolve(base_url, uri)?,
            duration: segment.duration,
            sequence: segments.len(),
            media_sequence: pl.media_sequence + position as u64,
            byte_range,
            key: current_key.clone(),
        });
    }

    if init_segment.is_none()
        && let Some(map) = playlist_level_map(&pl)
    {
        init_segment = Some(convert_map(&map, base_url)?);
    }

    if segments.is_empty() {
        return Err(DownloadError::manifest("media playlist contains no segments"));
    }

    debug!(
        segments = segments.len(),
        end_list = pl.end_list,
        "Parsed media playlist"
    );
    Ok(MediaPlaylist {
        segments,
        init_segment,
        end_list: pl.end_list,
        target_duration: pl.target_duration,
    })
}
