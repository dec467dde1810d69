// Test doubles: a scripted in-memory transport and a recording remuxer.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::error::DownloadError;
use crate::fetcher::HttpTransport;
use crate::hls::ByteRange;
use crate::remux::Remuxer;

#[derive(Debug, Default, Clone)]
struct Route {
    body: Option<Bytes>,
    delay: Duration,
    /// Statuses answered before the body, one per request.
    failures: VecDeque<u16>,
    always: Option<u16>,
}

/// URL-keyed responses. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &str, body: impl Into<Bytes>) {
        self.routes.lock().entry(url.to_string()).or_default().body = Some(body.into());
    }

    pub fn add_delayed(&self, url: &str, body: impl Into<Bytes>, delay: Duration) {
        let mut routes = self.routes.lock();
        let route = routes.entry(url.to_string()).or_default();
        route.body = Some(body.into());
        route.delay = delay;
    }

    pub fn fail_times(&self, url: &str, status: u16, times: usize) {
        let mut routes = self.routes.lock();
        let route = routes.entry(url.to_string()).or_default();
        route.failures.extend(std::iter::repeat_n(status, times));
    }

    pub fn fail_always(&self, url: &str, status: u16) {
        self.routes.lock().entry(url.to_string()).or_default().always = Some(status);
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().values().sum()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes, DownloadError> {
        *self.hits.lock().entry(url.to_string()).or_default() += 1;

        let (delay, answer) = {
            let mut routes = self.routes.lock();
            match routes.get_mut(url.as_str()) {
                None => (Duration::ZERO, Err(404)),
                Some(route) => {
                    let answer = if let Some(status) = route.failures.pop_front() {
                        Err(status)
                    } else if let Some(status) = route.always {
                        Err(status)
                    } else {
                        route.body.clone().ok_or(404)
                    };
                    (route.delay, answer)
                }
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let body = answer.map_err(|status| DownloadError::http_status(status, url.as_str()))?;
        match range {
            Some(range) => {
                let start = (range.offset as usize).min(body.len());
                let end = (range.end() as usize).min(body.len());
                Ok(body.slice(start..end))
            }
            None => Ok(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemuxCall {
    Merge {
        video: PathBuf,
        audio: Option<PathBuf>,
        output: PathBuf,
    },
    Extract {
        audio: PathBuf,
        output: PathBuf,
    },
}

/// Records calls and writes outputs by concatenating its inputs.
#[derive(Debug, Default)]
pub struct FakeRemuxer {
    calls: Mutex<Vec<RemuxCall>>,
    fail_merge: Mutex<bool>,
    fail_extract: Mutex<bool>,
}

impl FakeRemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_merge() -> Self {
        let remuxer = Self::default();
        *remuxer.fail_merge.lock() = true;
        remuxer
    }

    pub fn failing_extract() -> Self {
        let remuxer = Self::default();
        *remuxer.fail_extract.lock() = true;
        remuxer
    }

    pub fn calls(&self) -> Vec<RemuxCall> {
        self.calls.lock().clone()
    }

    pub fn merge_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, RemuxCall::Merge { .. }))
            .count()
    }
}

#[async_trait]
impl Remuxer for FakeRemuxer {
    async fn merge(
        &self,
        video: &Path,
        audio: Option<&Path>,
        output: &Path,
    ) -> Result<(), DownloadError> {
        self.calls.lock().push(RemuxCall::Merge {
            video: video.to_path_buf(),
            audio: audio.map(Path::to_path_buf),
            output: output.to_path_buf(),
        });
        if *self.fail_merge.lock() {
            return Err(DownloadError::merge("ffmpeg exited with code 1"));
        }
        let mut data = tokio::fs::read(video).await?;
        if let Some(audio) = audio {
            data.extend(tokio::fs::read(audio).await?);
        }
        tokio::fs::write(output, data).await?;
        Ok(())
    }

    async fn extract_audio(&self, audio: &Path, output: &Path) -> Result<(), DownloadError> {
        self.calls.lock().push(RemuxCall::Extract {
            audio: audio.to_path_buf(),
            output: output.to_path_buf(),
        });
        if *self.fail_extract.lock() {
            return Err(DownloadError::merge("ffmpeg exited with code 1"));
        }
        tokio::fs::copy(audio, output).await?;
        Ok(())
    }
}

/// Master playlist with 360p/720p variants sharing audio group `aud` (default `en`, extra `es`)
/// and subtitle group `subs` (`en`), served from `http://h/`.
pub const SAMPLE_MASTER: &str = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",LANGUAGE=\"en\",NAME=\"English\",DEFAULT=YES,URI=\"en.m3u8\"\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",LANGUAGE=\"es\",NAME=\"Spanish\",URI=\"es.m3u8\"\n\
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",LANGUAGE=\"en\",NAME=\"English\",URI=\"sub_en.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360,AUDIO=\"aud\",SUBTITLES=\"subs\"\n\
v360.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720,AUDIO=\"aud\",SUBTITLES=\"subs\"\n\
v720.m3u8\n";

/// VOD media playlist of `n` segments named `<prefix><i>.<ext>`.
pub fn media_playlist(prefix: &str, n: usize, ext: &str) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
    for i in 0..n {
        text.push_str(&format!("#EXTINF:4.0,\n{prefix}{i}.{ext}\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Scripts [`SAMPLE_MASTER`] and every playlist and segment it leads to. The 720p video has
/// three segments `V0..V2`, each audio rendition two (`E*` for en, `S*` for es), the subtitle
/// two WebVTT fragments.
pub fn script_sample_stream(transport: &MockTransport) {
    transport.add("http://h/master.m3u8", SAMPLE_MASTER);
    transport.add("http://h/v720.m3u8", media_playlist("v", 3, "ts"));
    transport.add("http://h/en.m3u8", media_playlist("en", 2, "aac"));
    transport.add("http://h/es.m3u8", media_playlist("es", 2, "aac"));
    transport.add("http://h/sub_en.m3u8", media_playlist("sub", 2, "vtt"));
    for i in 0..3 {
        transport.add(&format!("http://h/v{i}.ts"), format!("V{i}"));
    }
    for i in 0..2 {
        transport.add(&format!("http://h/en{i}.aac"), format!("E{i}"));
        transport.add(&format!("http://h/es{i}.aac"), format!("S{i}"));
    }
    transport.add(
        "http://h/sub0.vtt",
        "WEBVTT\n\n00:00:00.000 --> 00:00:01.000\nOne\n",
    );
    transport.add(
        "http://h/sub1.vtt",
        "WEBVTT\n\n00:00:04.000 --> 00:00:05.000\nTwo\n",
    );
}
