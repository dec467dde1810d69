// Segment fetch pool: bounded concurrent fetches, results consumed in playlist order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::decryption::SegmentCipher;
use super::model::Segment;
use crate::error::DownloadError;
use crate::fetcher::Fetcher;

/// Terminal result of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SegmentOutcome {
    Fetched { bytes: usize },
    Failed { reason: String },
    /// Unusable key reference on a segment other than the first; left out of the output.
    Skipped { reason: String },
}

/// Destination for in-order segment payloads.
#[async_trait]
pub trait SegmentSink: Send {
    async fn write_segment(&mut self, data: Bytes) -> Result<(), DownloadError>;
}

#[async_trait]
impl SegmentSink for Vec<Bytes> {
    async fn write_segment(&mut self, data: Bytes) -> Result<(), DownloadError> {
        self.push(data);
        Ok(())
    }
}

/// Streams payloads straight into an async writer (the per-track temporary file).
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn finish(mut self) -> Result<W, DownloadError> {
        self.writer.flush().await?;
        Ok(self.writer)
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SegmentSink for WriterSink<W> {
    async fn write_segment(&mut self, data: Bytes) -> Result<(), DownloadError> {
        self.writer.write_all(&data).await?;
        self.written += data.len() as u64;
        Ok(())
    }
}

/// Counts for one completed pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub total: usize,
    pub fetched: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct SegmentPool {
    fetcher: Fetcher,
    cipher: SegmentCipher,
    concurrency: usize,
}

impl SegmentPool {
    pub fn new(fetcher: Fetcher, cipher: SegmentCipher, concurrency: usize) -> Self {
        Self {
            fetcher,
            cipher,
            concurrency: concurrency.max(1),
        }
    }

    async fn fetch_one(
        &self,
        index: usize,
        segment: &Segment,
        token: &CancellationToken,
    ) -> (usize, Result<Bytes, DownloadError>) {
        let result = async {
            // Resolve the key before spending a request on data we cannot use.
            if let Some(key) = &segment.key {
                self.cipher.key_for(key, token).await?;
            }
            let data = self
                .fetcher
                .fetch_range(&segment.url, segment.byte_range, token)
                .await?;
            self.cipher.decrypt(segment, data, token).await
        }
        .await;
        (index, result)
    }

    /// Fetch every segment and collect the payloads in playlist order.
    pub async fn fetch_all<F>(
        &self,
        segments: &[Segment],
        token: &CancellationToken,
        on_segment: F,
    ) -> Result<Vec<Bytes>, DownloadError>
    where
        F: FnMut(usize, &SegmentOutcome),
    {
        let mut out = Vec::with_capacity(segments.len());
        self.fetch_into(segments, token, on_segment, &mut out).await?;
        Ok(out)
    }

    /// Fetch every segment with at most `concurrency` requests in flight, writing payloads to
    /// `sink` in ascending playlist order as soon as each next one is available.
    ///
    /// A failed segment does not stop its siblings; the aggregate
    /// [`DownloadError::PartialFetch`] is raised once the run is over. After `token` is
    /// cancelled no further segment is dispatched, in-flight fetches drain, and the run ends
    /// with [`DownloadError::Cancelled`].
    pub async fn fetch_into<F, S>(
        &self,
        segments: &[Segment],
        token: &CancellationToken,
        mut on_segment: F,
        sink: &mut S,
    ) -> Result<PoolReport, DownloadError>
    where
        F: FnMut(usize, &SegmentOutcome),
        S: SegmentSink + ?Sized,
    {
        let mut report = PoolReport {
            total: segments.len(),
            ..Default::default()
        };
        let mut first_failure: Option<String> = None;
        let mut pending = segments.iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut reorder: BTreeMap<usize, Option<Bytes>> = BTreeMap::new();
        let mut next_to_write = 0usize;

        loop {
            while in_flight.len() < self.concurrency && !token.is_cancelled() {
                match pending.next() {
                    Some((index, segment)) => in_flight.push(self.fetch_one(index, segment, token)),
                    None => break,
                }
            }

            let Some((index, result)) = in_flight.next().await else {
                break;
            };

            let (outcome, data) = match result {
                Ok(data) => (SegmentOutcome::Fetched { bytes: data.len() }, Some(data)),
                Err(DownloadError::Cancelled) => {
                    trace!(index, "Segment fetch abandoned after cancellation");
                    continue;
                }
                Err(DownloadError::Key { reason }) if index > 0 => {
                    warn!(index, %reason, "Skipping segment with unusable key");
                    (SegmentOutcome::Skipped { reason }, None)
                }
                Err(e) => {
                    warn!(index, url = %segments[index].url, error = %e, "Segment failed");
                    (SegmentOutcome::Failed { reason: e.to_string() }, None)
                }
            };

            match &outcome {
                SegmentOutcome::Fetched { .. } => report.fetched += 1,
                SegmentOutcome::Skipped { .. } => report.skipped += 1,
                SegmentOutcome::Failed { reason } => {
                    report.failed += 1;
                    if first_failure.is_none() {
                        first_failure = Some(format!("segment {index}: {reason}"));
                    }
                }
            }
            on_segment(index, &outcome);

            if token.is_cancelled() {
                continue;
            }
            reorder.insert(index, data);
            while let Some(entry) = reorder.remove(&next_to_write) {
                if let Some(data) = entry {
                    sink.write_segment(data).await?;
                }
                next_to_write += 1;
            }
        }

        if token.is_cancelled() {
            debug!(
                fetched = report.fetched,
                total = report.total,
                "Segment pool cancelled"
            );
            return Err(DownloadError::Cancelled);
        }

        if let Some(first) = first_failure {
            return Err(DownloadError::PartialFetch {
                failed: report.failed,
                total: report.total,
                first,
            });
        }

        debug!(
            fetched = report.fetched,
            skipped = report.skipped,
            total = report.total,
            "Segment pool finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::decryption::tests::encrypt;
    use crate::hls::decryption::default_iv;
    use crate::hls::model::{KeyMethod, Playlist, SegmentKey};
    use crate::hls::playlist::parse_playlist;
    use crate::retry::RetryPolicy;
    use crate::test_utils::MockTransport;
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    fn segments(n: usize) -> Vec<Segment> {
        (0..n)
            .map(|i| Segment {
                url: Url::parse(&format!("http://h/seg{i}.ts")).unwrap(),
                duration: 2.0,
                sequence: i,
                media_sequence: i as u64,
                byte_range: None,
                key: None,
            })
            .collect()
    }

    fn pool(transport: Arc<MockTransport>, concurrency: usize) -> SegmentPool {
        let fetcher = Fetcher::new(
            transport,
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
        );
        SegmentPool::new(fetcher.clone(), SegmentCipher::new(fetcher), concurrency)
    }

    #[tokio::test]
    async fn output_follows_playlist_order() {
        let transport = Arc::new(MockTransport::new());
        for i in 0..6u64 {
            // Later segments answer first.
            transport.add_delayed(
                &format!("http://h/seg{i}.ts"),
                format!("[{i}]"),
                Duration::from_millis(60 - i * 10),
            );
        }
        let mut seen = Vec::new();
        let out = pool(transport, 6)
            .fetch_all(&segments(6), &CancellationToken::new(), |i, _| seen.push(i))
            .await
            .unwrap();

        let joined: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(joined, b"[0][1][2][3][4][5]");
        assert_eq!(seen.len(), 6);
        assert_ne!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn failure_does_not_stop_siblings() {
        let transport = Arc::new(MockTransport::new());
        for i in [0, 1, 3, 4] {
            transport.add(&format!("http://h/seg{i}.ts"), format!("{i}"));
        }
        transport.fail_always("http://h/seg2.ts", 404);

        let mut outcomes = Vec::new();
        let err = pool(transport.clone(), 2)
            .fetch_all(&segments(5), &CancellationToken::new(), |i, o| {
                outcomes.push((i, o.clone()))
            })
            .await
            .unwrap_err();

        match err {
            DownloadError::PartialFetch { failed, total, .. } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(outcomes.len(), 5);
        for i in [0, 1, 3, 4] {
            assert_eq!(transport.hits(&format!("http://h/seg{i}.ts")), 1);
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_per_segment() {
        let transport = Arc::new(MockTransport::new());
        for i in 0..3 {
            transport.add(&format!("http://h/seg{i}.ts"), "x");
        }
        transport.fail_times("http://h/seg1.ts", 503, 2);

        let out = pool(transport.clone(), 3)
            .fetch_all(&segments(3), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(transport.hits("http://h/seg1.ts"), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let transport = Arc::new(MockTransport::new());
        for i in 0..10u64 {
            transport.add_delayed(
                &format!("http://h/seg{i}.ts"),
                "x",
                Duration::from_millis(10 + i * 5),
            );
        }
        let token = CancellationToken::new();
        let canceller = token.clone();
        let mut completed = 0;
        let err = pool(transport.clone(), 2)
            .fetch_all(&segments(10), &token, |_, _| {
                completed += 1;
                canceller.cancel();
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        // Only the two segments dispatched before the stop were requested.
        assert_eq!(transport.total_hits(), 2);
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn unusable_key_skips_later_segments() {
        let transport = Arc::new(MockTransport::new());
        let key = [3u8; 16];
        transport.add("http://h/key.bin", key.to_vec());
        let mut segs = segments(3);
        for seg in &mut segs {
            transport.add(seg.url.as_str(), encrypt(b"payload", &key, &default_iv(seg.media_sequence)));
            seg.key = Some(SegmentKey {
                method: KeyMethod::Aes128,
                url: Some(Url::parse("http://h/key.bin").unwrap()),
                iv: None,
            });
        }
        segs[2].key = Some(SegmentKey {
            method: KeyMethod::SampleAes,
            url: Some(Url::parse("http://h/key2.bin").unwrap()),
            iv: None,
        });

        let mut skipped = Vec::new();
        let out = pool(transport.clone(), 4)
            .fetch_all(&segs, &CancellationToken::new(), |i, o| {
                if matches!(o, SegmentOutcome::Skipped { .. }) {
                    skipped.push(i);
                }
            })
            .await
            .unwrap();
        assert_eq!(skipped, vec![2]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|b| &b[..] == b"payload"));
        assert_eq!(transport.hits("http://h/seg2.ts"), 0);
    }

    #[tokio::test]
    async fn clear_segments_after_key_reset_are_kept() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:2.0,\nseg0.ts\n\
#EXT-X-KEY:METHOD=NONE\n#EXTINF:2.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let base = Url::parse("http://h/media.m3u8").unwrap();
        let Playlist::Media(playlist) = parse_playlist(text.as_bytes(), &base).unwrap() else {
            panic!("expected media playlist");
        };

        let transport = Arc::new(MockTransport::new());
        let key = [9u8; 16];
        transport.add("http://h/key.bin", key.to_vec());
        transport.add("http://h/seg0.ts", encrypt(b"secret", &key, &default_iv(0)));
        transport.add("http://h/seg1.ts", "clear");

        let mut outcomes = Vec::new();
        let out = pool(transport, 2)
            .fetch_all(&playlist.segments, &CancellationToken::new(), |i, o| {
                outcomes.push((i, o.clone()))
            })
            .await
            .unwrap();

        assert!(
            outcomes
                .iter()
                .all(|(_, o)| matches!(o, SegmentOutcome::Fetched { .. }))
        );
        let joined: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(joined, b"secretclear");
    }

    #[tokio::test]
    async fn unusable_key_on_first_segment_fails() {
        let transport = Arc::new(MockTransport::new());
        let mut segs = segments(2);
        transport.add(segs[1].url.as_str(), "plain");
        segs[0].key = Some(SegmentKey {
            method: KeyMethod::Aes128,
            url: Some(Url::parse("http://h/gone.key").unwrap()),
            iv: None,
        });

        let err = pool(transport, 2)
            .fetch_all(&segs, &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::PartialFetch { failed: 1, .. }));
    }

    #[tokio::test]
    async fn streams_into_writer() {
        let transport = Arc::new(MockTransport::new());
        for i in 0..4u64 {
            transport.add_delayed(
                &format!("http://h/seg{i}.ts"),
                format!("{i}"),
                Duration::from_millis(20 - i * 5),
            );
        }
        let mut sink = WriterSink::new(Vec::<u8>::new());
        let report = pool(transport, 3)
            .fetch_into(&segments(4), &CancellationToken::new(), |_, _| {}, &mut sink)
            .await
            .unwrap();
        assert_eq!(report.fetched, 4);
        assert_eq!(sink.bytes_written(), 4);
        assert_eq!(sink.finish().await.unwrap(), b"0123");
    }
}
