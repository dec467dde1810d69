// Segment decryption: AES-128-CBC with keys fetched once per key URI.

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use moka::future::Cache;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::model::{KeyMethod, Segment, SegmentKey};
use crate::error::DownloadError;
use crate::fetcher::Fetcher;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Per-job decryption service. Keys are cached by URI so each one is fetched once, even when
/// many workers ask for it at the same time. A key that could not be loaded stays failed for
/// the rest of the job.
#[derive(Clone)]
pub struct SegmentCipher {
    fetcher: Fetcher,
    keys: Cache<Url, [u8; 16]>,
    unavailable: Cache<Url, String>,
}

impl SegmentCipher {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            keys: Cache::builder().max_capacity(64).build(),
            unavailable: Cache::builder().max_capacity(64).build(),
        }
    }

    /// Decrypt `data` according to the segment's key; unencrypted segments pass through.
    pub async fn decrypt(
        &self,
        segment: &Segment,
        data: Bytes,
        token: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        let Some(key) = &segment.key else {
            return Ok(data);
        };
        let key_bytes = self.key_for(key, token).await?;
        let iv = match &key.iv {
            Some(iv) => parse_iv(iv)?,
            None => default_iv(segment.media_sequence),
        };

        tokio::task::spawn_blocking(move || decrypt_aes128(&data, &key_bytes, &iv))
            .await
            .map_err(|e| DownloadError::key(format!("decryption task failed: {e}")))?
    }

    /// Check that a key reference can be used, fetching and caching the key.
    pub async fn key_for(
        &self,
        key: &SegmentKey,
        token: &CancellationToken,
    ) -> Result<[u8; 16], DownloadError> {
        if key.method != KeyMethod::Aes128 {
            return Err(DownloadError::key(format!(
                "unsupported encryption method {}",
                key.method
            )));
        }
        let url = key
            .url
            .clone()
            .ok_or_else(|| DownloadError::key("AES-128 key without URI"))?;
        if let Some(reason) = self.unavailable.get(&url).await {
            return Err(DownloadError::key(reason));
        }

        let fetcher = self.fetcher.clone();
        let token = token.clone();
        let key_url = url.clone();
        let result = self
            .keys
            .try_get_with(url.clone(), async move {
                debug!(url = %key_url, "Fetching decryption key");
                let body = fetcher.fetch(&key_url, &token).await?;
                <[u8; 16]>::try_from(body.as_ref()).map_err(|_| {
                    DownloadError::key(format!(
                        "key at {key_url} is {} bytes, expected 16",
                        body.len()
                    ))
                })
            })
            .await;

        match result {
            Ok(key) => Ok(key),
            Err(e) => {
                let reason = match e.as_ref() {
                    DownloadError::Cancelled => return Err(DownloadError::Cancelled),
                    DownloadError::Key { reason } => reason.clone(),
                    other => format!("key unavailable: {other}"),
                };
                debug!(%url, %reason, "Key marked unavailable");
                self.unavailable.insert(url, reason.clone()).await;
                Err(DownloadError::key(reason))
            }
        }
    }
}

/// IV used when the key tag carries none: the media sequence number, big-endian, in the
/// low 8 bytes.
pub fn default_iv(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

fn parse_iv(iv_hex: &str) -> Result<[u8; 16], DownloadError> {
    let digits = iv_hex
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(digits, &mut iv)
        .map_err(|e| DownloadError::key(format!("invalid IV `{iv_hex}`: {e}")))?;
    Ok(iv)
}

fn decrypt_aes128(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DownloadError> {
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| DownloadError::key(format!("failed to initialize AES decryptor: {e}")))?;
    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| DownloadError::key(format!("decryption failed: {e}")))?
        .len();
    buffer.truncate(len);
    Ok(Bytes::from(buffer))
}

impl std::fmt::Debug for SegmentCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCipher")
            .field("cached_keys", &self.keys.entry_count())
            .field("unavailable_keys", &self.unavailable.entry_count())
            .finish_non_exhaustive()
    }
}
