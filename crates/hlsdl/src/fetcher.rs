// HTTP fetching: a single-attempt transport plus a retrying front end.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::hls::ByteRange;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// One HTTP GET, no retries. Non-2xx responses map to [`DownloadError::HttpStatus`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes, DownloadError>;
}

/// Build the shared reqwest client from the HTTP settings.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(8)
        .user_agent(&config.user_agent)
        .default_headers(config.effective_headers())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }
    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }

    builder.build().map_err(|e| DownloadError::Configuration {
        reason: format!("failed to build HTTP client: {e}"),
    })
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &DownloaderConfig) -> Result<Self, DownloadError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes, DownloadError> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status.as_u16(), url.as_str()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DownloadError::from_reqwest(url.as_str(), e))?;
        trace!(url = %url, len = body.len(), "Fetched resource");
        Ok(body)
    }
}

/// Retrying fetcher shared by manifest, segment and key requests.
///
/// Cancellation is observed before each attempt and while backing off. A request that is
/// already on the wire runs to completion; callers discard its result.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<Bytes, DownloadError> {
        self.fetch_range(url, None, token).await
    }

    pub async fn fetch_range(
        &self,
        url: &Url,
        range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        retry_with_backoff(&self.policy, token, |attempt| {
            if attempt > 0 {
                debug!(url = %url, attempt, "Refetching");
            }
            self.transport.get(url, range)
        })
        .await
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
