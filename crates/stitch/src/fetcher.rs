// Segment Fetcher: the fetch primitive the scheduler delegates to, plus its HTTP implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use playlist::ByteRange;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::{Client, StatusCode};
use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::FetcherConfig;
use crate::error::{FetchError, StitchError};
use crate::retry::{RetryAction, RetryPolicy, is_retryable_reqwest_error, retry_with_backoff};

/// Everything needed to fetch one segment onto disk.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub index: u32,
    pub url: String,
    pub destination: PathBuf,
    pub headers: HeaderMap,
    pub max_retries: u32,
}

/// Fetches one segment to `request.destination`, retrying on its own.
///
/// `Ok` means the complete payload is at the destination. Any `Err` other
/// than [`FetchError::Cancelled`] means the retry budget is spent or the
/// failure is permanent.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest, token: CancellationToken)
    -> Result<u64, FetchError>;
}

/// Base headers plus a `Range` header when the segment has a byte range.
/// The base map is left untouched.
pub fn segment_headers(base: &HeaderMap, byte_range: Option<ByteRange>) -> HeaderMap {
    let mut headers = base.clone();
    if let Some(range) = byte_range
        && let Ok(value) = HeaderValue::from_str(&range.header_value())
    {
        trace!(range = %range, "Adding Range header");
        headers.insert(RANGE, value);
    }
    headers
}

/// Builds the HTTP client used for segments and remote playlists.
pub fn create_client(config: &FetcherConfig) -> Result<Client, StitchError> {
    let provider = Arc::new(ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| StitchError::configuration(format!("TLS protocol setup failed: {e}")))?
        .with_platform_verifier()
        .map_err(|e| StitchError::configuration(format!("TLS verifier setup failed: {e}")))?
        .with_no_client_auth();

    let mut builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .use_preconfigured_tls(tls_config);

    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }

    Ok(builder.build()?)
}

/// [`SegmentFetcher`] over `reqwest`.
///
/// The body is streamed into `<destination>.part` and renamed onto the
/// destination once the whole payload has arrived.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(client: Client, config: &FetcherConfig) -> Self {
        Self {
            client,
            policy: RetryPolicy::from_config(config),
            request_timeout: config.request_timeout,
        }
    }

    async fn attempt(&self, request: &FetchRequest, attempt: u32) -> RetryAction<u64> {
        trace!(index = request.index, attempt, "Requesting segment");
        let mut builder = self
            .client
            .get(&request.url)
            .headers(request.headers.clone());
        if !self.request_timeout.is_zero() {
            builder = builder.timeout(self.request_timeout);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if is_retryable_reqwest_error(&e) => {
                return RetryAction::Retry(FetchError::transient(e.to_string()));
            }
            Err(e) => return RetryAction::Fail(FetchError::rejected(e.to_string())),
        };

        let status = response.status();
        let requested_range = request
            .headers
            .get(RANGE)
            .map(|v| v.to_str().unwrap_or_default().to_owned());

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return RetryAction::Fail(FetchError::RangeNotSatisfiable {
                range: requested_range.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            let reason = format!("HTTP {status} for {}", request.url);
            return if status.is_server_error()
                || status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS
            {
                RetryAction::Retry(FetchError::transient(reason))
            } else {
                RetryAction::Fail(FetchError::rejected(reason))
            };
        }
        let expected_len = response.content_length();
        if let Some(range) = requested_range
            && status != StatusCode::PARTIAL_CONTENT
            && !is_whole_resource(&range, expected_len)
        {
            return RetryAction::Fail(FetchError::RangeIgnored { range });
        }

        let part_path = part_path(&request.destination);
        let mut file = match tokio::fs::File::create(&part_path).await {
            Ok(file) => file,
            Err(e) => return RetryAction::Fail(e.into()),
        };

        let mut response = response;
        let mut written = 0u64;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        return RetryAction::Fail(e.into());
                    }
                    written += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    return RetryAction::Retry(FetchError::transient(format!(
                        "body interrupted after {written} bytes: {e}"
                    )));
                }
            }
        }

        if let Some(expected) = expected_len
            && expected != written
        {
            return RetryAction::Retry(FetchError::transient(format!(
                "body truncated: expected {expected} bytes, got {written}"
            )));
        }

        if let Err(e) = file.flush().await {
            return RetryAction::Fail(e.into());
        }
        drop(file);
        if let Err(e) = tokio::fs::rename(&part_path, &request.destination).await {
            return RetryAction::Fail(e.into());
        }

        RetryAction::Success(written)
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetcher {
    #[instrument(skip_all, fields(index = request.index))]
    async fn fetch(
        &self,
        request: FetchRequest,
        token: CancellationToken,
    ) -> Result<u64, FetchError> {
        let policy = self.policy.clone().with_max_retries(request.max_retries);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled),
            result = retry_with_backoff(&policy, &token, |attempt| self.attempt(&request, attempt)) => result,
        };

        match &result {
            Ok(bytes) => debug!(bytes, path = %request.destination.display(), "Segment written"),
            Err(_) => {
                let _ = tokio::fs::remove_file(part_path(&request.destination)).await;
            }
        }
        result
    }
}

/// A full `200` body is exactly the requested bytes when the range starts
/// at zero and spans the whole resource.
fn is_whole_resource(range_header: &str, content_length: Option<u64>) -> bool {
    range_header
        .strip_prefix("bytes=")
        .and_then(|range| ByteRange::try_from(range.to_owned()).ok())
        .is_some_and(|range| range.start == 0 && Some(range.length()) == content_length)
}

fn part_path(destination: &std::path::Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
