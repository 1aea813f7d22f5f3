//! Resumable HTTP fetches.
//!
//! [`TransferClient::open`] issues a ranged GET, follows 300/301/302/303
//! redirects by hand, and returns a [`TransferSource`] describing where the
//! body starts and how large the resource is.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode, redirect};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, MAX_REDIRECTS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent::default_user_agent;

/// Body of a transfer as an async byte reader.
pub type SourceReader = Pin<Box<dyn AsyncRead + Send>>;

/// Connection-layer configuration for [`TransferClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// Time allowed between body reads.
    pub read_timeout: Duration,
    /// Redirect hops followed before failing.
    pub max_redirects: usize,
    /// User-Agent header value.
    pub user_agent: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            max_redirects: MAX_REDIRECTS,
            user_agent: default_user_agent(),
        }
    }
}

/// An opened transfer.
pub struct TransferSource {
    /// URL the body is served from, after redirects.
    pub final_url: Url,
    /// Byte position in the resource where `reader` starts.
    ///
    /// Equals the requested offset unless the server ignored the range, in which case it is 0.
    pub start_offset: u64,
    /// Resource size, or 0 when the server did not announce a length.
    pub total_size: u64,
    /// Body, absent when the resource is already complete (HTTP 416).
    pub reader: Option<SourceReader>,
}

impl fmt::Debug for TransferSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSource")
            .field("final_url", &self.final_url.as_str())
            .field("start_offset", &self.start_offset)
            .field("total_size", &self.total_size)
            .field("has_body", &self.reader.is_some())
            .finish()
    }
}

impl TransferSource {
    /// True when the server reported nothing left to send.
    #[must_use]
    pub fn is_already_complete(&self) -> bool {
        self.reader.is_none()
    }
}

/// HTTP client for resumable ranged downloads.
///
/// Created once and shared by every worker to reuse pooled connections.
#[derive(Debug, Clone)]
pub struct TransferClient {
    client: Client,
    max_redirects: usize,
}

impl TransferClient {
    /// Creates a client with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_options(&TransferOptions::default())
    }

    /// Creates a client from explicit options.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn with_options(options: &TransferOptions) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .redirect(redirect::Policy::none())
            .user_agent(options.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_redirects: options.max_redirects,
        })
    }

    /// Opens `url` starting at byte `offset`.
    ///
    /// - 300/301/302/303: follow the percent-decoded `Location`.
    /// - 200/202/206: total is `offset + Content-Length`; a 200 answer to a
    ///   non-zero offset means the range was ignored and the body starts at 0.
    /// - 416: the resource is already complete; no body, total is `offset`.
    /// - anything else: [`DownloadError::HttpStatus`].
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs, network failures, timeouts,
    /// redirect problems and unaccepted statuses.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn open(&self, url: &str, offset: u64) -> Result<TransferSource, DownloadError> {
        let mut current = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let mut hops = 0usize;

        loop {
            let response = self.send_range_request(&current, offset).await?;
            let status = response.status();

            match status.as_u16() {
                300..=303 => {
                    if hops >= self.max_redirects {
                        return Err(DownloadError::TooManyRedirects {
                            url: url.to_string(),
                            hops,
                        });
                    }
                    let next = resolve_location(&current, &response)?;
                    debug!(status = status.as_u16(), from = %current, to = %next, "following redirect");
                    current = next;
                    hops += 1;
                }
                200 | 202 | 206 => return Ok(Self::into_source(current, offset, response)),
                416 => {
                    debug!(offset, "range not satisfiable, treating as complete");
                    return Ok(TransferSource {
                        final_url: current,
                        start_offset: offset,
                        total_size: offset,
                        reader: None,
                    });
                }
                code => return Err(DownloadError::http_status(current.as_str(), code)),
            }
        }
    }

    async fn send_range_request(
        &self,
        url: &Url,
        offset: u64,
    ) -> Result<Response, DownloadError> {
        self.client
            .get(url.clone())
            .header(RANGE, format!("bytes={offset}-"))
            .send()
            .await
            .map_err(|e| DownloadError::from_request(url.as_str(), e))
    }

    fn into_source(final_url: Url, offset: u64, response: Response) -> TransferSource {
        let range_ignored = offset > 0 && response.status() == StatusCode::OK;
        let start_offset = if range_ignored {
            warn!(url = %final_url, offset, "server ignored range request, restarting from zero");
            0
        } else {
            offset
        };
        let total_size = response
            .content_length()
            .map_or(0, |length| start_offset + length);

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        TransferSource {
            final_url,
            start_offset,
            total_size,
            reader: Some(Box::pin(StreamReader::new(stream))),
        }
    }
}

fn resolve_location(current: &Url, response: &Response) -> Result<Url, DownloadError> {
    let missing = || DownloadError::MissingLocation {
        url: current.to_string(),
    };
    let raw = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(missing)?;
    let decoded = urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |d| d.into_owned());
    current.join(decoded.trim()).map_err(|_| missing())
}
