//! hb-transport: HTTP exchange layer for the hawkBit control API.
//!
//! Wraps a single `reqwest::Client` (rustls TLS) behind the request
//! shapes the session orchestrator needs: small bounded JSON GET/PUT/POST
//! exchanges, and a streaming artifact download that hands chunks to a
//! caller-supplied sink instead of buffering the whole body.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;

/// Cap on an accumulated JSON response body. Requests that exceed this
/// are rejected rather than silently truncated.
pub const RESPONSE_ACCUMULATOR_CAP: usize = 8 * 1024;

/// Number of connection attempts before giving up, matching the
/// embedded client's DNS-resolve retry loop.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("response body of {actual} bytes exceeds accumulator cap of {limit} bytes")]
    ResponseTooLarge { actual: usize, limit: usize },
    #[error("Content-Length {expected} did not match {actual} bytes actually received")]
    ContentLengthMismatch { expected: u64, actual: u64 },
    #[error("sink rejected chunk: {0}")]
    Sink(String),
}

/// The outcome of a completed streaming download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOutcome {
    pub total_bytes: u64,
}

/// A thin, retrying wrapper around `reqwest::Client`.
pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    /// Build a transport using rustls TLS and a fixed per-request timeout
    /// matching the embedded client's 300-second receive timeout.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Transport { client })
    }

    /// `GET url`, returning the fully accumulated JSON body.
    pub async fn get_json(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let resp = self.send_with_retry(|| self.client.get(url)).await?;
        check_status(&resp)?;
        accumulate(resp).await
    }

    /// `PUT url` with a JSON body, returning the HTTP status code.
    pub async fn put_json(&self, url: &str, body: Vec<u8>) -> Result<u16, TransportError> {
        let body_clone = body.clone();
        let resp = self
            .send_with_retry(|| {
                self.client
                    .put(url)
                    .header("Content-Type", "application/json;charset=UTF-8")
                    .body(body_clone.clone())
            })
            .await?;
        Ok(resp.status().as_u16())
    }

    /// `POST url` with a JSON body, returning the HTTP status code.
    pub async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<u16, TransportError> {
        let body_clone = body.clone();
        let resp = self
            .send_with_retry(|| {
                self.client
                    .post(url)
                    .header("Content-Type", "application/json;charset=UTF-8")
                    .body(body_clone.clone())
            })
            .await?;
        Ok(resp.status().as_u16())
    }

    /// Stream `GET url`'s body to `on_chunk`, logging progress only when
    /// the completion percentage strictly increases.
    pub async fn download(
        &self,
        url: &str,
        mut on_chunk: impl FnMut(&[u8]) -> Result<(), String>,
    ) -> Result<DownloadOutcome, TransportError> {
        let resp = self.send_with_retry(|| self.client.get(url)).await?;
        check_status(&resp)?;

        let content_length = resp.content_length();
        let mut downloaded: u64 = 0;
        let mut last_logged_pct: i64 = -1;
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk?;
            downloaded += chunk.len() as u64;
            on_chunk(&chunk).map_err(TransportError::Sink)?;

            if let Some(total) = content_length {
                if total > 0 {
                    let pct = (downloaded * 100 / total) as i64;
                    if pct > last_logged_pct {
                        tracing::debug!(pct, downloaded, total, "download progress");
                        last_logged_pct = pct;
                    }
                }
            }
        }

        if let Some(total) = content_length {
            if downloaded != total {
                return Err(TransportError::ContentLengthMismatch {
                    expected: total,
                    actual: downloaded,
                });
            }
        }

        Ok(DownloadOutcome { total_bytes: downloaded })
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < CONNECT_ATTEMPTS && is_retryable(&e) => {
                    tracing::debug!(attempt, error = %e, "connect attempt failed, retrying");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(TransportError::Request(e)),
            }
        }
    }
}

fn is_retryable(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout()
}

fn check_status(resp: &reqwest::Response) -> Result<(), TransportError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(TransportError::HttpStatus(resp.status().as_u16()))
    }
}

async fn accumulate(resp: reqwest::Response) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk?;
        if buf.len() + chunk.len() > RESPONSE_ACCUMULATOR_CAP {
            return Err(TransportError::ResponseTooLarge {
                actual: buf.len() + chunk.len(),
                limit: RESPONSE_ACCUMULATOR_CAP,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Object-safe, future-returning view of [`Transport`]'s operations.
///
/// The Session Orchestrator is generic over this trait rather than the
/// concrete `reqwest`-backed `Transport` so it can be driven against a
/// mock HTTP layer in tests.
pub trait SessionTransport: Send + Sync {
    fn get_json<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>>;

    fn put_json<'a>(
        &'a self,
        url: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>>;

    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>>;

    #[allow(clippy::type_complexity)]
    fn download<'a>(
        &'a self,
        url: &'a str,
        on_chunk: Box<dyn FnMut(&[u8]) -> Result<(), String> + Send + 'a>,
    ) -> Pin<Box<dyn Future<Output = Result<DownloadOutcome, TransportError>> + Send + 'a>>;
}

impl SessionTransport for Transport {
    fn get_json<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>> {
        Box::pin(Transport::get_json(self, url))
    }

    fn put_json<'a>(
        &'a self,
        url: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>> {
        Box::pin(Transport::put_json(self, url, body))
    }

    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send + 'a>> {
        Box::pin(Transport::post_json(self, url, body))
    }

    fn download<'a>(
        &'a self,
        url: &'a str,
        mut on_chunk: Box<dyn FnMut(&[u8]) -> Result<(), String> + Send + 'a>,
    ) -> Pin<Box<dyn Future<Output = Result<DownloadOutcome, TransportError>> + Send + 'a>> {
        Box::pin(async move { Transport::download(self, url, |chunk| on_chunk(chunk)).await })
    }
}
