//! Resumable download bodies.
//!
//! A [`ResumableReader`] wraps one logical download across however many
//! TCP/TLS connections it takes: every dropped connection or short body
//! turns into a `Range` request issued through the transport after an
//! exponential backoff, and delivery continues at the byte where it
//! stopped. The server is never trusted to resize the object mid-flight.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use conveyd_utils::{exponential_backoff_time, DEFAULT_BACKOFF_UNIT};
use reqwest::StatusCode;

use crate::http::{ApiClient, ApiRequest, HttpError};

pub(crate) struct ResumableReader<'a> {
    client: &'a ApiClient,
    req: ApiRequest,
    resp: Option<reqwest::Response>,
    /// Bytes already delivered to the caller
    offset: u64,
    /// Authoritative total, fixed at open time
    content_length: u64,
    tried: u32,
    max_interval: Duration,
    smallest_unit: Duration,
    /// Remainder of a chunk that straddled a discard boundary
    pending: Vec<u8>,
}

impl<'a> ResumableReader<'a> {
    pub(crate) fn new(
        client: &'a ApiClient,
        req: ApiRequest,
        resp: reqwest::Response,
        content_length: u64,
        max_interval: Duration,
    ) -> Self {
        Self {
            client,
            req,
            resp: Some(resp),
            offset: 0,
            content_length,
            tried: 0,
            max_interval,
            smallest_unit: DEFAULT_BACKOFF_UNIT,
            pending: Vec::new(),
        }
    }

    /// Shrink the backoff unit so tests avoid real sleeps.
    #[cfg(test)]
    pub(crate) fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.smallest_unit = unit;
        self
    }

    pub(crate) fn content_length(&self) -> u64 {
        self.content_length
    }

    /// The next run of bytes, or `None` once `content_length` bytes were
    /// delivered. Transport failures are handled internally by resuming.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if !self.pending.is_empty() {
                let chunk = std::mem::take(&mut self.pending);
                self.offset += chunk.len() as u64;
                return Ok(Some(chunk));
            }
            if self.offset >= self.content_length {
                return Ok(None);
            }
            // resume() always leaves a live response behind
            let resp = self.resp.as_mut().expect("live response");
            match resp.chunk().await {
                Ok(Some(chunk)) if !chunk.is_empty() => {
                    self.offset += chunk.len() as u64;
                    if self.offset > self.content_length {
                        anyhow::bail!(
                            "server delivered more than the advertised {} bytes",
                            self.content_length
                        );
                    }
                    return Ok(Some(chunk.to_vec()));
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tracing::warn!(
                        "download ended early at {}/{} bytes",
                        self.offset,
                        self.content_length
                    );
                    self.resume().await?;
                }
                Err(e) => {
                    tracing::warn!(
                        "download failed at {}/{} bytes: {e}",
                        self.offset,
                        self.content_length
                    );
                    self.resume().await?;
                }
            }
        }
    }

    /// Drain the remaining body into a blocking writer, returning the
    /// number of bytes written.
    pub(crate) async fn copy_to(mut self, mut w: impl std::io::Write) -> Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            w.write_all(&chunk).context("Writing downloaded bytes")?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Re-open the download at the current offset with a range request.
    async fn resume(&mut self) -> Result<()> {
        loop {
            let delay =
                exponential_backoff_time(self.tried, self.max_interval, self.smallest_unit)
                    .map_err(|_| anyhow!("download failed after too many retries"))?;
            self.tried += 1;
            tracing::info!(
                "resuming download at offset {} after {:?}",
                self.offset,
                delay
            );
            tokio::time::sleep(delay).await;
            self.req
                .set_header("Range", format!("bytes={}-", self.offset));
            let mut resp = match self.client.dispatch(&self.req, None).await {
                Ok(r) => r,
                Err(HttpError::Cancelled) => return Err(HttpError::Cancelled.into()),
                Err(e) => {
                    tracing::warn!("range request failed: {e}");
                    continue;
                }
            };
            if resp.status() != StatusCode::PARTIAL_CONTENT {
                anyhow::bail!(
                    "server answered {} to a range request",
                    resp.status().as_u16()
                );
            }
            let header = resp
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .ok_or_else(|| anyhow!("206 response without a Content-Range header"))?
                .to_str()
                .context("Content-Range is not valid text")?;
            let (first, _last, total) = parse_content_range(header)?;
            if let Some(total) = total {
                if total != self.content_length {
                    anyhow::bail!(
                        "download size changed mid-flight: {} became {total}",
                        self.content_length
                    );
                }
            }
            if first > self.offset {
                anyhow::bail!(
                    "server skipped bytes: range restarts at {first}, but only {} were delivered",
                    self.offset
                );
            }
            // Overlap: throw away what was already delivered
            let mut discard = self.offset - first;
            let mut eof = false;
            while discard > 0 {
                match resp.chunk().await {
                    Ok(Some(chunk)) => {
                        let n = discard.min(chunk.len() as u64);
                        discard -= n;
                        if (n as usize) < chunk.len() {
                            self.pending = chunk[n as usize..].to_vec();
                        }
                    }
                    Ok(None) | Err(_) => {
                        // Lost this connection too; take another lap
                        eof = true;
                        break;
                    }
                }
            }
            if eof {
                continue;
            }
            self.resp = Some(resp);
            return Ok(());
        }
    }
}

/// Strict `Content-Range: bytes <first>-<last>[/<total>]` parser.
fn parse_content_range(s: &str) -> Result<(u64, u64, Option<u64>)> {
    let rest = s
        .strip_prefix("bytes ")
        .ok_or_else(|| anyhow!("Content-Range {s:?} lacks the bytes prefix"))?;
    let (range, total) = match rest.split_once('/') {
        Some((range, total)) => (range, Some(total)),
        None => (rest, None),
    };
    let (first, last) = range
        .split_once('-')
        .ok_or_else(|| anyhow!("Content-Range {s:?} lacks a dash"))?;
    let first: u64 = first
        .trim()
        .parse()
        .with_context(|| format!("Content-Range {s:?}: bad start"))?;
    let last: u64 = last
        .trim()
        .parse()
        .with_context(|| format!("Content-Range {s:?}: bad end"))?;
    if last < first {
        anyhow::bail!("Content-Range {s:?} is inverted");
    }
    let total = match total.map(str::trim) {
        None | Some("*") => None,
        Some(t) => Some(
            t.parse::<u64>()
                .with_context(|| format!("Content-Range {s:?}: bad total"))?,
        ),
    };
    Ok((first, last, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testutil::{response, spawn, TestServer};
    use crate::config::ServerEndpoint;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 200-999/1000").unwrap(),
            (200, 999, Some(1000))
        );
        assert_eq!(
            parse_content_range("bytes 0-499").unwrap(),
            (0, 499, None)
        );
        assert_eq!(
            parse_content_range("bytes 10-19/*").unwrap(),
            (10, 19, None)
        );
        for bad in [
            "200-999/1000",
            "bytes 200",
            "bytes a-b/c",
            "bytes 500-100/1000",
            "bytes=200-999/1000",
        ] {
            assert!(parse_content_range(bad).is_err(), "{bad}");
        }
    }

    fn client_for(server: &TestServer) -> ApiClient {
        ApiClient::with_client(
            reqwest::Client::new(),
            vec![ServerEndpoint {
                url: server.url.clone(),
                tenant_token: None,
            }],
            CancellationToken::new(),
        )
    }

    /// A 200 that advertises `total` bytes but hangs up early.
    fn truncated_response(body: &[u8], total: usize) -> Vec<u8> {
        response(
            200,
            &[("Content-Length", &total.to_string())],
            body,
        )
    }

    async fn open_download<'a>(
        client: &'a ApiClient,
        total: u64,
    ) -> ResumableReader<'a> {
        let req = ApiRequest::get("/artifact");
        let resp = client.dispatch(&req, None).await.unwrap();
        ResumableReader::new(
            client,
            req,
            resp,
            total,
            Duration::from_millis(5),
        )
        .with_backoff_unit(Duration::from_millis(1))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_resume_after_connection_drop() {
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let server = spawn(vec![
            truncated_response(&body[..400], 1000),
            response(
                206,
                &[("Content-Range", "bytes 400-999/1000")],
                &body[400..],
            ),
        ]);
        let client = client_for(&server);
        let reader = open_download(&client, 1000).await;
        let mut out = Vec::new();
        let n = reader.copy_to(&mut out).await.unwrap();
        assert_eq!(n, 1000);
        assert_eq!(out, body);
        // Exactly one range request, resuming at the delivered offset
        assert_eq!(server.request_count(), 2);
        let retry = server.request(1).to_lowercase();
        assert!(retry.contains("range: bytes=400-"), "{retry}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_resume_discards_overlap() {
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 241) as u8).collect();
        let server = spawn(vec![
            truncated_response(&body[..400], 1000),
            // Server rewinds to 300; the 100-byte overlap must be dropped
            response(
                206,
                &[("Content-Range", "bytes 300-999/1000")],
                &body[300..],
            ),
        ]);
        let client = client_for(&server);
        let reader = open_download(&client, 1000).await;
        let mut out = Vec::new();
        reader.copy_to(&mut out).await.unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_server_skipping_bytes_is_fatal() {
        let body = vec![1u8; 1000];
        let server = spawn(vec![
            truncated_response(&body[..400], 1000),
            response(
                206,
                &[("Content-Range", "bytes 500-999/1000")],
                &body[500..],
            ),
        ]);
        let client = client_for(&server);
        let reader = open_download(&client, 1000).await;
        let err = reader.copy_to(&mut Vec::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("skipped"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_total_change_is_fatal() {
        let body = vec![1u8; 1000];
        let server = spawn(vec![
            truncated_response(&body[..400], 1000),
            response(
                206,
                &[("Content-Range", "bytes 400-1999/2000")],
                &body[..100],
            ),
        ]);
        let client = client_for(&server);
        let reader = open_download(&client, 1000).await;
        let err = reader.copy_to(&mut Vec::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("size changed"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_non_partial_response_is_fatal() {
        let body = vec![1u8; 1000];
        let server = spawn(vec![
            truncated_response(&body[..400], 1000),
            response(200, &[], &body),
        ]);
        let client = client_for(&server);
        let reader = open_download(&client, 1000).await;
        let err = reader.copy_to(&mut Vec::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("range request"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_retries_exhaust() {
        let body = vec![1u8; 1000];
        // Only the initial response exists; every resume hits a dead port
        let server = spawn(vec![truncated_response(&body[..400], 1000)]);
        let client = client_for(&server);
        let reader = open_download(&client, 1000).await;
        let err = reader.copy_to(&mut Vec::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("too many retries"));
    }
}
