//! Retrying fetch — the resilient request layer under the stream client.
//!
//! Retry discipline: 5xx and 429 responses retry with bounded backoff; a
//! `Retry-After` hint within the configured ceiling is honored, one above
//! it returns the response as-is (the caller treats it as a failure); no
//! hint means exponential backoff. A caller abort terminates the loop
//! immediately with a distinct outcome and is never retried or logged as
//! a failure.
//!
//! Clients whose streaming body primitive is known to be unreliable
//! (detected by client identification, not feature probing) buffer the
//! full body first but still expose the same `{status, headers, body}`
//! shape.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;

use strand_core::config::{RetryConfig, StrandConfig};

// ── Abort signalling ─────────────────────────────────────────────────────────

/// Caller side of an abort: dropping it without calling `abort` never
/// aborts the request.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Request side of an abort.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the caller aborts; never resolves otherwise.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            // Handle dropped without aborting: nothing left to signal.
            std::future::pending::<()>().await;
        }
    }
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

// ── Responses and errors ─────────────────────────────────────────────────────

/// The uniform response shape, streaming or buffered.
pub struct FetchResponse {
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Caller-initiated cancellation. Never retried, never a failure.
    #[error("request aborted by caller")]
    Aborted,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// A specific browser closes streams on refresh; the resulting transport
/// error is benign and is swallowed rather than surfaced.
pub fn is_benign_disconnect(error: &FetchError) -> bool {
    match error {
        FetchError::Network(e) => {
            let text = e.to_string();
            text.contains("network connection was lost") || text.contains("Load failed")
        }
        FetchError::Aborted => false,
    }
}

// ── Retrying fetch ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RetryingFetch {
    client: reqwest::Client,
    retry: RetryConfig,
    buffered: bool,
}

impl RetryingFetch {
    pub fn new(config: &StrandConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.client.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            retry: config.retry.clone(),
            buffered: config.client.needs_buffered_fetch(),
        })
    }

    /// GET with retry. Returns the final response even when its status is
    /// a failure the caller must handle; `Err` means abort or a network
    /// error that survived the retry budget.
    pub async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        abort: &mut AbortSignal,
    ) -> Result<FetchResponse, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if abort.is_aborted() {
                return Err(FetchError::Aborted);
            }

            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(name, value);
            }

            let sent = tokio::select! {
                result = request.send() => result,
                _ = abort.aborted() => return Err(FetchError::Aborted),
            };

            match sent {
                Ok(response) => {
                    let status = response.status();
                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    if !retryable {
                        return self.into_response(response).await;
                    }

                    let hint = retry_after_secs(&response);
                    match hint {
                        Some(secs) if Duration::from_secs(secs) > self.retry.retry_after_ceiling() => {
                            // Hint above the ceiling: hand back as-is.
                            tracing::warn!(
                                status = %status,
                                retry_after_secs = secs,
                                "retry-after exceeds ceiling, not retrying"
                            );
                            return self.into_response(response).await;
                        }
                        _ if attempt >= self.retry.max_attempts => {
                            tracing::warn!(status = %status, attempt, "retry budget exhausted");
                            return self.into_response(response).await;
                        }
                        Some(secs) => {
                            tracing::debug!(status = %status, attempt, retry_after_secs = secs, "honoring retry-after");
                            self.pause(Duration::from_secs(secs), abort).await?;
                        }
                        None => {
                            let delay = self.retry.delay_before(attempt);
                            tracing::debug!(status = %status, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                            self.pause(delay, abort).await?;
                        }
                    }
                }
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(FetchError::Network(e));
                    }
                    let delay = self.retry.delay_before(attempt);
                    tracing::debug!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                    self.pause(delay, abort).await?;
                }
            }
        }
    }

    async fn pause(&self, delay: Duration, abort: &mut AbortSignal) -> Result<(), FetchError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = abort.aborted() => Err(FetchError::Aborted),
        }
    }

    async fn into_response(&self, response: reqwest::Response) -> Result<FetchResponse, FetchError> {
        let status = response.status();
        let headers = response.headers().clone();
        let body: BoxStream<'static, Result<Bytes, FetchError>> = if self.buffered {
            let bytes = response.bytes().await?;
            futures::stream::once(async move { Ok(bytes) }).boxed()
        } else {
            response
                .bytes_stream()
                .map(|r| r.map_err(FetchError::Network))
                .boxed()
        };
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
