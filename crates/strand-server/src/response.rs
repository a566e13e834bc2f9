//! Streaming response writer.
//!
//! The writer side hands rows and bundle markup to an in-flight HTTP
//! response; the handle side turns into an axum response. Headers go out
//! on the first write ("headers ready") so the HTTP layer can answer
//! immediately while the body keeps streaming. A mid-stream redirect
//! re-attributes later writes to the new URL and, when headers are still
//! unsent, rides out in the location header.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::oneshot;

use strand_core::event::{
    encode_event, EVENT_UPDATE, EVENT_UPDATE_BUNDLE, HEADER_LOCATION, HEADER_SERVER_BUNDLE,
    HEADER_UPDATED_AT, STREAM_MEDIA_TYPE,
};

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("client disconnected")]
    Disconnected,

    #[error("response already finished")]
    Finished,
}

/// Status and headers, resolved once on the first write.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Writer half. Owned by the render task.
pub struct ResponseStream {
    body_tx: Option<mpsc::UnboundedSender<Bytes>>,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    bundle_id: String,
    current_url: String,
    pending_location: Option<String>,
    seq: u64,
}

/// Reader half. Owned by the HTTP layer.
pub struct ResponseHandle {
    head_rx: oneshot::Receiver<ResponseHead>,
    body_rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ResponseStream {
    pub fn new(
        request_url: impl Into<String>,
        bundle_id: impl Into<String>,
    ) -> (Self, ResponseHandle) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded();
        (
            Self {
                body_tx: Some(body_tx),
                head_tx: Some(head_tx),
                bundle_id: bundle_id.into(),
                current_url: request_url.into(),
                pending_location: None,
                seq: 0,
            },
            ResponseHandle { head_rx, body_rx },
        )
    }

    /// The URL writes are currently attributed to. Starts as the request
    /// URL; a redirect moves it.
    pub fn current_url(&self) -> &str {
        &self.current_url
    }

    /// Write one `update` event carrying a batch of wire rows.
    pub fn send_update(&mut self, rows: &[String]) -> Result<(), WriteError> {
        let data = rows.join("\n");
        tracing::debug!(url = %self.current_url, rows = rows.len(), "update written");
        self.write(encode_event(EVENT_UPDATE, None, &data))
    }

    /// Write one `update-bundle` event. The event id is an opaque unique
    /// prefix with the bundle id as its final `-`-separated segment.
    pub fn send_bundle(&mut self, bundle_id: &str, markup: &str) -> Result<(), WriteError> {
        self.seq += 1;
        let opaque = format!("{}{:x}", hex::encode(unix_millis().to_be_bytes()), self.seq);
        let id = format!("{opaque}-{bundle_id}");
        tracing::info!(url = %self.current_url, bundle = bundle_id, "bundle update written");
        self.bundle_id = bundle_id.to_string();
        self.write(encode_event(EVENT_UPDATE_BUNDLE, Some(&id), markup))
    }

    /// Record a mid-stream redirect. Before the first write the new
    /// location goes out as a response header; after that the client
    /// only sees the re-attributed URL on subsequent events.
    pub fn redirect(&mut self, location: &str) {
        if self.head_tx.is_some() {
            self.pending_location = Some(location.to_string());
        } else {
            tracing::warn!(location, "redirect after headers flushed, header not sent");
        }
        self.current_url = location.to_string();
    }

    /// Close the body. Flushes headers first so an empty stream still
    /// yields a well-formed response.
    pub fn finish(&mut self) {
        self.flush_head();
        self.body_tx = None;
    }

    fn write(&mut self, text: String) -> Result<(), WriteError> {
        self.flush_head();
        let tx = self.body_tx.as_ref().ok_or(WriteError::Finished)?;
        tx.unbounded_send(Bytes::from(text))
            .map_err(|_| WriteError::Disconnected)
    }

    fn flush_head(&mut self) {
        let Some(tx) = self.head_tx.take() else { return };
        let mut headers = vec![
            ("content-type".to_string(), STREAM_MEDIA_TYPE.to_string()),
            (HEADER_SERVER_BUNDLE.to_string(), self.bundle_id.clone()),
            (HEADER_UPDATED_AT.to_string(), unix_millis().to_string()),
        ];
        if let Some(location) = self.pending_location.take() {
            headers.push((HEADER_LOCATION.to_string(), location));
        }
        // Send failure means the HTTP layer gave up on the response;
        // writes will surface Disconnected.
        let _ = tx.send(ResponseHead {
            status: 200,
            headers,
        });
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl ResponseHandle {
    pub fn into_parts(
        self,
    ) -> (
        oneshot::Receiver<ResponseHead>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        (self.head_rx, self.body_rx)
    }

    /// Wait for headers-ready, then return a streaming axum response.
    pub async fn into_axum_response(self) -> axum::response::Response {
        use axum::response::IntoResponse;

        let head = match self.head_rx.await {
            Ok(head) => head,
            Err(_) => {
                tracing::error!("response writer dropped before any write");
                return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        let mut builder = axum::http::Response::builder().status(head.status);
        for (name, value) in &head.headers {
            builder = builder.header(name, value);
        }
        let body =
            axum::body::Body::from_stream(self.body_rx.map(Ok::<_, std::convert::Infallible>));
        match builder.body(body) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "malformed response head");
                axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────────────────
