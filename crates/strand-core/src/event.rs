//! Stream event framing and protocol header names.
//!
//! The transport body is a server-sent-event stream. Two event names are
//! meaningful: `update` (data = row-protocol text for one tree) and
//! `update-bundle` (id = `<opaque>-<bundleId>`, data = full static markup).
//! Everything else is ignored by the client.

// ── Media type and header names ──────────────────────────────────────────────

/// `Accept` / `Content-Type` value for the stream body.
pub const STREAM_MEDIA_TYPE: &str = "text/x-strand-stream";

/// Request: presence enables long-lived subscription mode.
pub const HEADER_SUBSCRIBE: &str = "x-strand-subscribe";
/// Request: the client's current bundle id, so the server can decide
/// whether the client's executable surface is already current.
pub const HEADER_BUNDLE: &str = "x-strand-bundle";
/// Request: session resume token.
pub const HEADER_SESSION: &str = "x-strand-session";

/// Response: the server's bundle id. Absent or equal to the client's
/// means no swap is needed; present and different means an
/// `update-bundle` event follows on this stream.
pub const HEADER_SERVER_BUNDLE: &str = "x-strand-server-bundle";
/// Response: unix-millisecond timestamp of the render.
pub const HEADER_UPDATED_AT: &str = "x-strand-updated-at";
/// Response: new location after a mid-stream redirect.
pub const HEADER_LOCATION: &str = "x-strand-location";

/// Content update event: data is one row-protocol tree body.
pub const EVENT_UPDATE: &str = "update";
/// Bundle update event: the client runtime is stale and must swap.
pub const EVENT_UPDATE_BUNDLE: &str = "update-bundle";

// ── Events ───────────────────────────────────────────────────────────────────

/// One named stream event as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub name: String,
    pub id: Option<String>,
    pub data: String,
}

impl StreamEvent {
    /// Bundle id carried in an `update-bundle` event id: the suffix after
    /// the final `-`. The prefix is opaque and only keeps ids unique.
    pub fn bundle_id(&self) -> Option<&str> {
        let id = self.id.as_deref()?;
        match id.rsplit_once('-') {
            Some((_, bundle)) if !bundle.is_empty() => Some(bundle),
            _ => None,
        }
    }
}

/// Encode one event as SSE text. Multi-line data is split across `data:`
/// lines; the client joins them back with `\n`.
pub fn encode_event(name: &str, id: Option<&str>, data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 32);
    out.push_str("event: ");
    out.push_str(name);
    out.push('\n');
    if let Some(id) = id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}
