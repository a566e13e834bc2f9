//! Event stream client — connection framing and subscription discipline.
//!
//! One outbound request per page transition or subscribe call. The body
//! is SSE-framed; `update` events flow through the row reassembler into
//! the chunk graph, `update-bundle` events divert to the bundle swapper.
//!
//! Subscription discipline: a single slot holds the most recent
//! subscribed reader. Opening a new one cancels every previous reader
//! before the new read loop starts, and the loop re-checks that it is
//! still the current reader after each fragment, before dispatching —
//! a superseded connection's late delivery never reaches shared state.
//! One-shot requests do not participate in the slot.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::task::JoinHandle;

use strand_core::config::StrandConfig;
use strand_core::event::{
    StreamEvent, EVENT_UPDATE, EVENT_UPDATE_BUNDLE, HEADER_BUNDLE, HEADER_SERVER_BUNDLE,
    HEADER_SESSION, HEADER_SUBSCRIBE, STREAM_MEDIA_TYPE,
};
use strand_core::Value;

use crate::bundle::{BundleSwapper, RenderRoot, SwapError};
use crate::fetch::{
    abort_pair, is_benign_disconnect, AbortHandle, AbortSignal, FetchError, RetryingFetch,
};
use crate::graph::{ChunkGraph, ResolveError};
use crate::reassembler::{ReassembleError, RowBuffer};
use crate::registry::RegistrySlot;
use crate::sse::SseParser;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unexpected response status {0}")]
    Status(u16),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Reassemble(#[from] ReassembleError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error("bundle event id {0:?} carries no bundle id")]
    BadBundleEvent(String),

    #[error("stream ended without any update event")]
    EmptyStream,

    #[error("subscription superseded before its reader started")]
    Superseded,
}

// ── Subscription manager ─────────────────────────────────────────────────────

/// The single "latest reader" slot, with generation-tagged supersession.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    reader: Option<AbortHandle>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel-then-replace, atomically: bumps the generation and cancels
    /// the previous reader. Returns the new generation.
    pub fn supersede(&self) -> u64 {
        let mut slot = self.slot.lock().expect("subscription slot poisoned");
        slot.generation += 1;
        if let Some(reader) = slot.reader.take() {
            tracing::debug!(generation = slot.generation, "previous reader cancelled");
            reader.abort();
        }
        slot.generation
    }

    /// Install the reader for `generation`. Cancels it instead and
    /// returns false if a newer subscribe superseded it already.
    pub fn install(&self, generation: u64, reader: AbortHandle) -> bool {
        let mut slot = self.slot.lock().expect("subscription slot poisoned");
        if slot.generation == generation {
            slot.reader = Some(reader);
            true
        } else {
            reader.abort();
            false
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.slot.lock().expect("subscription slot poisoned").generation == generation
    }

    /// Release the reader slot if `generation` still owns it.
    pub fn release(&self, generation: u64) {
        let mut slot = self.slot.lock().expect("subscription slot poisoned");
        if slot.generation == generation {
            slot.reader = None;
        }
    }

    pub fn has_active_reader(&self) -> bool {
        self.slot
            .lock()
            .expect("subscription slot poisoned")
            .reader
            .is_some()
    }
}

/// Releases the reader slot on every exit path of a read loop.
struct ReaderGuard {
    subs: Arc<SubscriptionManager>,
    generation: u64,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.subs.release(self.generation);
    }
}

/// Closes the active graph on every exit path of a read loop, clean or
/// not. Resolvers already detached and suspended on a forward reference
/// must error with never-defined, not hang, once the stream is gone.
struct GraphGuard {
    graph: Arc<ChunkGraph>,
}

impl GraphGuard {
    fn new(registry: &RegistrySlot) -> Self {
        Self {
            graph: Arc::new(ChunkGraph::new(registry.clone())),
        }
    }
}

impl Drop for GraphGuard {
    fn drop(&mut self) {
        self.graph.close();
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct EventStreamClient {
    fetch: RetryingFetch,
    registry: RegistrySlot,
    subs: Arc<SubscriptionManager>,
    media_type: String,
    session: Option<String>,
}

impl EventStreamClient {
    pub fn new(config: &StrandConfig, registry: RegistrySlot) -> Result<Self, FetchError> {
        let media_type = if config.transport.media_type.is_empty() {
            STREAM_MEDIA_TYPE.to_string()
        } else {
            config.transport.media_type.clone()
        };
        Ok(Self {
            fetch: RetryingFetch::new(config)?,
            registry,
            subs: Arc::new(SubscriptionManager::new()),
            media_type,
            session: None,
        })
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subs
    }

    fn headers(&self, subscribe: bool, bundle: &str) -> Vec<(String, String)> {
        let mut headers = vec![("accept".to_string(), self.media_type.clone())];
        if !bundle.is_empty() {
            headers.push((HEADER_BUNDLE.to_string(), bundle.to_string()));
        }
        if let Some(session) = &self.session {
            headers.push((HEADER_SESSION.to_string(), session.clone()));
        }
        if subscribe {
            headers.push((HEADER_SUBSCRIBE.to_string(), "1".to_string()));
        }
        headers
    }

    /// One-shot page transition: fetch, consume the stream to completion,
    /// resolve the first tree. Does not touch the subscription slot.
    pub async fn transition(&self, url: &str, bundle: &str) -> Result<Value, ClientError> {
        let (_handle, mut signal) = abort_pair();
        self.transition_with_abort(url, bundle, &mut signal).await
    }

    /// `transition` with caller-held cancellation. Abandoning the
    /// transition aborts the underlying reader.
    pub async fn transition_with_abort(
        &self,
        url: &str,
        bundle: &str,
        abort: &mut AbortSignal,
    ) -> Result<Value, ClientError> {
        let headers = self.headers(false, bundle);
        let response = self.fetch.get(url, &headers, abort).await?;
        if !response.is_success() {
            return Err(ClientError::Status(response.status.as_u16()));
        }
        if let Some(server_bundle) = response.header(HEADER_SERVER_BUNDLE) {
            if !bundle.is_empty() && server_bundle != bundle {
                tracing::info!(server_bundle, "server bundle differs from ours");
            }
        }

        let graph = ChunkGraph::new(self.registry.clone());
        let mut sse = SseParser::new();
        let mut rows = RowBuffer::new();
        let mut body = response.body;
        let mut root = None;

        loop {
            let fragment = tokio::select! {
                fragment = body.next() => fragment,
                _ = abort.aborted() => return Err(ClientError::Fetch(FetchError::Aborted)),
            };
            let Some(fragment) = fragment else { break };
            let fragment = match fragment {
                Ok(bytes) => bytes,
                Err(e) if is_benign_disconnect(&e) => {
                    tracing::debug!(error = %e, "benign stream close");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            for event in sse.push(&fragment) {
                match event.name.as_str() {
                    EVENT_UPDATE => {
                        let batch_root = ingest_update(&graph, &mut rows, &event)?;
                        if root.is_none() {
                            root = batch_root;
                        }
                    }
                    EVENT_UPDATE_BUNDLE => {
                        // One-shot transitions don't swap; the caller
                        // re-subscribes after a full reload.
                        tracing::info!(id = ?event.id, "bundle update during one-shot transition");
                    }
                    other => tracing::trace!(event = other, "ignored stream event"),
                }
            }
        }
        graph.close();

        let root = root.ok_or(ClientError::EmptyStream)?;
        Ok(graph.resolve(root).await?)
    }

    /// Long-lived subscription: supersedes any previous reader, spawns
    /// the read pump, and returns its handle. Resolved trees go to
    /// `root`; bundle updates go to `swapper`.
    pub fn subscribe(
        &self,
        url: &str,
        root: Arc<dyn RenderRoot>,
        swapper: Arc<BundleSwapper>,
    ) -> Result<JoinHandle<()>, ClientError> {
        let generation = self.subs.supersede();
        let (handle, signal) = abort_pair();
        if !self.subs.install(generation, handle) {
            return Err(ClientError::Superseded);
        }

        let fetch = self.fetch.clone();
        let registry = self.registry.clone();
        let subs = self.subs.clone();
        let headers = self.headers(true, &swapper.active_bundle());
        let url = url.to_string();

        Ok(tokio::spawn(async move {
            // Released on every exit path: completion, error, supersession.
            let _guard = ReaderGuard {
                subs: subs.clone(),
                generation,
            };
            let loop_result = read_loop(
                fetch, registry, subs, generation, signal, url, headers, root, swapper,
            )
            .await;
            match loop_result {
                Ok(()) => tracing::debug!(generation, "subscription stream ended"),
                Err(ClientError::Fetch(FetchError::Aborted)) => {
                    tracing::debug!(generation, "subscription aborted")
                }
                Err(e) => tracing::warn!(generation, error = %e, "subscription failed"),
            }
        }))
    }
}

// ── Read pump ────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    fetch: RetryingFetch,
    registry: RegistrySlot,
    subs: Arc<SubscriptionManager>,
    generation: u64,
    mut signal: AbortSignal,
    url: String,
    headers: Vec<(String, String)>,
    root: Arc<dyn RenderRoot>,
    swapper: Arc<BundleSwapper>,
) -> Result<(), ClientError> {
    let response = fetch.get(&url, &headers, &mut signal).await?;
    if !response.is_success() {
        return Err(ClientError::Status(response.status.as_u16()));
    }
    if let Some(server_bundle) = response.header(HEADER_SERVER_BUNDLE) {
        if server_bundle != swapper.active_bundle() {
            tracing::info!(server_bundle, "server bundle differs, expecting bundle update");
        }
    }

    let mut active = GraphGuard::new(&registry);
    let mut sse = SseParser::new();
    let mut rows = RowBuffer::new();
    let mut body = response.body;

    loop {
        let fragment = tokio::select! {
            fragment = body.next() => fragment,
            _ = signal.aborted() => {
                tracing::debug!(generation, "reader cancelled");
                break;
            }
        };
        let Some(fragment) = fragment else { break };
        let fragment = match fragment {
            Ok(bytes) => bytes,
            Err(e) if is_benign_disconnect(&e) => {
                tracing::debug!(error = %e, "benign stream close");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        // Self-check before dispatch: a late delivery on a superseded
        // connection must not mutate shared state.
        if !subs.is_current(generation) {
            tracing::debug!(generation, "stale reader, dropping late delivery");
            break;
        }

        for event in sse.push(&fragment) {
            match event.name.as_str() {
                EVENT_UPDATE => {
                    if let Some(root_id) = ingest_update(&active.graph, &mut rows, &event)? {
                        spawn_resolution(&active.graph, root_id, &root);
                    }
                }
                EVENT_UPDATE_BUNDLE => {
                    let bundle_id = event
                        .bundle_id()
                        .ok_or_else(|| {
                            ClientError::BadBundleEvent(event.id.clone().unwrap_or_default())
                        })?
                        .to_string();
                    // In-flight trees on the old runtime error out rather
                    // than resolve against it mid-swap.
                    active.graph.close();
                    swapper.swap(&bundle_id, &event.data).await?;
                    active.graph = Arc::new(ChunkGraph::new(registry.clone()));
                }
                other => tracing::trace!(event = other, "ignored stream event"),
            }
        }
    }
    Ok(())
}

/// Feed one `update` event's data through the row reassembler into the
/// graph. Returns the batch's root chunk id (its first row).
fn ingest_update(
    graph: &ChunkGraph,
    rows: &mut RowBuffer,
    event: &StreamEvent,
) -> Result<Option<u32>, ClientError> {
    let mut batch = rows.push(event.data.as_bytes())?;
    if let Some(tail) = rows.finish()? {
        batch.push(tail);
    }
    Ok(graph.ingest_batch(batch)?)
}

/// Resolve one tree off the pump so a forward reference suspends only
/// that tree while the loop keeps reading.
fn spawn_resolution(graph: &Arc<ChunkGraph>, root_id: u32, sink: &Arc<dyn RenderRoot>) {
    let graph = graph.clone();
    let sink = sink.clone();
    tokio::spawn(async move {
        match graph.resolve(root_id).await {
            Ok(tree) => sink.apply(tree),
            Err(e) => tracing::warn!(root = root_id, error = %e, "tree resolution failed"),
        }
    });
}

// ── Tests ────────────────────────────────────────────────────────────────────
