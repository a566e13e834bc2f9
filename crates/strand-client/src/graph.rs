//! Chunk graph resolution — rows in, resolved value trees out.
//!
//! The graph is a map from chunk id to a cell that starts empty and is
//! filled at most once (the arena-with-indices pattern). A cell is created
//! the first time its id is referenced or defined, whichever comes first.
//! Readers hold the id, not the value, until resolution completes: waiting
//! on a forward reference is a watch-channel await, not a busy loop, so
//! the read pump keeps processing unrelated rows while one tree is
//! suspended.
//!
//! Resolution is all-or-nothing per top-level tree: a tree that
//! transitively references an undefined chunk errors once the stream
//! closes, and never yields a partial result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

use strand_core::row::{self, Marker, Row, RowBody, RowError};
use strand_core::{ElementNode, Value};

use crate::registry::RegistrySlot;

// ── States and errors ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum ChunkState {
    Pending,
    Resolved(Arc<Value>),
    Errored(ResolveError),
}

/// Errors from chunk resolution. Framing and registry errors are fatal for
/// the tree that hit them and are never retried: they indicate either a
/// protocol bug or a stale client, and retry fixes neither.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("malformed row: {0}")]
    Malformed(String),

    /// A second definition row arrived for an already-resolved id.
    #[error("chunk {0:x} defined twice")]
    DuplicateChunk(u32),

    /// Distinct from "not yet resolved": the stream ended and no
    /// definition for this id ever arrived.
    #[error("chunk {0:x} was never defined")]
    ChunkNeverDefined(u32),

    /// The referenced executable unit was never loaded. Indicates a
    /// version mismatch between server-sent references and the client's
    /// code; the bundle swap path exists to prevent exactly this.
    #[error("module export {export:?} of chunk {chunk_id:x} is not loaded")]
    ModuleNotLoaded { chunk_id: u32, export: String },

    #[error("cyclic reference through chunk {0:x}")]
    CyclicReference(u32),
}

impl From<RowError> for ResolveError {
    fn from(e: RowError) -> Self {
        ResolveError::Malformed(e.to_string())
    }
}

// ── Graph ────────────────────────────────────────────────────────────────────

/// The per-stream chunk graph. One instance per connection; ids are never
/// reused within it.
pub struct ChunkGraph {
    inner: Mutex<GraphInner>,
    registry: RegistrySlot,
}

struct GraphInner {
    cells: HashMap<u32, watch::Sender<ChunkState>>,
    closed: bool,
}

impl ChunkGraph {
    pub fn new(registry: RegistrySlot) -> Self {
        Self {
            inner: Mutex::new(GraphInner {
                cells: HashMap::new(),
                closed: false,
            }),
            registry,
        }
    }

    /// Ingest one update event body: one row per line, first row is the
    /// root of the tree. Returns the root id, or None for an empty body.
    pub fn ingest(&self, data: &str) -> Result<Option<u32>, ResolveError> {
        self.ingest_batch(data.lines())
    }

    /// Ingest one batch of complete rows. The first row is the batch's
    /// tree root; blank rows are skipped.
    pub fn ingest_batch<I>(&self, lines: I) -> Result<Option<u32>, ResolveError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut root = None;
        for line in lines {
            let line = line.as_ref();
            if line.is_empty() {
                continue;
            }
            let parsed = row::parse_row(line)?;
            if root.is_none() {
                root = Some(parsed.id);
            }
            self.ingest_row(parsed)?;
        }
        Ok(root)
    }

    /// Interpret one complete row and fill its cell.
    ///
    /// Literal payloads are parsed with the `$` grammar applied to every
    /// string leaf; module rows are looked up in the Module Registry. A
    /// registry miss errors the cell (and this call) rather than leaving
    /// it pending: no later row can fix a stale client.
    pub fn ingest_row(&self, row: Row) -> Result<(), ResolveError> {
        let id = row.id;
        let state = match row.body {
            RowBody::Literal(payload) => {
                let json: serde_json::Value = serde_json::from_str(&payload)
                    .map_err(|e| ResolveError::Malformed(e.to_string()))?;
                match raw_value(&json) {
                    Ok(v) => ChunkState::Resolved(Arc::new(v)),
                    Err(e) => ChunkState::Errored(e),
                }
            }
            RowBody::Module(module) => {
                let chunk_id = *module.chunk_ids.first().ok_or_else(|| {
                    ResolveError::Malformed("module reference names no chunks".into())
                })?;
                match self.registry.current().lookup(chunk_id, &module.export_name) {
                    Some(v) => ChunkState::Resolved(Arc::new(v)),
                    None => ChunkState::Errored(ResolveError::ModuleNotLoaded {
                        chunk_id,
                        export: module.export_name,
                    }),
                }
            }
        };

        let result = match &state {
            ChunkState::Errored(e) => Err(e.clone()),
            _ => Ok(()),
        };

        let mut inner = self.inner.lock().expect("chunk graph poisoned");
        if inner.closed {
            tracing::warn!(id, "row arrived after stream end, dropped");
            return result;
        }
        match inner.cells.get(&id) {
            Some(cell) => {
                if !matches!(*cell.borrow(), ChunkState::Pending) {
                    return Err(ResolveError::DuplicateChunk(id));
                }
                cell.send_replace(state);
            }
            None => {
                let (tx, _rx) = watch::channel(state);
                inner.cells.insert(id, tx);
            }
        }
        tracing::trace!(id, "chunk ingested");
        result
    }

    /// Mark the stream as ended. Every still-pending cell errors with
    /// `ChunkNeverDefined` so waiting resolvers fail instead of hanging,
    /// and references created after this point error immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("chunk graph poisoned");
        inner.closed = true;
        for (id, cell) in &inner.cells {
            if matches!(*cell.borrow(), ChunkState::Pending) {
                cell.send_replace(ChunkState::Errored(ResolveError::ChunkNeverDefined(*id)));
            }
        }
    }

    /// Fully resolve the tree rooted at `id`: awaits the root cell and
    /// every transitively referenced cell, then returns a tree with no
    /// `ChunkRef` leaves remaining.
    pub async fn resolve(&self, id: u32) -> Result<Value, ResolveError> {
        let mut path = Vec::new();
        self.resolve_ref(id, &mut path).await
    }

    /// Subscribe to the cell for `id`, creating it pending on first
    /// reference. After close, a missing cell is a hard error, not a wait.
    fn cell(&self, id: u32) -> watch::Receiver<ChunkState> {
        let mut inner = self.inner.lock().expect("chunk graph poisoned");
        if let Some(cell) = inner.cells.get(&id) {
            return cell.subscribe();
        }
        let initial = if inner.closed {
            ChunkState::Errored(ResolveError::ChunkNeverDefined(id))
        } else {
            ChunkState::Pending
        };
        let (tx, rx) = watch::channel(initial);
        inner.cells.insert(id, tx);
        rx
    }

    /// Await one cell until it leaves the pending state.
    async fn wait(&self, id: u32) -> Result<Arc<Value>, ResolveError> {
        let mut rx = self.cell(id);
        let state = rx
            .wait_for(|s| !matches!(s, ChunkState::Pending))
            .await
            .map(|s| (*s).clone())
            .map_err(|_| ResolveError::ChunkNeverDefined(id))?;
        match state {
            ChunkState::Resolved(value) => Ok(value),
            ChunkState::Errored(e) => Err(e),
            ChunkState::Pending => unreachable!("wait_for returned a pending cell"),
        }
    }

    fn resolve_ref<'a>(
        &'a self,
        id: u32,
        path: &'a mut Vec<u32>,
    ) -> BoxFuture<'a, Result<Value, ResolveError>> {
        async move {
            // A ref back into the current resolution path cannot complete:
            // the target's cell resolves only after this walk finishes.
            if path.contains(&id) {
                return Err(ResolveError::CyclicReference(id));
            }
            path.push(id);
            let raw = self.wait(id).await?;
            let resolved = self.resolve_value(&raw, path).await;
            path.pop();
            resolved
        }
        .boxed()
    }

    fn resolve_value<'a>(
        &'a self,
        value: &'a Value,
        path: &'a mut Vec<u32>,
    ) -> BoxFuture<'a, Result<Value, ResolveError>> {
        async move {
            Ok(match value {
                Value::Null => Value::Null,
                Value::Bool(b) => Value::Bool(*b),
                Value::Number(n) => Value::Number(*n),
                Value::String(s) => Value::String(s.clone()),
                Value::Symbol(s) => Value::Symbol(s.clone()),
                Value::ChunkRef(id) => self.resolve_ref(*id, path).await?,
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_value(item, &mut *path).await?);
                    }
                    Value::Array(out)
                }
                Value::Object(pairs) => {
                    let mut out = Vec::with_capacity(pairs.len());
                    for (key, item) in pairs {
                        out.push((key.clone(), self.resolve_value(item, &mut *path).await?));
                    }
                    Value::Object(out)
                }
                Value::Element(el) => {
                    let kind = self.resolve_value(&el.kind, &mut *path).await?;
                    let props = self.resolve_value(&el.props, &mut *path).await?;
                    Value::Element(Box::new(ElementNode {
                        kind,
                        key: el.key.clone(),
                        props,
                    }))
                }
            })
        }
        .boxed()
    }
}

// ── Literal payload interpretation ───────────────────────────────────────────

/// Convert a parsed JSON payload into a raw `Value`: markers classified,
/// element arrays reinterpreted, `ChunkRef`s left symbolic for the
/// resolver to await.
fn raw_value(json: &serde_json::Value) -> Result<Value, ResolveError> {
    use serde_json::Value as J;
    Ok(match json {
        J::Null => Value::Null,
        J::Bool(b) => Value::Bool(*b),
        J::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        J::String(s) => match row::classify_marker(s)? {
            Marker::ElementMarker => Value::String("$".into()),
            Marker::Escaped(text) => Value::String(text.to_string()),
            Marker::Symbol(name) => Value::Symbol(name.to_string()),
            Marker::Ref(id) => Value::ChunkRef(id),
            Marker::Plain => Value::String(s.clone()),
        },
        J::Array(items) => {
            if matches!(items.first(), Some(J::String(s)) if s == "$") {
                // ["$", kind, key, props] — one opaque rendered node.
                let kind = match items.get(1) {
                    Some(v) => raw_value(v)?,
                    None => {
                        return Err(ResolveError::Malformed(
                            "element array has no kind".into(),
                        ))
                    }
                };
                let key = match items.get(2) {
                    None | Some(J::Null) => None,
                    Some(J::String(k)) => Some(k.clone()),
                    Some(other) => {
                        return Err(ResolveError::Malformed(format!(
                            "element key must be string or null, got {other}"
                        )))
                    }
                };
                let props = match items.get(3) {
                    Some(v) => raw_value(v)?,
                    None => Value::Null,
                };
                Value::Element(Box::new(ElementNode { kind, key, props }))
            } else {
                Value::Array(items.iter().map(raw_value).collect::<Result<_, _>>()?)
            }
        }
        J::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), raw_value(v)?)))
                .collect::<Result<_, ResolveError>>()?,
        ),
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────
