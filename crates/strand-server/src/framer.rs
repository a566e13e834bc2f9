//! Row framer — serializes value graphs into wire rows.
//!
//! Chunk ids are assigned monotonically per framer. A tree framed by
//! [`RowFramer::emit`] always yields its root row first, so a consumer
//! that treats the first row of a batch as the root sees the right one
//! even when string hoisting appends extra rows. [`RowFramer::defer`]
//! reserves an id whose definition arrives in a later row; references to
//! it are valid immediately.

use serde_json::json;

use strand_core::row;
use strand_core::{ModuleReference, Value};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// JSON has no encoding for NaN or infinities.
    #[error("non-finite number {0} cannot be framed")]
    NonFiniteNumber(f64),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk {0:x} was never deferred")]
    NotDeferred(u32),
}

pub struct RowFramer {
    next_id: u32,
    rows: Vec<String>,
    pending: Vec<u32>,
    /// Strings at or above this length get their own row and a ref.
    hoist_threshold: Option<usize>,
}

impl RowFramer {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first_id: u32) -> Self {
        Self {
            next_id: first_id,
            rows: Vec::new(),
            pending: Vec::new(),
            hoist_threshold: None,
        }
    }

    /// Hoist strings of at least `min_len` bytes into their own rows.
    pub fn hoist_strings(mut self, min_len: usize) -> Self {
        self.hoist_threshold = Some(min_len);
        self
    }

    fn alloc(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Serialize one tree. The root row lands before any row the
    /// serialization itself produced (hoisted strings).
    pub fn emit(&mut self, value: &Value) -> Result<u32, FrameError> {
        let id = self.alloc();
        let mark = self.rows.len();
        let payload = self.encode(value)?;
        self.rows
            .insert(mark, row::encode_literal(id, &serde_json::to_string(&payload)?));
        Ok(id)
    }

    /// Emit an `I`-tagged module reference row.
    pub fn emit_module(&mut self, module: &ModuleReference) -> Result<u32, FrameError> {
        let id = self.alloc();
        self.rows.push(row::encode_module(id, module)?);
        Ok(id)
    }

    /// Reserve a chunk id to be defined by a later row. `ChunkRef`s to it
    /// may be framed immediately.
    pub fn defer(&mut self) -> u32 {
        let id = self.alloc();
        self.pending.push(id);
        id
    }

    /// Define a previously deferred chunk.
    pub fn define(&mut self, id: u32, value: &Value) -> Result<(), FrameError> {
        let pos = self
            .pending
            .iter()
            .position(|&p| p == id)
            .ok_or(FrameError::NotDeferred(id))?;
        self.pending.remove(pos);
        let payload = self.encode(value)?;
        self.rows
            .push(row::encode_literal(id, &serde_json::to_string(&payload)?));
        Ok(())
    }

    /// Deferred ids with no definition yet. A finished stream should have
    /// none; the client errors them out as never-defined.
    pub fn pending_deferrals(&self) -> &[u32] {
        &self.pending
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    /// Drain the rows accumulated so far. Id assignment continues.
    pub fn take_rows(&mut self) -> Vec<String> {
        std::mem::take(&mut self.rows)
    }

    /// One-shot: frame a single tree and return `(root_id, rows)`.
    pub fn frame(value: &Value) -> Result<(u32, Vec<String>), FrameError> {
        let mut framer = Self::new();
        let root = framer.emit(value)?;
        Ok((root, framer.take_rows()))
    }

    fn encode(&mut self, value: &Value) -> Result<serde_json::Value, FrameError> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Number(n) => serde_json::Value::Number(
                serde_json::Number::from_f64(*n).ok_or(FrameError::NonFiniteNumber(*n))?,
            ),
            Value::String(s) => {
                if self.hoist_threshold.is_some_and(|min| s.len() >= min) {
                    let id = self.alloc();
                    let payload = serde_json::to_string(&row::escape_string(s))?;
                    self.rows.push(row::encode_literal(id, &payload));
                    json!(format!("${id:x}"))
                } else {
                    json!(row::escape_string(s))
                }
            }
            Value::Symbol(name) => json!(format!("$S{name}")),
            Value::ChunkRef(id) => json!(format!("${id:x}")),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(pairs) => {
                let mut map = serde_json::Map::with_capacity(pairs.len());
                for (key, item) in pairs {
                    map.insert(key.clone(), self.encode(item)?);
                }
                serde_json::Value::Object(map)
            }
            Value::Element(el) => {
                let key = match &el.key {
                    Some(k) => json!(k),
                    None => serde_json::Value::Null,
                };
                serde_json::Value::Array(vec![
                    json!("$"),
                    self.encode(&el.kind)?,
                    key,
                    self.encode(&el.props)?,
                ])
            }
        })
    }
}

impl Default for RowFramer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
