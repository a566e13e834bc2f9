//! Strand wire rows — the on-wire line format for chunk definitions.
//!
//! One row per line, UTF-8 text:
//!
//! ```text
//! <hex chunk id>:<json payload>    literal value with $-escaped strings
//! <hex chunk id>:I<json payload>   module reference {"chunks":[..],"name":".."}
//! ```
//!
//! These rows ARE the protocol. The tag byte space and the `$` string
//! grammar are shared between the server framer and the client resolver;
//! changing either here is a breaking change.

use crate::value::ModuleReference;

// ── Rows ─────────────────────────────────────────────────────────────────────

/// One parsed wire row: a chunk id and its body.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: u32,
    pub body: RowBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowBody {
    /// Untagged payload: a JSON literal, kept as text until the resolver
    /// walks it with the $-grammar applied.
    Literal(String),
    /// `I`-tagged payload: a reference into the Module Registry.
    Module(ModuleReference),
}

/// Parse one complete row (no trailing newline).
pub fn parse_row(line: &str) -> Result<Row, RowError> {
    let (id_part, payload) = line
        .split_once(':')
        .ok_or_else(|| RowError::MissingSeparator(line.to_string()))?;

    let id = u32::from_str_radix(id_part, 16)
        .map_err(|_| RowError::BadChunkId(id_part.to_string()))?;

    if payload == "true" || payload == "false" || payload == "null" {
        return Ok(Row {
            id,
            body: RowBody::Literal(payload.to_string()),
        });
    }

    let mut chars = payload.chars();
    match chars.next() {
        None => Err(RowError::EmptyRow(id)),
        Some('I') => {
            let module = serde_json::from_str(chars.as_str()).map_err(RowError::BadPayload)?;
            Ok(Row {
                id,
                body: RowBody::Module(module),
            })
        }
        // Any JSON start byte. Other tag letters are reserved.
        Some(c) if c == '{' || c == '[' || c == '"' || c == '-' || c.is_ascii_digit() => Ok(Row {
            id,
            body: RowBody::Literal(payload.to_string()),
        }),
        Some(c) => Err(RowError::UnknownTag(c)),
    }
}

/// Encode a literal row. `payload` must already be valid JSON text with
/// `$`-escapes applied (the framer's job).
pub fn encode_literal(id: u32, payload: &str) -> String {
    format!("{id:x}:{payload}")
}

/// Encode a module reference row.
pub fn encode_module(id: u32, module: &ModuleReference) -> Result<String, serde_json::Error> {
    Ok(format!("{id:x}:I{}", serde_json::to_string(module)?))
}

// ── String marker grammar ────────────────────────────────────────────────────

/// Classification of one string leaf inside a literal payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker<'a> {
    /// The single character `$` — the opaque element marker.
    ElementMarker,
    /// `$$...`: a literal string whose real leading `$` was escaped.
    /// The payload is the unescaped string, `$` included.
    Escaped(&'a str),
    /// `$S<name>`: a process-wide named symbol.
    Symbol(&'a str),
    /// `$<hex>`: a reference to another chunk.
    Ref(u32),
    /// Any string not starting with `$`.
    Plain,
}

/// Apply the `$` grammar to one string leaf.
///
/// A `$` followed by anything that is neither `$`, `S`, nor a hex id is a
/// protocol violation, not a plain string.
pub fn classify_marker(s: &str) -> Result<Marker<'_>, RowError> {
    if s == "$" {
        return Ok(Marker::ElementMarker);
    }
    if s.starts_with("$$") {
        return Ok(Marker::Escaped(&s[1..]));
    }
    if let Some(name) = s.strip_prefix("$S") {
        return Ok(Marker::Symbol(name));
    }
    if let Some(hex_id) = s.strip_prefix('$') {
        let id = u32::from_str_radix(hex_id, 16)
            .map_err(|_| RowError::BadMarker(s.to_string()))?;
        return Ok(Marker::Ref(id));
    }
    Ok(Marker::Plain)
}

/// Escape a plain string for the wire: a real leading `$` becomes `$$`.
pub fn escape_string(s: &str) -> String {
    if s.starts_with('$') {
        format!("${s}")
    } else {
        s.to_string()
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors interpreting wire rows. All are fatal for the tree that
/// contains the offending row, never retried.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("row has no ':' separator: {0:?}")]
    MissingSeparator(String),

    #[error("bad hex chunk id: {0:?}")]
    BadChunkId(String),

    #[error("unknown row tag: {0:?}")]
    UnknownTag(char),

    #[error("chunk {0:x} has an empty payload")]
    EmptyRow(u32),

    #[error("bad row payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    #[error("bad $-marker in string: {0:?}")]
    BadMarker(String),
}

// ── Tests ────────────────────────────────────────────────────────────────────
