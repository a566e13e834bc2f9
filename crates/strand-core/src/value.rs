//! The streamed value model.
//!
//! A rendered tree is transported as a graph of chunks. Inside one chunk's
//! payload, values are ordinary JSON except that strings carry a `$` marker
//! grammar (see [`crate::row`]) and arrays whose first element is the element
//! marker are reinterpreted as opaque rendered nodes. `ChunkRef` is the
//! arena-style index that turns the tree into a graph: shared and
//! forward-referenced subtrees are addressed by chunk id until the resolver
//! replaces them with the resolved value.

use serde::{Deserialize, Serialize};

/// One value in the streamed graph.
///
/// `Object` keeps insertion order so a framed-then-resolved tree compares
/// structurally equal to its source.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// A process-wide named symbol, written `$S<name>` on the wire.
    /// Not a string: two symbols are equal iff their names are equal.
    Symbol(String),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
    /// One opaque rendered node. The transport never interprets it.
    Element(Box<ElementNode>),
    /// Unresolved reference to another chunk. Never present in a tree
    /// returned by the resolver.
    ChunkRef(u32),
}

impl Value {
    /// True if this value or any transitive child is a `ChunkRef`.
    pub fn has_refs(&self) -> bool {
        match self {
            Value::ChunkRef(_) => true,
            Value::Array(items) => items.iter().any(Value::has_refs),
            Value::Object(pairs) => pairs.iter().any(|(_, v)| v.has_refs()),
            Value::Element(el) => {
                el.kind.has_refs() || el.props.has_refs()
            }
            _ => false,
        }
    }
}

/// One rendered node: `["$", kind, key, props]` on the wire.
///
/// `kind` is usually a string tag but may be a `ChunkRef` to a client
/// module reference; the resolver resolves it like any other value.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub kind: Value,
    pub key: Option<String>,
    pub props: Value,
}

/// Reference to a named export of a loadable executable unit.
///
/// Resolved against the Module Registry, not the chunk graph. The build
/// step assigns each loadable unit a chunk id that is stable for the
/// lifetime of one deployed bundle; this type relies only on that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleReference {
    #[serde(rename = "chunks")]
    pub chunk_ids: Vec<u32>,
    #[serde(rename = "name")]
    pub export_name: String,
}
