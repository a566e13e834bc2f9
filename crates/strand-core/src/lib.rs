//! strand-core — wire format, value model, and stream event framing.
//! The client and server crates both depend on this one.

pub mod config;
pub mod event;
pub mod manifest;
pub mod row;
pub mod value;

pub use manifest::{Asset, AssetKind, BundleManifest};
pub use row::{Marker, Row, RowBody, RowError};
pub use value::{ElementNode, ModuleReference, Value};
