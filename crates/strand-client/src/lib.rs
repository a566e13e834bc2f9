//! strand-client — the client half of the streaming render transport.
//!
//! Data path: [`fetch::RetryingFetch`] opens the connection,
//! [`stream::EventStreamClient`] frames the body into named events,
//! [`reassembler::RowBuffer`] rebuilds wire rows from arbitrary byte
//! fragments, and [`graph::ChunkGraph`] turns rows into a resolved value
//! tree. `update-bundle` events divert to [`bundle::BundleSwapper`].

pub mod bundle;
pub mod fetch;
pub mod graph;
pub mod reassembler;
pub mod registry;
pub mod sse;
pub mod stream;

pub use bundle::{AssetLoader, BundleSwapper, Document, RenderRoot, ScriptTag, SwapError};
pub use fetch::{AbortHandle, AbortSignal, FetchError, RetryingFetch};
pub use graph::{ChunkGraph, ResolveError};
pub use registry::{ModuleRegistry, RegistrySlot};
pub use stream::{ClientError, EventStreamClient, SubscriptionManager};
