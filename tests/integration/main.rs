//! Strand integration test harness.
//!
//! Every test spins up a real axum server on an ephemeral loopback port
//! and drives the real client stack against it over HTTP. No mocked
//! transports; the only test doubles are the render-root sink and the
//! in-memory document, which stand in for a host renderer.

mod retry;
mod roundtrip;
mod subscription;

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use strand_client::bundle::{AssetLoader, RenderRoot};
use strand_core::manifest::AssetKind;
use strand_core::Value;

// ── Harness ──────────────────────────────────────────────────────────────────

static INIT_LOGGING: Once = Once::new();

/// Route client/server tracing into the test writer. Filter with
/// RUST_LOG, e.g. `RUST_LOG=strand_client=debug`.
fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Serve `app` on an ephemeral loopback port; returns its base URL.
/// The server task lives until the runtime shuts down.
pub async fn serve(app: Router) -> Result<String> {
    init_logging();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("binding ephemeral port")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

/// Render-root sink that records every applied tree.
pub struct CollectingRoot {
    trees: Mutex<Vec<Value>>,
    teardowns: Mutex<usize>,
    notify: tokio::sync::Notify,
}

impl CollectingRoot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            trees: Mutex::new(Vec::new()),
            teardowns: Mutex::new(0),
            notify: tokio::sync::Notify::new(),
        })
    }

    pub fn trees(&self) -> Vec<Value> {
        self.trees.lock().unwrap().clone()
    }

    pub fn teardowns(&self) -> usize {
        *self.teardowns.lock().unwrap()
    }

    /// Wait until at least `count` trees have been applied.
    pub async fn wait_for(&self, count: usize) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.trees.lock().unwrap().len() >= count {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .context("timed out waiting for applied trees")
    }
}

impl RenderRoot for CollectingRoot {
    fn apply(&self, tree: Value) {
        self.trees.lock().unwrap().push(tree);
        self.notify.notify_one();
    }

    fn teardown(&self) {
        *self.teardowns.lock().unwrap() += 1;
    }
}

/// Asset loader that always succeeds without touching the network.
pub struct NullLoader;

impl AssetLoader for NullLoader {
    fn fetch(
        &self,
        _kind: AssetKind,
        _url: &str,
    ) -> BoxFuture<'_, std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>> {
        async { Ok(Bytes::from_static(b"asset")) }.boxed()
    }
}

/// Poll `check` until it passes or five seconds elapse.
pub async fn eventually(mut check: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("condition not reached in time")
}
