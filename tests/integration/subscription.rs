//! Subscribed streams: supersession, resolution gating, registry misses,
//! and the full bundle-swap path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use axum::Router;

use strand_client::bundle::{BundleSwapper, Document, HttpAssetLoader, MemoryDocument};
use strand_client::registry::RegistrySlot;
use strand_client::stream::EventStreamClient;
use strand_core::config::StrandConfig;
use strand_core::{ModuleReference, Value};
use strand_server::{ResponseStream, RowFramer};

use crate::{eventually, serve, CollectingRoot, NullLoader};

fn client(registry: RegistrySlot) -> Result<EventStreamClient> {
    Ok(EventStreamClient::new(&StrandConfig::default(), registry)?)
}

fn swapper(registry: RegistrySlot) -> Arc<BundleSwapper> {
    Arc::new(BundleSwapper::new(
        Arc::new(MemoryDocument::new()),
        Arc::new(NullLoader),
        registry,
        "b1",
    ))
}

/// Route that streams one numbered update every 25ms until the client
/// goes away.
fn ticking() -> Router {
    Router::new().route(
        "/sub",
        get(|| async {
            let (mut stream, handle) = ResponseStream::new("/sub", "b1");
            tokio::spawn(async move {
                let mut framer = RowFramer::new();
                let mut n = 0.0;
                loop {
                    framer.emit(&Value::Number(n)).unwrap();
                    if stream.send_update(&framer.take_rows()).is_err() {
                        break;
                    }
                    n += 1.0;
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            });
            handle.into_axum_response().await
        }),
    )
}

#[tokio::test]
async fn second_subscribe_supersedes_first() -> Result<()> {
    let base = serve(ticking()).await?;
    let url = format!("{base}/sub");
    let registry = RegistrySlot::default();
    let client = client(registry.clone())?;

    let first = CollectingRoot::new();
    let handle1 = client.subscribe(&url, first.clone(), swapper(registry.clone()))?;
    first.wait_for(1).await?;

    let second = CollectingRoot::new();
    let _handle2 = client.subscribe(&url, second.clone(), swapper(registry))?;
    second.wait_for(1).await?;

    // The first reader is cancelled and its loop exits.
    tokio::time::timeout(Duration::from_secs(2), handle1).await??;

    // No late delivery from the superseded connection reaches its root.
    let frozen = first.trees().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first.trees().len(), frozen);

    // Exactly one reader remains.
    assert!(client.subscriptions().has_active_reader());
    assert!(second.trees().len() >= 1);
    Ok(())
}

#[tokio::test]
async fn tree_application_gated_on_late_chunk() -> Result<()> {
    let app = Router::new().route(
        "/sub",
        get(|| async {
            let (mut stream, handle) = ResponseStream::new("/sub", "b1");
            tokio::spawn(async move {
                let mut framer = RowFramer::new();
                let root = framer.defer();
                let greeting = framer.defer();
                framer
                    .define(
                        root,
                        &Value::Object(vec![("a".into(), Value::ChunkRef(greeting))]),
                    )
                    .unwrap();
                let _ = stream.send_update(&framer.take_rows());

                tokio::time::sleep(Duration::from_millis(80)).await;
                framer
                    .define(greeting, &Value::String("hello".into()))
                    .unwrap();
                let _ = stream.send_update(&framer.take_rows());
                stream.finish();
            });
            handle.into_axum_response().await
        }),
    );
    let base = serve(app).await?;
    let registry = RegistrySlot::default();
    let client = client(registry.clone())?;

    let root = CollectingRoot::new();
    let handle = client.subscribe(&format!("{base}/sub"), root.clone(), swapper(registry))?;

    let expected = Value::Object(vec![("a".into(), Value::String("hello".into()))]);
    eventually(|| root.trees().contains(&expected)).await?;
    tokio::time::timeout(Duration::from_secs(2), handle).await??;
    Ok(())
}

#[tokio::test]
async fn registry_miss_is_fatal_for_the_subscription() -> Result<()> {
    let app = Router::new().route(
        "/sub",
        get(|| async {
            let (mut stream, handle) = ResponseStream::new("/sub", "b1");
            tokio::spawn(async move {
                let mut framer = RowFramer::new();
                framer
                    .emit_module(&ModuleReference {
                        chunk_ids: vec![99],
                        export_name: "Missing".into(),
                    })
                    .unwrap();
                let _ = stream.send_update(&framer.take_rows());
                stream.finish();
            });
            handle.into_axum_response().await
        }),
    );
    let base = serve(app).await?;
    let registry = RegistrySlot::default();
    let client = client(registry.clone())?;

    let root = CollectingRoot::new();
    let handle = client.subscribe(&format!("{base}/sub"), root.clone(), swapper(registry))?;

    // The loop fails fast, releases its slot, and applies nothing.
    tokio::time::timeout(Duration::from_secs(2), handle).await??;
    assert!(root.trees().is_empty());
    assert!(!client.subscriptions().has_active_reader());
    Ok(())
}

#[tokio::test]
async fn bundle_swap_end_to_end() -> Result<()> {
    const MARKUP: &str = concat!(
        r#"<html data-bundle="b2"><head>"#,
        r#"<link rel="stylesheet" href="/assets/app.b2.css">"#,
        r#"<script src="/assets/app.b2.js"></script>"#,
        r#"</head><body><h1>fresh</h1></body></html>"#,
    );

    let app = Router::new()
        .route(
            "/sub",
            get(|| async {
                let (mut stream, handle) = ResponseStream::new("/sub", "b1");
                tokio::spawn(async move {
                    let mut framer = RowFramer::new();
                    framer.emit(&Value::String("before".into())).unwrap();
                    let _ = stream.send_update(&framer.take_rows());

                    let _ = stream.send_bundle("b2", MARKUP);

                    // Fresh framer: the client starts a fresh graph after
                    // the swap, so chunk ids restart.
                    let mut framer = RowFramer::new();
                    framer.emit(&Value::String("after".into())).unwrap();
                    let _ = stream.send_update(&framer.take_rows());
                    stream.finish();
                });
                handle.into_axum_response().await
            }),
        )
        .route("/assets/app.b2.js", get(|| async { "js-bytes" }))
        .route("/assets/app.b2.css", get(|| async { "css-bytes" }));
    let base = serve(app).await?;

    let registry = RegistrySlot::default();
    registry.current().register(1, "Old", Value::Null);

    let doc = Arc::new(MemoryDocument::new());
    let swapper = Arc::new(BundleSwapper::new(
        doc.clone(),
        Arc::new(HttpAssetLoader::new(base.clone())),
        registry.clone(),
        "b1",
    ));
    let root = CollectingRoot::new();
    swapper.install_root(root.clone());

    let client = client(registry.clone())?;
    let handle = client.subscribe(&format!("{base}/sub"), root.clone(), swapper.clone())?;
    tokio::time::timeout(Duration::from_secs(5), handle).await??;

    assert_eq!(swapper.active_bundle(), "b2");
    assert_eq!(root.teardowns(), 1);
    assert!(doc.snapshot().contains("<h1>fresh</h1>"));
    assert_eq!(doc.executions(), 1, "script re-executes via a fresh node");
    assert!(registry.current().is_empty(), "registry replaced wholesale");

    // Updates on both sides of the swap reached the renderer.
    eventually(|| root.trees().contains(&Value::String("before".into()))).await?;
    eventually(|| root.trees().contains(&Value::String("after".into()))).await?;
    Ok(())
}
