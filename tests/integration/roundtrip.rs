//! Server-framed trees through HTTP to client-resolved values.

use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use axum::Router;

use strand_client::registry::RegistrySlot;
use strand_client::stream::EventStreamClient;
use strand_core::config::StrandConfig;
use strand_core::{ElementNode, ModuleReference, Value};
use strand_server::{ResponseStream, RowFramer};

use crate::serve;

fn sample_tree() -> Value {
    Value::Element(Box::new(ElementNode {
        kind: Value::String("section".into()),
        key: Some("home".into()),
        props: Value::Object(vec![
            ("title".into(), Value::String("$ rates today".into())),
            ("revision".into(), Value::Number(7.0)),
            (
                "children".into(),
                Value::Array(vec![
                    Value::Symbol("react.fragment".into()),
                    Value::Element(Box::new(ElementNode {
                        kind: Value::String("p".into()),
                        key: None,
                        props: Value::Object(vec![(
                            "children".into(),
                            Value::String("hello".into()),
                        )]),
                    })),
                ]),
            ),
        ]),
    }))
}

fn client() -> Result<EventStreamClient> {
    Ok(EventStreamClient::new(
        &StrandConfig::default(),
        RegistrySlot::default(),
    )?)
}

#[tokio::test]
async fn framed_tree_survives_http_round_trip() -> Result<()> {
    let app = Router::new().route(
        "/page",
        get(|| async {
            let (mut stream, handle) = ResponseStream::new("/page", "b1");
            tokio::spawn(async move {
                let (_, rows) = RowFramer::frame(&sample_tree()).unwrap();
                let _ = stream.send_update(&rows);
                stream.finish();
            });
            handle.into_axum_response().await
        }),
    );
    let base = serve(app).await?;

    let tree = client()?.transition(&format!("{base}/page"), "b1").await?;
    assert_eq!(tree, sample_tree());
    Ok(())
}

#[tokio::test]
async fn hoisted_strings_resolve_back_inline() -> Result<()> {
    let app = Router::new().route(
        "/page",
        get(|| async {
            let (mut stream, handle) = ResponseStream::new("/page", "b1");
            tokio::spawn(async move {
                let mut framer = RowFramer::new().hoist_strings(4);
                framer.emit(&sample_tree()).unwrap();
                let _ = stream.send_update(&framer.take_rows());
                stream.finish();
            });
            handle.into_axum_response().await
        }),
    );
    let base = serve(app).await?;

    let tree = client()?.transition(&format!("{base}/page"), "b1").await?;
    assert_eq!(tree, sample_tree());
    Ok(())
}

#[tokio::test]
async fn forward_reference_across_updates_resolves() -> Result<()> {
    let app = Router::new().route(
        "/page",
        get(|| async {
            let (mut stream, handle) = ResponseStream::new("/page", "b1");
            tokio::spawn(async move {
                let mut framer = RowFramer::starting_at(1);
                let root = framer.defer();
                let hello = framer.defer();
                framer
                    .define(
                        root,
                        &Value::Object(vec![("a".into(), Value::ChunkRef(hello))]),
                    )
                    .unwrap();
                let _ = stream.send_update(&framer.take_rows());

                // The referenced chunk arrives in a later update.
                tokio::time::sleep(Duration::from_millis(50)).await;
                framer.define(hello, &Value::String("hello".into())).unwrap();
                let _ = stream.send_update(&framer.take_rows());
                stream.finish();
            });
            handle.into_axum_response().await
        }),
    );
    let base = serve(app).await?;

    let tree = client()?.transition(&format!("{base}/page"), "b1").await?;
    assert_eq!(
        tree,
        Value::Object(vec![("a".into(), Value::String("hello".into()))])
    );
    Ok(())
}

#[tokio::test]
async fn module_reference_resolves_through_registry() -> Result<()> {
    let app = Router::new().route(
        "/page",
        get(|| async {
            let (mut stream, handle) = ResponseStream::new("/page", "b1");
            tokio::spawn(async move {
                let mut framer = RowFramer::starting_at(1);
                let root = framer.defer();
                let module = framer
                    .emit_module(&ModuleReference {
                        chunk_ids: vec![10],
                        export_name: "App".into(),
                    })
                    .unwrap();
                framer
                    .define(
                        root,
                        &Value::Object(vec![("component".into(), Value::ChunkRef(module))]),
                    )
                    .unwrap();
                // Root row first: define appended it after the module row.
                let mut rows = framer.take_rows();
                rows.rotate_right(1);
                let _ = stream.send_update(&rows);
                stream.finish();
            });
            handle.into_axum_response().await
        }),
    );
    let base = serve(app).await?;

    let registry = RegistrySlot::default();
    registry
        .current()
        .register(10, "App", Value::Symbol("module.10.App".into()));
    let client = EventStreamClient::new(&StrandConfig::default(), registry)?;

    let tree = client.transition(&format!("{base}/page"), "b1").await?;
    assert_eq!(
        tree,
        Value::Object(vec![(
            "component".into(),
            Value::Symbol("module.10.App".into())
        )])
    );
    Ok(())
}
