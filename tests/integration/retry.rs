//! Retry policy against a live server: bounded attempts, Retry-After
//! handling, and the buffered-body fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;

use strand_client::fetch::{abort_pair, RetryingFetch};
use strand_core::config::StrandConfig;

use crate::serve;

fn fast_config() -> StrandConfig {
    let mut config = StrandConfig::default();
    config.retry.initial_delay_ms = 5;
    config
}

/// Route that fails `failures` times, then succeeds.
fn flaky(failures: usize, hits: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/flaky",
        get(move || {
            let hits = hits.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    (StatusCode::SERVICE_UNAVAILABLE, "down").into_response()
                } else {
                    "up".into_response()
                }
            }
        }),
    )
}

#[tokio::test]
async fn transient_5xx_retried_until_success() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(flaky(2, hits.clone())).await?;

    let fetch = RetryingFetch::new(&fast_config())?;
    let (_handle, mut signal) = abort_pair();
    let response = fetch
        .get(&format!("{base}/flaky"), &[], &mut signal)
        .await?;

    assert!(response.is_success());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn retry_budget_bounds_attempts() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(flaky(usize::MAX, hits.clone())).await?;

    let fetch = RetryingFetch::new(&fast_config())?;
    let (_handle, mut signal) = abort_pair();
    let response = fetch
        .get(&format!("{base}/flaky"), &[], &mut signal)
        .await?;

    // Budget exhausted: the failing response comes back as-is.
    assert_eq!(response.status.as_u16(), 503);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn retry_after_above_ceiling_is_not_honored() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counting = hits.clone();
    let app = Router::new().route(
        "/busy",
        get(move || {
            let counting = counting.clone();
            async move {
                counting.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [("retry-after", "120")],
                    "maintenance",
                )
            }
        }),
    );
    let base = serve(app).await?;

    let fetch = RetryingFetch::new(&fast_config())?;
    let (_handle, mut signal) = abort_pair();
    let response = fetch.get(&format!("{base}/busy"), &[], &mut signal).await?;

    assert_eq!(response.status.as_u16(), 503);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "hint above ceiling: one attempt");
    Ok(())
}

#[tokio::test]
async fn retry_after_within_ceiling_is_honored() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counting = hits.clone();
    let app = Router::new().route(
        "/throttled",
        get(move || {
            let counting = counting.clone();
            async move {
                let n = counting.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "0")], "slow down")
                        .into_response()
                } else {
                    "ok".into_response()
                }
            }
        }),
    );
    let base = serve(app).await?;

    let fetch = RetryingFetch::new(&fast_config())?;
    let (_handle, mut signal) = abort_pair();
    let response = fetch
        .get(&format!("{base}/throttled"), &[], &mut signal)
        .await?;

    assert!(response.is_success());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn client_errors_are_not_retried() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counting = hits.clone();
    let app = Router::new().route(
        "/missing",
        get(move || {
            let counting = counting.clone();
            async move {
                counting.fetch_add(1, Ordering::SeqCst);
                StatusCode::NOT_FOUND
            }
        }),
    );
    let base = serve(app).await?;

    let fetch = RetryingFetch::new(&fast_config())?;
    let (_handle, mut signal) = abort_pair();
    let response = fetch
        .get(&format!("{base}/missing"), &[], &mut signal)
        .await?;

    assert_eq!(response.status.as_u16(), 404);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn buffered_fallback_yields_whole_body_at_once() -> Result<()> {
    let app = Router::new().route("/body", get(|| async { "one two three" }));
    let base = serve(app).await?;

    let mut config = fast_config();
    config.client.force_buffered_fetch = true;
    let fetch = RetryingFetch::new(&config)?;
    let (_handle, mut signal) = abort_pair();
    let response = fetch.get(&format!("{base}/body"), &[], &mut signal).await?;

    let chunks: Vec<_> = response.body.collect().await;
    assert_eq!(chunks.len(), 1, "buffered body arrives as a single chunk");
    assert_eq!(chunks[0].as_ref().unwrap().as_ref(), b"one two three");
    Ok(())
}
