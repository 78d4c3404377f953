//! Subscription proxy flows against live upstream fixtures: cache TTL,
//! named-target routing, method gating, link transform and the body size
//! cap.

mod common;

use bytes::Bytes;
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::test]
async fn test_cache_hit_within_ttl_then_refetch() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_counting_backend("subscription-document", hits.clone()).await;
    let gateway = spawn_gateway(settings_from(&[
        ("SUBSCRIPTION_ENABLED", "true"),
        (
            "SUBSCRIPTION_TARGETS",
            &format!("alpha|http://{}|{}|/sub", backend, backend.port()),
        ),
        ("SUBSCRIPTION_CACHE_TTL_MS", "400"),
    ]))
    .await;

    let first = http_request(gateway, "GET", "/sub/TKN", &[]).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body_text(), "subscription-document");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Within the TTL the cached clone is served without an upstream call.
    let second = http_request(gateway, "GET", "/sub/TKN", &[]).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body_text(), "subscription-document");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    sleep(Duration::from_millis(600)).await;
    let third = http_request(gateway, "GET", "/sub/TKN", &[]).await;
    assert_eq!(third.status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_named_target_and_unknown_name_fallback() {
    let alpha_hits = Arc::new(AtomicUsize::new(0));
    let beta_hits = Arc::new(AtomicUsize::new(0));
    let alpha = spawn_counting_backend("doc-from-alpha", alpha_hits.clone()).await;
    let beta = spawn_counting_backend("doc-from-beta", beta_hits.clone()).await;

    let gateway = spawn_gateway(settings_from(&[
        ("SUBSCRIPTION_ENABLED", "true"),
        (
            "SUBSCRIPTION_TARGETS",
            &format!(
                "alpha|http://{}|{}|/sub,beta|http://{}|{}|/sub",
                alpha,
                alpha.port(),
                beta,
                beta.port()
            ),
        ),
        ("SUBSCRIPTION_CACHE_TTL_MS", "60000"),
    ]))
    .await;

    let named = http_request(gateway, "GET", "/beta/sub/tok-1", &[]).await;
    assert_eq!(named.body_text(), "doc-from-beta");
    assert_eq!(beta_hits.load(Ordering::SeqCst), 1);

    // Unknown service names fall back to the first configured target.
    let fallback = http_request(gateway, "GET", "/missing/sub/tok-2", &[]).await;
    assert_eq!(fallback.body_text(), "doc-from-alpha");
    assert_eq!(alpha_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_get_method_rejected() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_counting_backend("doc", hits.clone()).await;
    let gateway = spawn_gateway(settings_from(&[
        ("SUBSCRIPTION_ENABLED", "true"),
        (
            "SUBSCRIPTION_TARGETS",
            &format!("alpha|http://{}|{}|/sub", backend, backend.port()),
        ),
    ]))
    .await;

    let response = http_request(gateway, "POST", "/sub/TKN", &[]).await;
    assert_eq!(response.status, 405);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transform_rewrites_links_to_inbound_host() {
    let backend = spawn_static_backend(|| {
        (
            "text/plain",
            Bytes::from_static(b"connect https://origin.example/path?k=1"),
        )
    })
    .await;
    let gateway = spawn_gateway(settings_from(&[
        ("SUBSCRIPTION_ENABLED", "true"),
        ("SUBSCRIPTION_TRANSFORM", "true"),
        (
            "SUBSCRIPTION_TARGETS",
            &format!("alpha|http://{}|{}|/sub", backend, backend.port()),
        ),
    ]))
    .await;

    let response = http_request(gateway, "GET", "/sub/TKN", &[]).await;
    assert_eq!(response.status, 200);
    // http_request always sends Host: test.example.
    assert_eq!(
        response.body_text(),
        "connect https://test.example/path?k=1"
    );
}

#[tokio::test]
async fn test_body_size_cap_boundary() {
    const CAP: usize = 10 * 1024 * 1024;

    let over = Bytes::from(vec![b'a'; CAP + 1]);
    let over_backend = spawn_static_backend(move || ("text/plain", over.clone())).await;
    let gateway = spawn_gateway(settings_from(&[
        ("SUBSCRIPTION_ENABLED", "true"),
        (
            "SUBSCRIPTION_TARGETS",
            &format!("big|http://{}|{}|/sub", over_backend, over_backend.port()),
        ),
    ]))
    .await;

    let response = http_request(gateway, "GET", "/sub/huge", &[]).await;
    assert_eq!(response.status, 502);
    assert!(response.body_text().contains("size limit"), "body: {}", response.body_text());

    // Exactly at the cap succeeds.
    let exact = Bytes::from(vec![b'b'; CAP]);
    let exact_backend = spawn_static_backend(move || ("text/plain", exact.clone())).await;
    let gateway = spawn_gateway(settings_from(&[
        ("SUBSCRIPTION_ENABLED", "true"),
        (
            "SUBSCRIPTION_TARGETS",
            &format!(
                "exact|http://{}|{}|/sub",
                exact_backend,
                exact_backend.port()
            ),
        ),
    ]))
    .await;

    let response = http_request(gateway, "GET", "/sub/huge", &[]).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), CAP);
}
