//! End-to-end dual dispatch through a running proxy.

use std::time::{Duration, Instant};

use dual_proxy::capture::Slot;
use dual_proxy::dispatch::{ShadowOutcome, ShadowStage};

mod common;
use common::{client, next_outcome, refused_url, start_backend, start_proxy, start_proxy_with, Reply};

#[tokio::test]
async fn matching_responses_prune_the_secondary_capture() {
    let primary = start_backend(Reply::new(200, "ok").named("primary")).await;
    let secondary = start_backend(Reply::new(200, "ok").named("secondary")).await;
    let proxy = start_proxy(&primary.url(), &secondary.url()).await;
    let mut events = proxy.events();

    let response = client()
        .post(proxy.url("/echo"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    let outcome = next_outcome(&mut events).await;
    let result = outcome.comparison().expect("comparison");
    assert!(!result.is_mismatch());
    assert_eq!(result.exchange.as_u64(), 1);

    let request = std::fs::read(proxy.capture_path(1, Slot::Request)).unwrap();
    assert!(request.starts_with(b"POST /echo HTTP/1.1\r\n"));
    assert!(request.ends_with(b"\r\n\r\nhello"));
    assert!(proxy.capture_path(1, Slot::Primary).exists());
    assert!(!proxy.capture_path(1, Slot::Secondary).exists());

    assert_eq!(primary.requests()[0].1, "hello");
    assert_eq!(secondary.requests()[0].1, "hello");

    assert!(proxy.stop().await.is_clean());
}

#[tokio::test]
async fn mismatch_keeps_every_capture() {
    let primary = start_backend(Reply::new(500, "boom").named("primary")).await;
    let secondary = start_backend(Reply::new(200, "ok").named("secondary")).await;
    let proxy = start_proxy(&primary.url(), &secondary.url()).await;
    let mut events = proxy.events();

    let response = client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.headers()["x-backend"], "primary");
    assert_eq!(response.text().await.unwrap(), "boom");

    let outcome = next_outcome(&mut events).await;
    let result = outcome.comparison().expect("comparison");
    assert!(result.is_mismatch());
    assert_eq!(result.primary, 500);
    assert_eq!(result.secondary, 200);

    for slot in [Slot::Request, Slot::Primary, Slot::Secondary] {
        assert!(proxy.capture_path(1, slot).exists(), "{} missing", slot);
    }
    let secondary_capture = std::fs::read(proxy.capture_path(1, Slot::Secondary)).unwrap();
    assert!(secondary_capture.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(secondary_capture.ends_with(b"ok"));

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_primary_fails_fast_without_secondary() {
    let secondary = start_backend(Reply::new(200, "ok")).await;
    let proxy = start_proxy(&refused_url(), &secondary.url()).await;

    let response = client()
        .post(proxy.url("/orders"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let message = response.text().await.unwrap();
    assert!(message.contains("primary backend request failed"));
    assert!(!message.contains(proxy.dir.path().to_str().unwrap()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(proxy.capture_path(1, Slot::Request).exists());
    assert!(!proxy.capture_path(1, Slot::Primary).exists());
    assert!(!proxy.capture_path(1, Slot::Secondary).exists());
    assert_eq!(secondary.hits(), 0);
    assert_eq!(proxy.dispatcher.shadows_in_flight(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn caller_gets_primary_response_when_secondary_is_down() {
    let primary = start_backend(Reply::new(201, "created").named("primary")).await;
    let proxy = start_proxy(&primary.url(), &refused_url()).await;
    let mut events = proxy.events();

    let response = client()
        .put(proxy.url("/items/7?force=true"))
        .header("x-trace", "abc")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.headers()["x-backend"], "primary");
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "created");

    match next_outcome(&mut events).await {
        ShadowOutcome::Failed { stage, .. } => assert_eq!(stage, ShadowStage::Dispatch),
        other => panic!("expected a failed secondary branch, got {:?}", other),
    }

    let (headers, body) = primary.requests().remove(0);
    assert_eq!(headers["x-trace"], "abc");
    assert_eq!(body, "payload");
    assert!(proxy.capture_path(1, Slot::Primary).exists());
    assert!(!proxy.capture_path(1, Slot::Secondary).exists());

    proxy.stop().await;
}

#[tokio::test]
async fn slow_secondary_does_not_delay_the_caller() {
    let primary = start_backend(Reply::new(200, "fast")).await;
    let secondary = start_backend(Reply::new(200, "slow").after(Duration::from_secs(2))).await;
    let proxy = start_proxy(&primary.url(), &secondary.url()).await;
    let mut events = proxy.events();

    let started = Instant::now();
    let response = client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "fast");
    assert!(started.elapsed() < Duration::from_secs(1));

    let outcome = next_outcome(&mut events).await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(!outcome.comparison().expect("comparison").is_mismatch());

    proxy.stop().await;
}

#[tokio::test]
async fn prune_all_removes_every_capture_of_a_match() {
    let primary = start_backend(Reply::new(204, "")).await;
    let secondary = start_backend(Reply::new(204, "")).await;
    let proxy = start_proxy_with(&primary.url(), &secondary.url(), tempfile::tempdir().unwrap(), |config| {
        config.capture.retention = dual_proxy::config::RetentionPolicy::PruneAll;
    })
    .await;
    let mut events = proxy.events();

    client().delete(proxy.url("/x")).send().await.unwrap();
    next_outcome(&mut events).await;

    for slot in [Slot::Request, Slot::Primary, Slot::Secondary] {
        assert!(!proxy.capture_path(1, slot).exists(), "{} kept", slot);
    }
    proxy.stop().await;
}

#[tokio::test]
async fn large_bodies_replay_from_disk() {
    let primary = start_backend(Reply::new(200, "ok")).await;
    let secondary = start_backend(Reply::new(200, "ok")).await;
    let proxy = start_proxy_with(&primary.url(), &secondary.url(), tempfile::tempdir().unwrap(), |config| {
        config.capture.replay_memory_threshold = 16;
    })
    .await;
    let mut events = proxy.events();

    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let response = client()
        .post(proxy.url("/upload"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    next_outcome(&mut events).await;

    assert_eq!(primary.requests()[0].1, body);
    assert_eq!(secondary.requests()[0].1, body);
    proxy.stop().await;
}

#[tokio::test]
async fn oversize_body_is_rejected_before_any_backend() {
    let primary = start_backend(Reply::new(200, "ok")).await;
    let secondary = start_backend(Reply::new(200, "ok")).await;
    let proxy = start_proxy_with(&primary.url(), &secondary.url(), tempfile::tempdir().unwrap(), |config| {
        config.capture.max_body_bytes = 4;
    })
    .await;

    let response = client()
        .post(proxy.url("/"))
        .body("too long")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
    assert_eq!(primary.hits(), 0);
    assert_eq!(secondary.hits(), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn sequence_resumes_after_existing_captures() {
    let primary = start_backend(Reply::new(200, "ok")).await;
    let secondary = start_backend(Reply::new(200, "ok")).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("000000041.0"), b"GET / HTTP/1.1\r\n\r\n").unwrap();

    let proxy = start_proxy_with(&primary.url(), &secondary.url(), dir, |_| {}).await;
    let mut events = proxy.events();

    client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(next_outcome(&mut events).await.exchange().as_u64(), 42);
    assert!(proxy.capture_path(42, Slot::Request).exists());
    proxy.stop().await;
}

#[tokio::test]
async fn audit_log_records_the_exchange() {
    let primary = start_backend(Reply::new(500, "boom")).await;
    let secondary = start_backend(Reply::new(200, "ok")).await;
    let proxy = start_proxy_with(&primary.url(), &secondary.url(), tempfile::tempdir().unwrap(), |config| {
        config.capture.audit_log = true;
    })
    .await;
    let mut events = proxy.events();

    client().post(proxy.url("/a")).body("hello").send().await.unwrap();
    next_outcome(&mut events).await;
    proxy.dispatcher.flush_audit().await;

    let log = std::fs::read_to_string(proxy.dir.path().join("audit.log")).unwrap();
    let entries: Vec<serde_json::Value> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    let kinds: Vec<&str> = entries.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, ["request", "response", "response", "comparison"]);
    assert!(entries.iter().all(|e| e["exchange"] == "000000001"));
    assert_eq!(entries[0]["body_bytes"], 5);
    assert_eq!(entries[3]["mismatch"], true);

    proxy.stop().await;
}
