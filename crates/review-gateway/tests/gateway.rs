//! Gateway behaviour against a mock upstream.

use gateway_cache::{CacheKey, CachePolicy, CacheStore, CachedEntry, MemoryStore, ResourceRequest};
use review_gateway::{FetchSource, Gateway, GatewayError, GatewaySettings, SkipReason, Validator};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NS: &str = "featurable-widget";

fn settings() -> GatewaySettings {
    GatewaySettings {
        namespace: NS.into(),
        timeout: Duration::from_secs(2),
        max_body_size: 1_048_576,
        background_revalidation: false,
    }
}

fn setup(settings: GatewaySettings) -> (Gateway, Arc<dyn CacheStore>) {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(1024));
    let gateway = Gateway::new(Arc::clone(&store), settings).unwrap();
    (gateway, store)
}

fn non_null_object() -> Validator {
    Arc::new(|body: &Value| body.is_object())
}

/// Ten minutes of stale window after one second fresh.
fn swr_policy() -> CachePolicy {
    CachePolicy::custom(Duration::from_secs(1), Duration::from_secs(600))
}

/// Entry written two seconds ago: stale under `swr_policy`.
fn aged_entry(key: &CacheKey, body: Value, policy: CachePolicy) -> CachedEntry {
    let mut entry = CachedEntry::new(key.clone(), Arc::new(body), policy);
    entry.fetched_at = Instant::now()
        .checked_sub(Duration::from_secs(2))
        .expect("monotonic clock earlier than two seconds ago");
    entry
}

async fn requests(server: &MockServer) -> usize {
    server.received_requests().await.map(|r| r.len()).unwrap_or(0)
}

#[tokio::test]
async fn cache_hit_avoids_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/widget"))
        .and(header("Accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let (gw, _) = setup(settings());
    let req = ResourceRequest::get_json(format!("{}/widget", server.uri()));
    let cancel = CancellationToken::new();
    let is_valid = non_null_object();

    let first = gw
        .get_resource(gw.key_for(&req), &req, &CachePolicy::long(), &is_valid, &cancel)
        .await
        .unwrap();
    assert_eq!(first.source, FetchSource::Network);

    let second = gw
        .get_resource(gw.key_for(&req), &req, &CachePolicy::long(), &is_valid, &cancel)
        .await
        .unwrap();
    assert_eq!(second.source, FetchSource::Hit);
    assert!(Arc::ptr_eq(&first.body, &second.body));
    assert_eq!(requests(&server).await, 1);
}

#[tokio::test]
async fn invalid_body_is_returned_but_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Value::Null))
        .expect(2)
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());
    let key = gw.key_for(&req);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let fetched = gw
            .get_resource(key.clone(), &req, &CachePolicy::long(), &non_null_object(), &cancel)
            .await
            .unwrap();
        assert_eq!(fetched.source, FetchSource::NotCached(SkipReason::InvalidPayload));
        assert_eq!(*fetched.body, Value::Null);
    }

    assert!(store.get(&key).is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn invalid_body_leaves_previous_entry_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"broken": true})))
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());
    let key = gw.key_for(&req);
    let old = aged_entry(&key, json!({"good": true}), swr_policy());
    let old_fetched_at = old.fetched_at;
    store.set(old);

    let rejects_all: Validator = Arc::new(|_: &Value| false);
    let fetched = gw
        .get_resource(key.clone(), &req, &swr_policy(), &rejects_all, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched.source, FetchSource::NotCached(SkipReason::InvalidPayload));
    assert_eq!(*fetched.body, json!({"broken": true}));

    let kept = store.get(&key).unwrap();
    assert_eq!(*kept.body, json!({"good": true}));
    assert_eq!(kept.fetched_at, old_fetched_at);
}

#[tokio::test]
async fn expired_freshness_triggers_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": "new"})))
        .expect(1)
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());
    let key = gw.key_for(&req);
    store.set(aged_entry(&key, json!({"v": "old"}), swr_policy()));

    let fetched = gw
        .get_resource(
            key.clone(),
            &req,
            &swr_policy(),
            &non_null_object(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(fetched.source, FetchSource::Network);
    assert_eq!(*fetched.body, json!({"v": "new"}));
    assert_eq!(*store.get(&key).unwrap().body, json!({"v": "new"}));
}

#[tokio::test]
async fn failed_refetch_serves_stale_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());
    let key = gw.key_for(&req);
    store.set(aged_entry(&key, json!({"v": "old"}), swr_policy()));

    let fetched = gw
        .get_resource(key, &req, &swr_policy(), &non_null_object(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched.source, FetchSource::Stale);
    assert_eq!(*fetched.body, json!({"v": "old"}));
}

#[tokio::test]
async fn failure_without_stale_window_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());
    let key = gw.key_for(&req);
    let no_stale = CachePolicy::custom(Duration::from_secs(1), Duration::ZERO);
    // Expired under this call's policy, though still inside the window it was written with.
    store.set(aged_entry(&key, json!({"v": "old"}), swr_policy()));

    let err = gw
        .get_resource(key, &req, &no_stale, &non_null_object(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::FetchFailure { status: Some(500), .. }));
}

#[tokio::test]
async fn failure_with_empty_cache_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());

    let err = gw
        .get_resource(
            gw.key_for(&req),
            &req,
            &CachePolicy::long(),
            &non_null_object(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::FetchFailure { status: Some(404), .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn non_json_body_is_invalid_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());

    let err = gw
        .get_resource(
            gw.key_for(&req),
            &req,
            &CachePolicy::long(),
            &non_null_object(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::InvalidPayload { .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn distinct_resources_do_not_share_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "b"})))
        .expect(1)
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let cancel = CancellationToken::new();
    let is_valid = non_null_object();

    for _ in 0..3 {
        for id in ["a", "b"] {
            let req = ResourceRequest::get_json(format!("{}/{id}", server.uri()));
            let fetched = gw
                .get_resource(gw.key_for(&req), &req, &CachePolicy::long(), &is_valid, &cancel)
                .await
                .unwrap();
            assert_eq!(fetched.body["id"], id);
        }
    }

    assert_eq!(store.len(), 2);
    assert_eq!(requests(&server).await, 2);
}

#[tokio::test]
async fn no_store_policy_bypasses_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
        .expect(2)
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());

    for _ in 0..2 {
        let fetched = gw
            .get_resource(
                gw.key_for(&req),
                &req,
                &CachePolicy::none(),
                &non_null_object(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.source, FetchSource::NotCached(SkipReason::NoStore));
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn oversized_body_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"padding": "x".repeat(64)})),
        )
        .mount(&server)
        .await;

    let (gw, store) = setup(GatewaySettings {
        max_body_size: 16,
        ..settings()
    });
    let req = ResourceRequest::get_json(server.uri());

    let fetched = gw
        .get_resource(
            gw.key_for(&req),
            &req,
            &CachePolicy::long(),
            &non_null_object(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(fetched.source, FetchSource::NotCached(SkipReason::TooLarge));
    assert!(store.is_empty());
}

#[tokio::test]
async fn cancellation_aborts_fetch_without_writing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"v": 1}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = gw
        .get_resource(gw.key_for(&req), &req, &CachePolicy::long(), &non_null_object(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(store.is_empty());
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"v": 1}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let (gw, _) = setup(GatewaySettings {
        timeout: Duration::from_millis(100),
        ..settings()
    });
    let req = ResourceRequest::get_json(server.uri());

    let err = gw
        .get_resource(
            gw.key_for(&req),
            &req,
            &CachePolicy::long(),
            &non_null_object(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        GatewayError::FetchFailure { status, reason, .. } => {
            assert_eq!(status, None);
            assert!(reason.contains("timed out"), "unexpected reason: {reason}");
        }
        other => panic!("expected FetchFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_misses_share_one_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"v": "shared"}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gw, _) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());

    let mut handles = Vec::new();
    for _ in 0..5 {
        let gw = gw.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move {
            gw.get_resource(
                gw.key_for(&req),
                &req,
                &CachePolicy::long(),
                &non_null_object(),
                &CancellationToken::new(),
            )
            .await
        }));
    }

    for handle in handles {
        let fetched = handle.await.unwrap().unwrap();
        assert_eq!(*fetched.body, json!({"v": "shared"}));
    }
    assert_eq!(requests(&server).await, 1);
}

#[tokio::test]
async fn background_revalidation_serves_stale_then_refreshes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": "new"})))
        .expect(1)
        .mount(&server)
        .await;

    let (gw, store) = setup(GatewaySettings {
        background_revalidation: true,
        ..settings()
    });
    let req = ResourceRequest::get_json(server.uri());
    let key = gw.key_for(&req);
    store.set(aged_entry(&key, json!({"v": "old"}), swr_policy()));

    let fetched = gw
        .get_resource(
            key.clone(),
            &req,
            &swr_policy(),
            &non_null_object(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(fetched.source, FetchSource::Stale);
    assert_eq!(*fetched.body, json!({"v": "old"}));

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if store.get(&key).is_some_and(|e| *e.body == json!({"v": "new"})) {
            break;
        }
        assert!(Instant::now() < deadline, "entry was not refreshed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn cancelled_leader_does_not_fail_waiting_callers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"v": 1}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());
    let leader_cancel = CancellationToken::new();

    let leader = {
        let gw = gw.clone();
        let req = req.clone();
        let cancel = leader_cancel.clone();
        tokio::spawn(async move {
            gw.get_resource(
                gw.key_for(&req),
                &req,
                &CachePolicy::long(),
                &non_null_object(),
                &cancel,
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let follower = {
        let gw = gw.clone();
        let req = req.clone();
        tokio::spawn(async move {
            gw.get_resource(
                gw.key_for(&req),
                &req,
                &CachePolicy::long(),
                &non_null_object(),
                &CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader_cancel.cancel();

    assert_eq!(leader.await.unwrap().unwrap_err(), GatewayError::Cancelled);
    let fetched = follower.await.unwrap().unwrap();
    assert_eq!(*fetched.body, json!({"v": 1}));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn joined_caller_applies_its_own_validity_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"x": 1}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());

    let lenient = {
        let gw = gw.clone();
        let req = req.clone();
        tokio::spawn(async move {
            gw.get_resource(
                gw.key_for(&req),
                &req,
                &CachePolicy::long(),
                &non_null_object(),
                &CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let strict_calls = Arc::new(AtomicUsize::new(0));
    let strict: Validator = {
        let calls = Arc::clone(&strict_calls);
        Arc::new(move |body: &Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            body.pointer("/data/widget/reviews").is_some_and(Value::is_array)
        })
    };
    let joined = gw
        .get_resource(
            gw.key_for(&req),
            &req,
            &CachePolicy::long(),
            &strict,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(joined.source, FetchSource::NotCached(SkipReason::InvalidPayload));
    assert_eq!(*joined.body, json!({"x": 1}));
    assert_eq!(strict_calls.load(Ordering::SeqCst), 1);

    let led = lenient.await.unwrap().unwrap();
    assert_eq!(led.source, FetchSource::Network);
    assert_eq!(store.len(), 1);
    assert_eq!(requests(&server).await, 1);
}

#[tokio::test]
async fn joined_caller_stores_body_the_leader_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"x": 1}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gw, store) = setup(settings());
    let req = ResourceRequest::get_json(server.uri());

    let rejecting = {
        let gw = gw.clone();
        let req = req.clone();
        tokio::spawn(async move {
            let rejects_all: Validator = Arc::new(|_: &Value| false);
            gw.get_resource(
                gw.key_for(&req),
                &req,
                &CachePolicy::long(),
                &rejects_all,
                &CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let joined = gw
        .get_resource(
            gw.key_for(&req),
            &req,
            &CachePolicy::long(),
            &non_null_object(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(joined.source, FetchSource::Network);

    let led = rejecting.await.unwrap().unwrap();
    assert_eq!(led.source, FetchSource::NotCached(SkipReason::InvalidPayload));
    assert_eq!(*store.get(&gw.key_for(&req)).unwrap().body, json!({"x": 1}));
}
