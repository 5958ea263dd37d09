//! Hint-relay behavior: opportunistic connections from `nprofile`
//! destinations, wrap tag layout, MRU caching, pinning and eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use np_codec::{
    Event, EventTemplate, KIND_HTTP_RESPONSE, Keys, ResponseMessage, WrapParams, encode_nprofile,
    unwrap_event, wrap_event,
};
use np_test_utils::MockRelay;
use proxy::gateway::{self, GatewayState};
use proxy::ingress::Ingress;
use proxy::pending::PendingTable;
use proxy::pool::RelayPool;
use proxy::relay::AlreadyHaveEvent;
use proxy::windows::{SUBSCRIPTION_LOOKBACK_SECS, Windows, now_unix};
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(5);

struct TestProxy {
    base_url: String,
    pool: Arc<RelayPool>,
    proxy_pubkey: String,
}

/// Header-driven proxy (no fixed destination) over the given initial relays.
async fn spawn_proxy(initial_relays: Vec<String>, max_cached_relays: usize) -> TestProxy {
    let keys = Arc::new(Keys::generate());
    let proxy_pubkey = keys.public_key_hex().to_owned();

    let now = now_unix();
    let windows = Arc::new(Windows::new(now));
    let already_have: AlreadyHaveEvent = {
        let windows = windows.clone();
        Arc::new(move |id: &str| windows.already_have_event(id))
    };
    let (pool, ingest_rx) = RelayPool::connect(
        initial_relays,
        proxy_pubkey.clone(),
        now - SUBSCRIPTION_LOOKBACK_SECS,
        max_cached_relays,
        already_have,
    );
    let pool = Arc::new(pool);
    let pending = Arc::new(PendingTable::new());
    tokio::spawn(Ingress::new(keys.clone(), windows, pending.clone()).run(ingest_rx));

    let state = Arc::new(GatewayState {
        keys,
        pool: pool.clone(),
        pending,
        keep_host: false,
        timeout: Duration::from_secs(30),
        destination: None,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, gateway::router(state)).await.unwrap();
    });

    TestProxy { base_url: format!("http://{addr}"), pool, proxy_pubkey }
}

fn open_request_id(destination: &Keys, wrap: &Value) -> String {
    let wrap: Event = serde_json::from_value(wrap.clone()).unwrap();
    let unwrapped = unwrap_event(destination, &wrap).unwrap();
    let message: serde_json::Map<String, Value> =
        serde_json::from_str(&unwrapped.inner.content).unwrap();
    message["id"].as_str().unwrap().to_owned()
}

fn ok_response(id: &str) -> ResponseMessage {
    ResponseMessage {
        id: id.to_owned(),
        part_index: 0,
        parts: 1,
        body_base64: String::new(),
        status: Some(200),
        headers: Some(HashMap::new()),
    }
}

fn response_wrap(destination: &Keys, proxy_pubkey: &str, message: &ResponseMessage) -> Value {
    let inner = EventTemplate {
        created_at: now_unix(),
        kind: KIND_HTTP_RESPONSE,
        tags: vec![],
        content: serde_json::to_string(message).unwrap(),
    }
    .unsigned(destination.public_key_hex());
    let wrap = wrap_event(
        destination,
        &inner,
        &WrapParams {
            destination_pk: proxy_pubkey,
            primary_relay: None,
            secondary_relays: &[],
            now: now_unix(),
        },
    )
    .unwrap();
    serde_json::to_value(wrap).unwrap()
}

/// Run one nprofile-addressed request against `proxy`, answering it through
/// `answer_via`, and return the wrap observed there.
async fn round_trip_via_hint(
    proxy: &TestProxy,
    destination: &Keys,
    hints: &[String],
    answer_via: &MockRelay,
    expected_published: usize,
) -> Value {
    let nprofile = encode_nprofile(destination.public_key_hex(), hints).unwrap();
    let base = proxy.base_url.clone();
    let client = tokio::spawn(async move {
        reqwest::Client::new()
            .get(base)
            .header("X-Nostr-Destination", nprofile)
            .send()
            .await
            .unwrap()
    });

    let published = answer_via.wait_for_published(expected_published, WAIT).await;
    let wrap = published[expected_published - 1].clone();
    let request_id = open_request_id(destination, &wrap);
    answer_via.inject_event(&response_wrap(destination, &proxy.proxy_pubkey, &ok_response(&request_id)));

    let response = client.await.unwrap();
    assert_eq!(response.status(), 200);
    wrap
}

#[tokio::test]
async fn nprofile_header_opens_hint_relay_and_advertises_both() {
    let initial = MockRelay::start().await.unwrap();
    let hint = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(vec![initial.url()], 10).await;

    let wrap_value =
        round_trip_via_hint(&proxy, &destination, &[hint.url()], &initial, 1).await;

    // The hint relay got its own connection, subscription, and a copy of the
    // publish before the initial relay's copy was answered.
    hint.wait_for_subscriptions(1, WAIT).await;
    hint.wait_for_published(1, WAIT).await;
    assert_eq!(proxy.pool.cached_urls(), vec![hint.url()]);

    let wrap: Event = serde_json::from_value(wrap_value).unwrap();
    let p_tag = wrap.tags.iter().find(|t| t[0] == "p").unwrap();
    assert_eq!(p_tag[1], destination.public_key_hex());
    assert_eq!(p_tag[2], initial.url());
    let relays_tag = wrap.tags.iter().find(|t| t[0] == "relays").unwrap();
    assert_eq!(relays_tag[1..], [hint.url()]);
}

#[tokio::test]
async fn hint_subscription_filter_targets_the_proxy_key() {
    let initial = MockRelay::start().await.unwrap();
    let hint = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(vec![initial.url()], 10).await;

    round_trip_via_hint(&proxy, &destination, &[hint.url()], &initial, 1).await;
    hint.wait_for_subscriptions(1, WAIT).await;

    let filters = hint.subscription_filters();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0]["kinds"], serde_json::json!([21059]));
    assert_eq!(filters[0]["#p"], serde_json::json!([proxy.proxy_pubkey]));
    assert!(filters[0]["since"].is_i64());
}

#[tokio::test]
async fn completed_requests_leave_hints_evictable_oldest_first() {
    let initial_a = MockRelay::start().await.unwrap();
    let initial_b = MockRelay::start().await.unwrap();
    let hint_1 = MockRelay::start().await.unwrap();
    let hint_2 = MockRelay::start().await.unwrap();
    let hint_3 = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(vec![initial_a.url(), initial_b.url()], 2).await;

    round_trip_via_hint(&proxy, &destination, &[hint_1.url()], &initial_a, 1).await;
    round_trip_via_hint(&proxy, &destination, &[hint_2.url()], &initial_a, 2).await;
    round_trip_via_hint(&proxy, &destination, &[hint_3.url()], &initial_a, 3).await;

    let cached = proxy.pool.cached_urls();
    assert!(!cached.contains(&hint_1.url()), "LRU hint must be evicted: {cached:?}");
    assert!(cached.contains(&hint_3.url()));
    assert!(cached.len() <= 2);
}

#[tokio::test]
async fn repeated_hint_reuses_the_cached_connection() {
    let initial = MockRelay::start().await.unwrap();
    let hint = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(vec![initial.url()], 10).await;

    round_trip_via_hint(&proxy, &destination, &[hint.url()], &initial, 1).await;
    round_trip_via_hint(&proxy, &destination, &[hint.url()], &initial, 2).await;

    assert_eq!(hint.connection_count(), 1, "second request must reuse the connection");
    assert_eq!(proxy.pool.cached_urls(), vec![hint.url()]);
}

#[tokio::test]
async fn missing_destination_header_is_a_400() {
    let initial = MockRelay::start().await.unwrap();
    let proxy = spawn_proxy(vec![initial.url()], 10).await;

    let response = reqwest::Client::new().get(&proxy.base_url).send().await.unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "Missing X-Nostr-Destination header");
}
