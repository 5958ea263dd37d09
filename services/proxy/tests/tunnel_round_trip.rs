//! End-to-end round trips through a real HTTP listener, relay pool, and mock
//! relay: single-part responses, multi-part reassembly, timeouts, and the
//! credential-leak filter on advertised relay URLs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use np_codec::{
    Event, EventTemplate, KIND_GIFT_WRAP, KIND_HTTP_RESPONSE, Keys, Profile, RequestMessage,
    ResponseMessage, WrapParams, unwrap_event, wrap_event,
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
    pending: Arc<PendingTable>,
    proxy_pubkey: String,
}

/// Assemble the full proxy stack (pool, ingress, gateway) on a random port.
async fn spawn_proxy(
    initial_relays: Vec<String>,
    destination: Option<Profile>,
    timeout_ms: u64,
    max_cached_relays: usize,
) -> TestProxy {
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
        pending: pending.clone(),
        keep_host: false,
        timeout: Duration::from_millis(timeout_ms),
        destination,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, gateway::router(state)).await.unwrap();
    });

    TestProxy { base_url: format!("http://{addr}"), pending, proxy_pubkey }
}

/// Open a published gift wrap the way the destination would.
fn open_request(destination: &Keys, wrap: &Value) -> RequestMessage {
    let wrap: Event = serde_json::from_value(wrap.clone()).unwrap();
    assert_eq!(wrap.kind, KIND_GIFT_WRAP);
    let unwrapped = unwrap_event(destination, &wrap).unwrap();
    serde_json::from_str(&unwrapped.inner.content).unwrap()
}

/// Build a destination-signed response wrap ready to inject into a relay.
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

fn text_response(id: &str, part_index: u64, parts: u64, body_base64: &str) -> ResponseMessage {
    let mut msg = ResponseMessage {
        id: id.to_owned(),
        part_index,
        parts,
        body_base64: body_base64.to_owned(),
        status: None,
        headers: None,
    };
    if part_index == 0 {
        msg.status = Some(200);
        msg.headers = Some(HashMap::from([(
            "content-type".to_owned(),
            "text/plain".to_owned(),
        )]));
    }
    msg
}

#[tokio::test]
async fn fixed_destination_get_round_trips_single_part() {
    let relay = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(
        vec![relay.url()],
        Some(Profile { pubkey: destination.public_key_hex().to_owned(), relays: vec![] }),
        30_000,
        10,
    )
    .await;

    let base = proxy.base_url.clone();
    let client = tokio::spawn(async move {
        reqwest::Client::new()
            .get(format!("{base}/x"))
            .header("host", "foo")
            .send()
            .await
            .unwrap()
    });

    let published = relay.wait_for_published(1, WAIT).await;
    let request = open_request(&destination, &published[0]);
    assert_eq!(request.part_index, 0);
    assert_eq!(request.parts, 1);
    assert_eq!(request.body_base64, "");
    assert_eq!(request.method.as_deref(), Some("GET"));
    assert_eq!(request.url.as_deref(), Some("/x"));
    let headers = request.headers.clone().unwrap();
    assert!(!headers.contains_key("host"), "host header must be stripped");

    let reply = text_response(&request.id, 0, 1, "aGk=");
    relay.inject_event(&response_wrap(&destination, &proxy.proxy_pubkey, &reply));

    let response = client.await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "hi");
    assert!(proxy.pending.is_empty());
}

#[tokio::test]
async fn two_part_response_reassembles_out_of_order() {
    let relay = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(
        vec![relay.url()],
        Some(Profile { pubkey: destination.public_key_hex().to_owned(), relays: vec![] }),
        30_000,
        10,
    )
    .await;

    let base = proxy.base_url.clone();
    let client = tokio::spawn(async move {
        reqwest::Client::new().get(base).send().await.unwrap()
    });

    let published = relay.wait_for_published(1, WAIT).await;
    let request = open_request(&destination, &published[0]);

    // "hello world" split mid-stream; index order must win over arrival order.
    let tail = text_response(&request.id, 1, 2, "d29ybGQ=");
    relay.inject_event(&response_wrap(&destination, &proxy.proxy_pubkey, &tail));
    let head = text_response(&request.id, 0, 2, "aGVsbG8g");
    relay.inject_event(&response_wrap(&destination, &proxy.proxy_pubkey, &head));

    let response = client.await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello world");
}

#[tokio::test]
async fn large_request_body_is_segmented_in_index_order() {
    let relay = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(
        vec![relay.url()],
        Some(Profile { pubkey: destination.public_key_hex().to_owned(), relays: vec![] }),
        30_000,
        10,
    )
    .await;

    // 40000 bytes encodes past one 32768-char chunk.
    let body: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let base = proxy.base_url.clone();
    let sent = body.clone();
    let client = tokio::spawn(async move {
        reqwest::Client::new().post(base).body(sent).send().await.unwrap()
    });

    let published = relay.wait_for_published(2, WAIT).await;
    let first = open_request(&destination, &published[0]);
    let second = open_request(&destination, &published[1]);
    assert_eq!((first.part_index, first.parts), (0, 2));
    assert_eq!((second.part_index, second.parts), (1, 2));
    assert_eq!(second.method, None, "head fields belong to part 0 only");
    assert_eq!(first.id, second.id);

    use base64::{Engine as _, engine::general_purpose::STANDARD};
    let reassembled = STANDARD
        .decode(format!("{}{}", first.body_base64, second.body_base64))
        .unwrap();
    assert_eq!(reassembled, body);

    let reply = text_response(&first.id, 0, 1, "");
    relay.inject_event(&response_wrap(&destination, &proxy.proxy_pubkey, &reply));
    assert_eq!(client.await.unwrap().status(), 200);
}

#[tokio::test]
async fn unanswered_request_times_out_and_late_response_is_dropped() {
    let relay = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(
        vec![relay.url()],
        Some(Profile { pubkey: destination.public_key_hex().to_owned(), relays: vec![] }),
        500,
        10,
    )
    .await;

    let response = reqwest::Client::new().get(&proxy.base_url).send().await.unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "Timed out");
    assert!(proxy.pending.is_empty());

    // A response arriving after the timeout must be swallowed silently.
    let published = relay.wait_for_published(1, WAIT).await;
    let request = open_request(&destination, &published[0]);
    let late = text_response(&request.id, 0, 1, "aGk=");
    relay.inject_event(&response_wrap(&destination, &proxy.proxy_pubkey, &late));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(proxy.pending.is_empty());
}

#[tokio::test]
async fn client_disconnect_removes_pending_and_discards_later_parts() {
    let relay = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    let proxy = spawn_proxy(
        vec![relay.url()],
        Some(Profile { pubkey: destination.public_key_hex().to_owned(), relays: vec![] }),
        30_000,
        10,
    )
    .await;

    let client = reqwest::Client::new();
    let request = client.get(&proxy.base_url).send();
    // Give up client-side long before the proxy timeout.
    assert!(tokio::time::timeout(Duration::from_millis(300), request).await.is_err());

    let published = relay.wait_for_published(1, WAIT).await;
    let tunneled = open_request(&destination, &published[0]);

    // The dropped connection must have cleared the pending entry.
    let deadline = tokio::time::Instant::now() + WAIT;
    while !proxy.pending.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "pending entry not cleaned up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let part = text_response(&tunneled.id, 0, 2, "aGk=");
    relay.inject_event(&response_wrap(&destination, &proxy.proxy_pubkey, &part));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(proxy.pending.is_empty());
}

#[tokio::test]
async fn credentialed_relay_is_published_to_but_never_advertised() {
    let relay = MockRelay::start().await.unwrap();
    let destination = Keys::generate();
    // The credentialed URL is unreachable; its publish fails per-relay and
    // must not affect the request.
    let leaky = "wss://user:pw@127.0.0.1:9".to_owned();
    let proxy = spawn_proxy(
        vec![relay.url(), leaky.clone()],
        Some(Profile { pubkey: destination.public_key_hex().to_owned(), relays: vec![] }),
        30_000,
        10,
    )
    .await;

    let base = proxy.base_url.clone();
    let client = tokio::spawn(async move {
        reqwest::Client::new().get(base).send().await.unwrap()
    });

    let published = relay.wait_for_published(1, Duration::from_secs(10)).await;
    let wrap: Event = serde_json::from_value(published[0].clone()).unwrap();
    let flattened: Vec<&String> = wrap.tags.iter().flatten().collect();
    assert!(
        flattened.iter().all(|value| !value.contains("user:pw")),
        "credentialed URL leaked into tags: {flattened:?}"
    );
    let p_tag = wrap.tags.iter().find(|t| t[0] == "p").unwrap();
    assert_eq!(p_tag[2], relay.url(), "the first safe relay goes into the p tag");

    let request = open_request(&destination, &published[0]);
    let reply = text_response(&request.id, 0, 1, "aGk=");
    relay.inject_event(&response_wrap(&destination, &proxy.proxy_pubkey, &reply));
    assert_eq!(client.await.unwrap().status(), 200);
}
