//! End-to-end tests for the four procedure shapes against the mock
//! River server.

use std::time::Duration;

use river::codec::{BinaryCodec, CodecAdapter, JsonCodec};
use river::{ClientOptions, ClientTransport, RiverClient, TransportOptions, error_codes};
use river_test_utils::{MockRiverServer, MockServerOptions};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn make_client(url: &str) -> RiverClient {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let transport = ClientTransport::new(
        url,
        CodecAdapter::new(JsonCodec),
        TransportOptions::default(),
    );
    RiverClient::new(transport, ClientOptions::default())
}

/// Test: basic rpc — exactly one ok result carrying the argument back.
#[tokio::test]
async fn basic_rpc_returns_single_result() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let result = timeout(
        WAIT,
        client.rpc("test", "add", serde_json::json!({"n": 3}), None),
    )
    .await
    .expect("rpc timed out");

    assert!(result.ok, "expected ok result, got {result:?}");
    assert_eq!(result.payload["result"], 3);
    client.transport().close();
}

/// Test: rpc works identically over the msgpack codec.
#[tokio::test]
async fn rpc_works_over_binary_codec() {
    let server = MockRiverServer::start_with(MockServerOptions {
        codec: CodecAdapter::new(BinaryCodec),
        ..MockServerOptions::default()
    })
    .await
    .unwrap();
    let transport = ClientTransport::new(
        server.url(),
        CodecAdapter::new(BinaryCodec),
        TransportOptions::default(),
    );
    let client = RiverClient::new(transport, ClientOptions::default());

    let result = timeout(
        WAIT,
        client.rpc("test", "add", serde_json::json!({"n": 11}), None),
    )
    .await
    .expect("rpc timed out");

    assert!(result.ok);
    assert_eq!(result.payload["result"], 11);
    client.transport().close();
}

/// Test: stream procedure with a server-side filter — ignored writes
/// produce no responses, close terminates the readable.
#[tokio::test]
async fn stream_filters_ignored_messages() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let handle = client.stream("test", "echo", serde_json::json!({}), None);
    for (msg, ignore) in [
        ("hello", false),
        ("world", false),
        ("skip", true),
        ("end", false),
    ] {
        handle
            .writable
            .write(serde_json::json!({"msg": msg, "ignore": ignore}))
            .unwrap();
    }
    handle.writable.close();

    let values = timeout(WAIT, handle.readable.collect())
        .await
        .expect("stream timed out")
        .unwrap();
    let responses: Vec<&str> = values
        .iter()
        .map(|v| {
            assert!(v.ok, "unexpected error result: {v:?}");
            v.payload["response"].as_str().unwrap()
        })
        .collect();
    assert_eq!(responses, vec!["hello", "world", "end"]);
    client.transport().close();
}

/// Test: upload cancelled server-side mid-stream — finalize surfaces the
/// CANCEL error and the writable is observed closed.
#[tokio::test]
async fn upload_with_server_cancel() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let handle = client.upload("uploadable", "cancellableAdd", serde_json::json!({}), None);
    handle.writable.write(serde_json::json!({"n": 9})).unwrap();
    handle.writable.write(serde_json::json!({"n": 1})).unwrap();

    let result = timeout(WAIT, handle.finalize())
        .await
        .expect("finalize timed out");
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(error_codes::CANCEL));
    assert!(handle.writable.is_closed());
    client.transport().close();
}

/// Test: upload that stays under the cancel threshold resolves with the
/// running sum on close.
#[tokio::test]
async fn upload_completes_when_closed_before_threshold() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let handle = client.upload("uploadable", "cancellableAdd", serde_json::json!({}), None);
    handle.writable.write(serde_json::json!({"n": 4})).unwrap();
    handle.writable.write(serde_json::json!({"n": 5})).unwrap();
    handle.writable.close();

    let result = timeout(WAIT, handle.finalize())
        .await
        .expect("finalize timed out");
    assert!(result.ok, "expected ok result, got {result:?}");
    assert_eq!(result.payload["result"], 9);
    client.transport().close();
}

/// Test: subscription sees the initial value and the update caused by a
/// later rpc on the same connection.
#[tokio::test]
async fn subscription_receives_updates() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let subscription = client.subscribe("subscribable", "value", serde_json::json!({}), None);
    let initial = timeout(WAIT, subscription.next())
        .await
        .expect("initial value timed out")
        .unwrap();
    assert!(initial.ok);
    let initial_count = initial.payload["result"].as_i64().unwrap();

    let result = timeout(
        WAIT,
        client.rpc("subscribable", "add", serde_json::json!({"n": 1}), None),
    )
    .await
    .expect("rpc timed out");
    assert!(result.ok);

    let updated = timeout(WAIT, subscription.next())
        .await
        .expect("update timed out")
        .unwrap();
    assert!(updated.ok);
    assert_eq!(updated.payload["result"], initial_count + 1);
    client.transport().close();
}

/// Test: unknown procedures come back as INVALID_REQUEST errors routed
/// end-to-end.
#[tokio::test]
async fn unknown_procedure_is_routed_as_invalid_request() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let result = timeout(
        WAIT,
        client.rpc("nope", "missing", serde_json::json!({}), None),
    )
    .await
    .expect("rpc timed out");

    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(error_codes::INVALID_REQUEST));
    client.transport().close();
}
