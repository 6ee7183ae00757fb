//! Cancellation paths: client aborts, closed-transport short-circuits,
//! and post-completion abort no-ops.

use std::time::Duration;

use river::codec::{CodecAdapter, JsonCodec};
use river::{
    ClientOptions, ClientTransport, RiverClient, TransportOptions, error_codes, is_stream_cancel,
};
use river_test_utils::MockRiverServer;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn make_client(url: &str) -> RiverClient {
    let transport = ClientTransport::new(
        url,
        CodecAdapter::new(JsonCodec),
        TransportOptions::default(),
    );
    RiverClient::new(transport, ClientOptions::default())
}

/// Wait until the server has recorded an envelope matching the predicate.
async fn wait_for_envelope(
    server: &MockRiverServer,
    predicate: impl Fn(&river::TransportMessage) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if server.received().iter().any(&predicate) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Test: aborting a blocking rpc surfaces a local CANCEL and sends a
/// StreamCancel envelope to the server.
#[tokio::test]
async fn client_abort_cancels_blocking_rpc() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let abort = CancellationToken::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = timeout(
        WAIT,
        client.rpc("cancel", "blockingRpc", serde_json::json!({}), Some(abort)),
    )
    .await
    .expect("rpc timed out");

    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(error_codes::CANCEL));

    let cancel_seen = wait_for_envelope(&server, |msg| is_stream_cancel(msg.control_flags)).await;
    assert!(cancel_seen, "server never received a StreamCancel envelope");
    client.transport().close();
}

/// Test: rpc on a closed transport completes synchronously with
/// UNEXPECTED_DISCONNECT and never touches the network.
#[tokio::test]
async fn rpc_on_closed_transport_short_circuits() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());
    client.transport().close();

    let result = timeout(
        WAIT,
        client.rpc("test", "add", serde_json::json!({"n": 1}), None),
    )
    .await
    .expect("rpc should complete immediately");

    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(error_codes::UNEXPECTED_DISCONNECT));
    assert_eq!(result.payload["message"], "transport is closed");
    assert_eq!(server.handshake_count(), 0, "no connection should be made");
}

/// Test: an abort fired after the rpc already completed is a no-op — no
/// StreamCancel goes out.
#[tokio::test]
async fn abort_after_completion_is_a_noop() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let abort = CancellationToken::new();
    let result = timeout(
        WAIT,
        client.rpc("test", "add", serde_json::json!({"n": 2}), Some(abort.clone())),
    )
    .await
    .expect("rpc timed out");
    assert!(result.ok);

    abort.cancel();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let cancels = server
        .received()
        .iter()
        .filter(|m| is_stream_cancel(m.control_flags))
        .count();
    assert_eq!(cancels, 0, "completed stream must not emit cancels");
    client.transport().close();
}

/// Test: aborting one stream leaves a concurrent stream on the same
/// session untouched.
#[tokio::test]
async fn abort_is_scoped_to_its_own_stream() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let abort = CancellationToken::new();
    let doomed = client.stream(
        "cancel",
        "blockingRpc",
        serde_json::json!({}),
        Some(abort.clone()),
    );
    let healthy = client.stream("test", "echo", serde_json::json!({}), None);

    abort.cancel();
    let cancelled = timeout(WAIT, doomed.readable.next())
        .await
        .expect("cancel timed out")
        .unwrap();
    assert_eq!(cancelled.error_code(), Some(error_codes::CANCEL));

    healthy
        .writable
        .write(serde_json::json!({"msg": "still alive", "ignore": false}))
        .unwrap();
    let echoed = timeout(WAIT, healthy.readable.next())
        .await
        .expect("echo timed out")
        .unwrap();
    assert!(echoed.ok);
    assert_eq!(echoed.payload["response"], "still alive");
    client.transport().close();
}
