//! Session durability: reconnects resume the same session, offline
//! invocations flush in order, and out-of-order futures force a
//! re-handshake that reconciles state.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use river::codec::{CodecAdapter, JsonCodec};
use river::{
    ClientOptions, ClientTransport, ControlPayload, RiverClient, TransportMessage,
    TransportOptions, control_flags, generate_id,
};
use river_test_utils::MockRiverServer;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

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

/// Test: a server-side connection drop is transparent — the next rpc
/// rides the same session over a fresh connection.
#[tokio::test]
async fn session_survives_connection_drop() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let first = timeout(
        WAIT,
        client.rpc("test", "add", serde_json::json!({"n": 1}), None),
    )
    .await
    .expect("first rpc timed out");
    assert!(first.ok);

    server.drop_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = timeout(
        WAIT,
        client.rpc("test", "add", serde_json::json!({"n": 2}), None),
    )
    .await
    .expect("second rpc timed out");
    assert!(second.ok);
    assert_eq!(second.payload["result"], 2);

    assert_eq!(server.session_ids().len(), 1, "session must be resumed, not replaced");
    assert!(server.handshake_count() >= 2, "a re-handshake must have happened");
    client.transport().close();
}

/// Test: invocations issued before the first connection completes are
/// buffered and flushed in seq order after the handshake.
#[tokio::test]
async fn offline_invocations_flush_in_seq_order() {
    let server = MockRiverServer::start().await.unwrap();
    let client = make_client(&server.url());

    let (a, b, c) = tokio::join!(
        timeout(WAIT, client.rpc("test", "add", serde_json::json!({"n": 1}), None)),
        timeout(WAIT, client.rpc("test", "add", serde_json::json!({"n": 2}), None)),
        timeout(WAIT, client.rpc("test", "add", serde_json::json!({"n": 3}), None)),
    );
    assert!(a.expect("rpc a timed out").ok);
    assert!(b.expect("rpc b timed out").ok);
    assert!(c.expect("rpc c timed out").ok);

    let received = server.received();
    let seqs: Vec<u64> = received.iter().map(|m| m.seq).collect();
    assert_eq!(seqs.first(), Some(&0), "wire seq must start at 0");
    assert!(
        seqs.windows(2).all(|w| w[0] < w[1]),
        "wire seqs must be strictly increasing, got {seqs:?}"
    );
    client.transport().close();
}

async fn accept_and_handshake(
    listener: &TcpListener,
    codec: &CodecAdapter,
) -> (
    tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    TransportMessage,
) {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    let request = loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("handshake read timed out")
            .expect("connection ended")
            .unwrap();
        match frame {
            Message::Text(text) => break codec.decode(text.as_bytes()).unwrap(),
            Message::Binary(bytes) => break codec.decode(bytes.as_ref()).unwrap(),
            _ => {}
        }
    };

    let Some(ControlPayload::HandshakeRequest { session_id, .. }) =
        ControlPayload::from_value(&request.payload)
    else {
        panic!("expected handshake request, got {:?}", request.payload);
    };
    let response = TransportMessage {
        id: generate_id(),
        from: "SERVER".to_owned(),
        to: request.from.clone(),
        seq: 0,
        ack: 0,
        payload: ControlPayload::HandshakeResponse {
            status: river::HandshakeStatus::ok(session_id),
        }
        .to_value(),
        stream_id: request.stream_id.clone(),
        control_flags: 0,
        service_name: None,
        procedure_name: None,
        tracing: None,
    };
    ws.send(Message::Binary(codec.encode(&response).unwrap().into()))
        .await
        .unwrap();
    (ws, request)
}

async fn recv_envelope(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    codec: &CodecAdapter,
) -> TransportMessage {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("read timed out")
            .expect("connection ended")
            .unwrap();
        match frame {
            Message::Text(text) => return codec.decode(text.as_bytes()).unwrap(),
            Message::Binary(bytes) => return codec.decode(bytes.as_ref()).unwrap(),
            _ => {}
        }
    }
}

/// Test: a future seq closes the connection; the client re-handshakes
/// with its ack unadvanced and retransmits the unacked envelope.
#[tokio::test]
async fn future_seq_forces_rehandshake_and_replay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let codec = CodecAdapter::new(JsonCodec);

    let client = make_client(&url);
    let rpc_task = tokio::spawn(async move {
        let result = client
            .rpc("test", "add", serde_json::json!({"n": 5}), None)
            .await;
        client.transport().close();
        result
    });

    // First connection: handshake, swallow the init, then send a future
    // seq the client cannot accept.
    let (mut ws, handshake) = accept_and_handshake(&listener, &codec).await;
    let init = recv_envelope(&mut ws, &codec).await;
    assert_eq!(init.seq, 0);
    assert_eq!(init.service_name.as_deref(), Some("test"));

    let future_msg = TransportMessage {
        id: generate_id(),
        from: "SERVER".to_owned(),
        to: handshake.from.clone(),
        seq: 5,
        ack: 1,
        payload: serde_json::json!({"ok": true, "payload": {"result": 99}}),
        stream_id: init.stream_id.clone(),
        control_flags: control_flags::STREAM_CLOSED_BIT,
        service_name: None,
        procedure_name: None,
        tracing: None,
    };
    ws.send(Message::Binary(codec.encode(&future_msg).unwrap().into()))
        .await
        .unwrap();

    // Second connection: the client reconciles with a fresh handshake —
    // same session, ack still 0, and replays the init envelope.
    let (mut ws2, handshake2) = accept_and_handshake(&listener, &codec).await;
    let Some(ControlPayload::HandshakeRequest {
        session_id: sid1, ..
    }) = ControlPayload::from_value(&handshake.payload)
    else {
        panic!("bad first handshake");
    };
    let Some(ControlPayload::HandshakeRequest {
        session_id: sid2,
        expected_session_state,
        ..
    }) = ControlPayload::from_value(&handshake2.payload)
    else {
        panic!("bad second handshake");
    };
    assert_eq!(sid1, sid2, "same session must be resumed");
    assert_eq!(expected_session_state.next_expected_seq, 0, "ack must not advance past a gap");
    assert_eq!(expected_session_state.next_sent_seq, 0, "init is still unacked");

    let replayed = recv_envelope(&mut ws2, &codec).await;
    assert_eq!(replayed.seq, 0);
    assert_eq!(replayed.payload, init.payload);

    // Answer it so the rpc resolves.
    let reply = TransportMessage {
        id: generate_id(),
        from: "SERVER".to_owned(),
        to: handshake2.from.clone(),
        seq: 0,
        ack: 1,
        payload: serde_json::json!({"ok": true, "payload": {"result": 5}}),
        stream_id: replayed.stream_id.clone(),
        control_flags: control_flags::STREAM_CLOSED_BIT,
        service_name: None,
        procedure_name: None,
        tracing: None,
    };
    ws2.send(Message::Binary(codec.encode(&reply).unwrap().into()))
        .await
        .unwrap();

    let result = timeout(WAIT, rpc_task)
        .await
        .expect("rpc timed out")
        .unwrap();
    assert!(result.ok);
    assert_eq!(result.payload["result"], 5);
}

/// Test: duplicate seqs from a server retransmit are dropped silently —
/// the rpc sees exactly one result.
#[tokio::test]
async fn duplicate_seqs_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let codec = CodecAdapter::new(JsonCodec);

    let transport = ClientTransport::new(
        &url,
        CodecAdapter::new(JsonCodec),
        TransportOptions::default(),
    );
    let client = RiverClient::new(transport, ClientOptions::default());

    let subscription = client.subscribe("subscribable", "value", serde_json::json!({}), None);

    let (mut ws, handshake) = accept_and_handshake(&listener, &codec).await;
    let init = recv_envelope(&mut ws, &codec).await;

    // Send the same seq twice; only one value may surface.
    for _ in 0..2 {
        let push = TransportMessage {
            id: generate_id(),
            from: "SERVER".to_owned(),
            to: handshake.from.clone(),
            seq: 0,
            ack: 1,
            payload: serde_json::json!({"ok": true, "payload": {"result": 7}}),
            stream_id: init.stream_id.clone(),
            control_flags: 0,
            service_name: None,
            procedure_name: None,
            tracing: None,
        };
        ws.send(Message::Binary(codec.encode(&push).unwrap().into()))
            .await
            .unwrap();
    }

    let first = timeout(WAIT, subscription.next())
        .await
        .expect("value timed out")
        .unwrap();
    assert_eq!(first.payload["result"], 7);

    let second = timeout(Duration::from_millis(500), subscription.next()).await;
    assert!(second.is_err(), "duplicate must not surface a second value");
    client.transport().close();
}
