//! Handshake rejection handling: retriable codes retry as a fresh
//! session, fatal codes stop the retry loop, and repeated failures
//! exhaust the connection budget.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use river::codec::{CodecAdapter, JsonCodec};
use river::{
    ClientTransport, EventKind, ProtocolErrorKind, RetryOptions, SessionState, TransportEvent,
    TransportOptions, handshake_codes,
};
use river_test_utils::{HandshakeReject, MockRiverServer, MockServerOptions};

const WAIT: Duration = Duration::from_secs(5);

fn make_transport(url: &str, retry: RetryOptions) -> ClientTransport {
    ClientTransport::new(
        url,
        CodecAdapter::new(JsonCodec),
        TransportOptions {
            retry,
            ..TransportOptions::default()
        },
    )
}

async fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Test: a fatal handshake code emits a protocolError and stops — no
/// further handshakes are attempted.
#[tokio::test]
async fn fatal_handshake_code_stops_retrying() {
    let server = MockRiverServer::start_with(MockServerOptions {
        handshake_reject: Some(HandshakeReject {
            code: handshake_codes::PROTOCOL_VERSION_MISMATCH.to_owned(),
            reason: "server only speaks v3".to_owned(),
            only_once: false,
        }),
        ..MockServerOptions::default()
    })
    .await
    .unwrap();

    let transport = make_transport(&server.url(), RetryOptions::default());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let log = errors.clone();
    transport.add_listener(EventKind::ProtocolError, move |event| {
        if let TransportEvent::ProtocolError(e) = event {
            log.lock().unwrap().push((e.kind, e.code.clone()));
        }
    });

    transport.connect("SERVER");
    assert!(
        wait_until(|| !errors.lock().unwrap().is_empty()).await,
        "no protocolError emitted"
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.handshake_count(), 1, "fatal codes must not retry");

    let recorded = errors.lock().unwrap().clone();
    assert_eq!(recorded[0].0, ProtocolErrorKind::HandshakeFailed);
    assert_eq!(
        recorded[0].1.as_deref(),
        Some(handshake_codes::PROTOCOL_VERSION_MISMATCH)
    );
    assert_eq!(
        transport.session_state("SERVER"),
        Some(SessionState::NoConnection)
    );
    transport.close();
}

/// Test: SESSION_STATE_MISMATCH destroys the session and reconnects as a
/// brand-new one, which then succeeds.
#[tokio::test]
async fn state_mismatch_retries_with_fresh_session() {
    let server = MockRiverServer::start_with(MockServerOptions {
        handshake_reject: Some(HandshakeReject {
            code: handshake_codes::SESSION_STATE_MISMATCH.to_owned(),
            reason: "state lost".to_owned(),
            only_once: true,
        }),
        ..MockServerOptions::default()
    })
    .await
    .unwrap();

    let transport = make_transport(&server.url(), RetryOptions::default());
    let created_sessions = Arc::new(Mutex::new(Vec::new()));
    let log = created_sessions.clone();
    transport.add_listener(EventKind::SessionStatus, move |event| {
        if let TransportEvent::SessionStatus { status, session } = event {
            if *status == river::SessionStatusKind::Created {
                log.lock().unwrap().push(session.id.clone());
            }
        }
    });

    transport.connect("SERVER");
    assert!(
        wait_until(|| transport.session_state("SERVER") == Some(SessionState::Connected)).await,
        "never reconnected after mismatch"
    );

    assert_eq!(server.handshake_count(), 2);
    let created = created_sessions.lock().unwrap().clone();
    assert_eq!(created.len(), 2, "mismatch must create a fresh session");
    assert_ne!(created[0], created[1]);
    assert_eq!(server.session_ids(), vec![created[1].clone()]);
    transport.close();
}

/// Test: with every handshake rejected retriably, the budget drains and
/// conn_retry_exceeded is emitted.
#[tokio::test]
async fn repeated_failures_exhaust_the_retry_budget() {
    let server = MockRiverServer::start_with(MockServerOptions {
        handshake_reject: Some(HandshakeReject {
            code: handshake_codes::SESSION_STATE_MISMATCH.to_owned(),
            reason: "state lost".to_owned(),
            only_once: false,
        }),
        ..MockServerOptions::default()
    })
    .await
    .unwrap();

    // Small, fast budget so the test converges quickly.
    let transport = make_transport(
        &server.url(),
        RetryOptions {
            base_interval_ms: 10,
            max_jitter_ms: 5,
            max_backoff_ms: 100,
            attempt_budget_capacity: 3,
            budget_restore_interval_ms: 10_000,
        },
    );
    let exceeded = Arc::new(Mutex::new(0usize));
    let counter = exceeded.clone();
    transport.add_listener(EventKind::ProtocolError, move |event| {
        if let TransportEvent::ProtocolError(e) = event {
            if e.kind == ProtocolErrorKind::ConnRetryExceeded {
                *counter.lock().unwrap() += 1;
            }
        }
    });

    transport.connect("SERVER");
    assert!(
        wait_until(|| *exceeded.lock().unwrap() > 0).await,
        "budget exhaustion never reported"
    );
    assert_eq!(server.handshake_count(), 3, "one handshake per budget unit");
    transport.close();
}
