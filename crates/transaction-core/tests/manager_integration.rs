//! End-to-end exercises of the transaction manager: routing, registry
//! uniqueness, loop detection and the stray paths, all over the mock
//! transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use sipflow_sip_core::prelude::*;
use sipflow_sip_transport::mock::MockTransport;
use sipflow_sip_transport::Destination;
use sipflow_transaction_core::prelude::*;
use sipflow_transaction_core::Error;

/// Installs the test subscriber once; `RUST_LOG` controls verbosity when
/// chasing a failure.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_timers() -> TimerSettings {
    TimerSettings::scaled_for_test(Duration::from_millis(10))
}

fn peer() -> Destination {
    Destination::udp("127.0.0.1:5070".parse().unwrap())
}

fn invite(branch: &str) -> Request {
    RequestBuilder::new(Method::Invite, "sip:service@127.0.0.1")
        .unwrap()
        .via("127.0.0.1", Some(5070), "UDP", Some(branch))
        .from(Some("Alice"), "sip:alice@atlanta.example.com", Some("ft-mgr"))
        .unwrap()
        .to(None, "sip:service@127.0.0.1", None)
        .unwrap()
        .call_id("manager-int-test")
        .cseq(1)
        .max_forwards(70)
        .build()
}

fn message_request(branch: &str) -> Request {
    RequestBuilder::new(Method::Message, "sip:service@127.0.0.1")
        .unwrap()
        .via("127.0.0.1", Some(5070), "UDP", Some(branch))
        .from(None, "sip:alice@atlanta.example.com", Some("ft-msg"))
        .unwrap()
        .to(None, "sip:service@127.0.0.1", None)
        .unwrap()
        .call_id("manager-msg-test")
        .cseq(5)
        .body("ping")
        .build()
}

struct Stack {
    manager: Arc<TransactionManager>,
    transport: MockTransport,
    events_rx: mpsc::Receiver<TransactionEvent>,
}

fn stack() -> Stack {
    init_tracing();
    let (transport, transport_rx) = MockTransport::udp();
    let (manager, events_rx) =
        TransactionManager::new(Arc::new(transport.clone()), transport_rx, Some(test_timers()));
    Stack {
        manager,
        transport,
        events_rx,
    }
}

async fn next_event(events_rx: &mut mpsc::Receiver<TransactionEvent>) -> TransactionEvent {
    tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn client_invite_times_out_and_leaves_the_registry() {
    let mut stack = stack();
    let key = stack
        .manager
        .start_client_transaction(invite("z9hG4bK-mgr-1"), peer())
        .await
        .unwrap();
    assert!(stack.manager.list().contains(&key));

    // No response ever arrives: retransmissions, then Timer B.
    let mut timed_out = false;
    let mut terminated = false;
    for _ in 0..200 {
        match next_event(&mut stack.events_rx).await {
            TransactionEvent::TransactionTimeout { key: k } => {
                assert_eq!(k, key);
                timed_out = true;
            }
            TransactionEvent::TransactionTerminated { key: k } => {
                assert_eq!(k, key);
                terminated = true;
                break;
            }
            _ => {}
        }
    }
    assert!(timed_out, "TransactionTimeout not observed");
    assert!(terminated, "TransactionTerminated not observed");

    // Multiple retransmissions happened before the timeout.
    let mut sends = 0;
    while stack.transport.take_sent().is_some() {
        sends += 1;
    }
    assert!(sends >= 3, "expected retransmissions, saw {} sends", sends);

    // The registry no longer contains the key.
    assert!(!stack.manager.list().contains(&key));
}

#[tokio::test]
async fn responses_route_to_the_client_transaction() {
    let mut stack = stack();
    let request = message_request("z9hG4bK-mgr-2");
    let key = stack
        .manager
        .start_client_transaction(request.clone(), peer())
        .await
        .unwrap();

    let ok = ResponseBuilder::from_request(StatusCode::OK, &request).build();
    stack.transport.inject(Message::Response(ok), peer()).await;

    let mut succeeded = false;
    for _ in 0..200 {
        match next_event(&mut stack.events_rx).await {
            TransactionEvent::SuccessResponse { key: k, response } => {
                assert_eq!(k, key);
                assert_eq!(response.status, StatusCode::OK);
                succeeded = true;
                break;
            }
            _ => {}
        }
    }
    assert!(succeeded, "SuccessResponse not observed");
}

#[tokio::test]
async fn duplicate_client_transaction_is_rejected() {
    let stack = stack();
    stack
        .manager
        .start_client_transaction(invite("z9hG4bK-mgr-3"), peer())
        .await
        .unwrap();
    match stack
        .manager
        .start_client_transaction(invite("z9hG4bK-mgr-3"), peer())
        .await
    {
        Err(Error::Duplicate(_)) => {}
        other => panic!("expected Duplicate, got {:?}", other.map(|k| k.to_string())),
    }
}

#[tokio::test]
async fn server_transaction_start_is_idempotent() {
    let stack = stack();
    let request = invite("z9hG4bK-mgr-4");
    let key1 = stack
        .manager
        .start_server_transaction(request.clone(), peer())
        .await
        .unwrap();
    let key2 = stack
        .manager
        .start_server_transaction(request, peer())
        .await
        .unwrap();
    assert_eq!(key1, key2);
    assert_eq!(stack.manager.list().len(), 1);
}

#[tokio::test]
async fn unmatched_request_is_offered_to_the_tu() {
    let mut stack = stack();
    let request = message_request("z9hG4bK-mgr-5");
    stack
        .transport
        .inject(Message::Request(request.clone()), peer())
        .await;

    match next_event(&mut stack.events_rx).await {
        TransactionEvent::NewRequest { request: r, source } => {
            assert_eq!(r.method, Method::Message);
            assert_eq!(source, peer());
        }
        other => panic!("expected NewRequest, got {:?}", other),
    }
}

#[tokio::test]
async fn retransmission_replays_the_stored_response() {
    let mut stack = stack();
    let request = message_request("z9hG4bK-mgr-6");
    let key = stack
        .manager
        .start_server_transaction(request.clone(), peer())
        .await
        .unwrap();

    let ok = ResponseBuilder::from_request(StatusCode::OK, &request)
        .to_tag("mgr-tag")
        .unwrap()
        .build();
    stack.manager.send_response(&key, ok).await.unwrap();
    stack
        .transport
        .wait_for_send(Duration::from_millis(500))
        .await
        .unwrap();
    let (sent, _) = stack.transport.take_sent().unwrap();
    assert_eq!(sent.status(), Some(StatusCode::OK));

    // The same request again routes to the transaction, which replays the
    // final instead of raising a second NewRequest.
    stack
        .transport
        .inject(Message::Request(request), peer())
        .await;
    stack
        .transport
        .wait_for_send(Duration::from_millis(500))
        .await
        .unwrap();
    let (replayed, _) = stack.transport.take_sent().unwrap();
    assert_eq!(replayed.status(), Some(StatusCode::OK));

    let mut saw_second_new_request = false;
    while let Ok(event) = stack.events_rx.try_recv() {
        if matches!(event, TransactionEvent::NewRequest { .. }) {
            saw_second_new_request = true;
        }
    }
    assert!(!saw_second_new_request, "retransmission must not reach the TU");
}

#[tokio::test]
async fn stray_ack_reaches_the_tu() {
    let mut stack = stack();
    let original = invite("z9hG4bK-mgr-7");
    let ok = ResponseBuilder::from_request(StatusCode::OK, &original)
        .to_tag("t-ack")
        .unwrap()
        .build();
    let ack = create_ack_from_invite(&original, &ok).unwrap();

    stack.transport.inject(Message::Request(ack), peer()).await;
    match next_event(&mut stack.events_rx).await {
        TransactionEvent::StrayAck { request, .. } => assert_eq!(request.method, Method::Ack),
        other => panic!("expected StrayAck, got {:?}", other),
    }
}

#[tokio::test]
async fn stray_response_is_reported() {
    let mut stack = stack();
    let request = message_request("z9hG4bK-mgr-8");
    let ok = ResponseBuilder::from_request(StatusCode::OK, &request).build();
    stack.transport.inject(Message::Response(ok), peer()).await;
    match next_event(&mut stack.events_rx).await {
        TransactionEvent::StrayResponse { response } => assert_eq!(response.status, StatusCode::OK),
        other => panic!("expected StrayResponse, got {:?}", other),
    }
}

#[tokio::test]
async fn cancel_names_the_invite_it_targets() {
    let mut stack = stack();
    let original = invite("z9hG4bK-mgr-9");
    let invite_key = stack
        .manager
        .start_server_transaction(original.clone(), peer())
        .await
        .unwrap();

    let cancel = create_cancel(&original).unwrap();
    stack
        .transport
        .inject(Message::Request(cancel), peer())
        .await;

    let mut cancel_seen = false;
    let mut new_request_seen = false;
    for _ in 0..10 {
        match next_event(&mut stack.events_rx).await {
            TransactionEvent::CancelReceived { key, request } => {
                assert_eq!(key, invite_key);
                assert_eq!(request.method, Method::Cancel);
                cancel_seen = true;
            }
            TransactionEvent::NewRequest { request, .. } => {
                assert_eq!(request.method, Method::Cancel);
                new_request_seen = true;
            }
            _ => {}
        }
        if cancel_seen && new_request_seen {
            break;
        }
    }
    assert!(cancel_seen, "CancelReceived not observed");
    assert!(new_request_seen, "NewRequest for the CANCEL not observed");
}

#[tokio::test]
async fn loop_detection_flags_second_branch_only() {
    let stack = stack();
    let first = invite("z9hG4bK-loop-1");
    stack
        .manager
        .start_server_transaction(first.clone(), peer())
        .await
        .unwrap();

    // Same request, same branch: a retransmission, not a loop.
    assert!(!stack.manager.is_loop(&first));

    // Same From-tag/Call-Id/CSeq arriving on a different branch: loop.
    let looped = invite("z9hG4bK-loop-2");
    assert!(stack.manager.is_loop(&looped));

    // A To-tag means an in-dialog request; never flagged.
    let mut in_dialog = invite("z9hG4bK-loop-3");
    in_dialog.set_header(Header::text(
        HeaderName::To,
        "<sip:service@127.0.0.1>;tag=remote-1",
    ));
    assert!(!stack.manager.is_loop(&in_dialog));
}

#[tokio::test]
async fn shutdown_terminates_everything() {
    let stack = stack();
    stack
        .manager
        .start_server_transaction(invite("z9hG4bK-mgr-10"), peer())
        .await
        .unwrap();
    stack
        .manager
        .start_server_transaction(message_request("z9hG4bK-mgr-11"), peer())
        .await
        .unwrap();
    assert_eq!(stack.manager.list().len(), 2);

    stack.manager.shutdown().await;
    for _ in 0..100 {
        if stack.manager.list().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry not empty after shutdown: {:?}", stack.manager.list());
}

#[tokio::test]
async fn distinct_live_transactions_have_distinct_keys() {
    // Pairwise distinct keys across a mixed set of live transactions.
    let stack = stack();
    stack
        .manager
        .start_client_transaction(invite("z9hG4bK-p1-a"), peer())
        .await
        .unwrap();
    stack
        .manager
        .start_client_transaction(message_request("z9hG4bK-p1-b"), peer())
        .await
        .unwrap();
    stack
        .manager
        .start_server_transaction(invite("z9hG4bK-p1-c"), peer())
        .await
        .unwrap();
    stack
        .manager
        .start_server_transaction(message_request("z9hG4bK-p1-d"), peer())
        .await
        .unwrap();

    let keys = stack.manager.list();
    let unique: std::collections::HashSet<_> = keys.iter().collect();
    assert_eq!(keys.len(), unique.len());
}
