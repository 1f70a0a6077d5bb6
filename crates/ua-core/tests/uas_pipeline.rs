//! Full-stack UAS pipeline exercises: mock transport → transaction
//! manager → UA layer → a test core, asserting on what actually goes out
//! on the wire.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sipflow_sip_core::prelude::*;
use sipflow_sip_transport::mock::MockTransport;
use sipflow_sip_transport::Destination;
use sipflow_transaction_core::prelude::*;
use sipflow_transaction_core::TransactionManager;
use sipflow_ua_core::prelude::*;

/// How the test core answers INVITEs.
#[derive(Clone, Copy)]
enum InvitePolicy {
    Accept,
    Silent,
}

struct TestCore {
    allow: Vec<Method>,
    supported: Vec<String>,
    invite_policy: InvitePolicy,
    detect_loops: bool,
    last_invite: Mutex<Option<Request>>,
    acks_seen: Mutex<usize>,
    events_seen: Mutex<Vec<String>>,
}

impl TestCore {
    fn new(allow: Vec<Method>, invite_policy: InvitePolicy) -> TestCore {
        TestCore {
            allow,
            supported: Vec::new(),
            invite_policy,
            detect_loops: true,
            last_invite: Mutex::new(None),
            acks_seen: Mutex::new(0),
            events_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UserAgentCore for TestCore {
    fn is_applicable(&self, message: &Message) -> bool {
        message.is_request()
    }

    fn allowed_methods(&self) -> Vec<Method> {
        self.allow.clone()
    }

    fn supported_extensions(&self) -> Vec<String> {
        self.supported.clone()
    }

    fn detect_loops(&self) -> bool {
        self.detect_loops
    }

    fn server_header(&self) -> Option<String> {
        Some("sipflow-test/0.1".to_string())
    }

    async fn on_request(&self, _ctx: &CoreContext, request: &Request) -> CoreAction {
        match request.method {
            Method::Invite => {
                *self.last_invite.lock().unwrap() = Some(request.clone());
                match self.invite_policy {
                    InvitePolicy::Accept => {
                        CoreAction::Reply(create_response(request, StatusCode::OK))
                    }
                    InvitePolicy::Silent => CoreAction::Noreply,
                }
            }
            Method::Ack => {
                *self.acks_seen.lock().unwrap() += 1;
                CoreAction::Noreply
            }
            Method::Cancel => {
                // 487 the INVITE this CANCEL targets.
                let invite = self.last_invite.lock().unwrap().clone();
                match invite {
                    Some(invite) => CoreAction::Reply(create_response(
                        &invite,
                        StatusCode::REQUEST_TERMINATED,
                    )),
                    None => CoreAction::Noreply,
                }
            }
            _ => CoreAction::Reply(create_response(request, StatusCode::OK)),
        }
    }

    async fn on_transaction_event(&self, event: &TransactionEvent) {
        let label = match event {
            TransactionEvent::ProvisionalResponse { .. } => "provisional",
            TransactionEvent::SuccessResponse { .. } => "success",
            TransactionEvent::FailureResponse { .. } => "failure",
            TransactionEvent::TransactionTimeout { .. } => "timeout",
            TransactionEvent::TransportError { .. } => "transport-error",
            TransactionEvent::TransactionTerminated { .. } => "terminated",
            _ => "other",
        };
        self.events_seen.lock().unwrap().push(label.to_string());
    }
}

struct Stack {
    transport: MockTransport,
    layer: Arc<UserAgentLayer>,
}

/// Installs the test subscriber once; `RUST_LOG` controls verbosity when
/// chasing a failure.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn stack(core: TestCore) -> Stack {
    init_tracing();
    let (transport, transport_rx) = MockTransport::udp();
    let timers = TimerSettings::scaled_for_test(Duration::from_millis(10));
    let (manager, events_rx) =
        TransactionManager::new(Arc::new(transport.clone()), transport_rx, Some(timers));
    let layer = UserAgentLayer::new(manager);
    layer.registry().register(Arc::new(core));
    layer.spawn(events_rx);
    Stack { transport, layer }
}

fn peer() -> Destination {
    Destination::udp("127.0.0.1:5070".parse().unwrap())
}

fn invite(branch: &str) -> Request {
    RequestBuilder::new(Method::Invite, "sip:service@127.0.0.1")
        .unwrap()
        .via("127.0.0.1", Some(5070), "UDP", Some(branch))
        .from(Some("Alice"), "sip:alice@atlanta.example.com", Some("ft-uas"))
        .unwrap()
        .to(None, "sip:service@127.0.0.1", None)
        .unwrap()
        .call_id("uas-pipeline-test")
        .cseq(1)
        .max_forwards(70)
        .build()
}

fn request(method: Method, branch: &str) -> Request {
    RequestBuilder::new(method, "sip:service@127.0.0.1")
        .unwrap()
        .via("127.0.0.1", Some(5070), "UDP", Some(branch))
        .from(None, "sip:alice@atlanta.example.com", Some("ft-uas2"))
        .unwrap()
        .to(None, "sip:service@127.0.0.1", None)
        .unwrap()
        .call_id("uas-pipeline-test-2")
        .cseq(2)
        .build()
}

/// Waits until a sent response satisfies `pred`, returning it.
async fn wait_for_response(
    transport: &MockTransport,
    mut pred: impl FnMut(&Response) -> bool,
) -> Response {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        while let Some((message, _)) = transport.take_sent() {
            if let Message::Response(response) = message {
                if pred(&response) {
                    return response;
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a matching response"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn message_outside_allow_set_draws_405_with_allow() {
    // A method outside the allow set is rejected up front.
    let stack = stack(TestCore::new(
        vec![Method::Invite, Method::Options],
        InvitePolicy::Accept,
    ));
    stack
        .transport
        .inject(Message::Request(request(Method::Message, "z9hG4bK-uas-1")), peer())
        .await;

    let response =
        wait_for_response(&stack.transport, |r| r.status == StatusCode::METHOD_NOT_ALLOWED).await;
    let allow = response
        .header(&HeaderName::Allow)
        .expect("405 must carry Allow");
    assert_eq!(allow.value.as_text(), Some("INVITE, OPTIONS"));
}

#[tokio::test]
async fn unsupported_require_draws_420_with_unsupported() {
    // An unsatisfiable Require draws the extension rejection.
    let stack = stack(TestCore::new(
        vec![Method::Invite, Method::Options],
        InvitePolicy::Accept,
    ));
    let mut options = request(Method::Options, "z9hG4bK-uas-2");
    options.push_header(Header::text(HeaderName::Require, "foo"));
    stack
        .transport
        .inject(Message::Request(options), peer())
        .await;

    let response =
        wait_for_response(&stack.transport, |r| r.status == StatusCode::BAD_EXTENSION).await;
    let unsupported = response
        .header(&HeaderName::Unsupported)
        .expect("420 must carry Unsupported");
    assert_eq!(unsupported.value.as_text(), Some("foo"));
}

#[tokio::test]
async fn accepted_invite_gets_to_tag_record_route_and_advertisements() {
    let stack = stack(TestCore::new(vec![Method::Invite], InvitePolicy::Accept));
    let mut invite = invite("z9hG4bK-uas-3");
    invite.push_header(Header::text(HeaderName::RecordRoute, "<sip:p1.example.com;lr>"));
    invite.push_header(Header::text(HeaderName::RecordRoute, "<sip:p2.example.com;lr>"));
    stack
        .transport
        .inject(Message::Request(invite), peer())
        .await;

    let response = wait_for_response(&stack.transport, |r| r.status == StatusCode::OK).await;

    // To-tag generated for the final response.
    assert!(response.to_address().unwrap().unwrap().tag().is_some());

    // Record-Route copied through in order (dialog-establishing).
    let routes: Vec<_> = response
        .headers_named(&HeaderName::RecordRoute)
        .map(|h| h.value.as_text().unwrap().to_string())
        .collect();
    assert_eq!(routes, vec!["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]);

    // Advertisement headers auto-populated.
    assert_eq!(
        response.header(&HeaderName::Allow).unwrap().value.as_text(),
        Some("INVITE")
    );
    assert_eq!(
        response.header(&HeaderName::Server).unwrap().value.as_text(),
        Some("sipflow-test/0.1")
    );
}

#[tokio::test]
async fn cancel_answers_200_and_487s_the_invite() {
    let stack = stack(TestCore::new(vec![Method::Invite], InvitePolicy::Silent));
    let invite = invite("z9hG4bK-uas-4");
    stack
        .transport
        .inject(Message::Request(invite.clone()), peer())
        .await;

    // Let the INVITE transaction establish (the auto-100 confirms it).
    wait_for_response(&stack.transport, |r| r.status == StatusCode::TRYING).await;

    let cancel = create_cancel(&invite).unwrap();
    stack
        .transport
        .inject(Message::Request(cancel), peer())
        .await;

    let ok = wait_for_response(&stack.transport, |r| r.status == StatusCode::OK).await;
    assert_eq!(ok.cseq().unwrap().unwrap().method, Method::Cancel);

    let terminated =
        wait_for_response(&stack.transport, |r| r.status == StatusCode::REQUEST_TERMINATED).await;
    assert_eq!(terminated.cseq().unwrap().unwrap().method, Method::Invite);
}

#[tokio::test]
async fn cancel_without_a_matching_invite_draws_481() {
    let stack = stack(TestCore::new(vec![Method::Invite], InvitePolicy::Silent));
    let cancel = create_cancel(&invite("z9hG4bK-uas-5")).unwrap();
    stack
        .transport
        .inject(Message::Request(cancel), peer())
        .await;

    let response = wait_for_response(&stack.transport, |r| {
        r.status == StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST
    })
    .await;
    assert_eq!(response.cseq().unwrap().unwrap().method, Method::Cancel);
}

#[tokio::test]
async fn looped_request_draws_482() {
    let stack = stack(TestCore::new(vec![Method::Invite], InvitePolicy::Silent));

    // First arm of the "fork": establishes the transaction and its
    // loop-index entry.
    stack
        .transport
        .inject(Message::Request(invite("z9hG4bK-uas-6a")), peer())
        .await;
    wait_for_response(&stack.transport, |r| r.status == StatusCode::TRYING).await;

    // Same From-tag/Call-Id/CSeq on a new branch: merged request.
    stack
        .transport
        .inject(Message::Request(invite("z9hG4bK-uas-6b")), peer())
        .await;
    wait_for_response(&stack.transport, |r| r.status == StatusCode::LOOP_DETECTED).await;
}

#[tokio::test]
async fn ack_to_2xx_reaches_the_core_without_a_transaction() {
    init_tracing();
    let core = Arc::new(TestCore::new(vec![Method::Invite], InvitePolicy::Accept));
    let (transport, transport_rx) = MockTransport::udp();
    let timers = TimerSettings::scaled_for_test(Duration::from_millis(10));
    let (manager, events_rx) =
        TransactionManager::new(Arc::new(transport.clone()), transport_rx, Some(timers));
    let layer = UserAgentLayer::new(manager);
    layer.registry().register(core.clone() as Arc<dyn UserAgentCore>);
    layer.spawn(events_rx);

    let invite = invite("z9hG4bK-uas-7");
    transport
        .inject(Message::Request(invite.clone()), peer())
        .await;
    let ok = wait_for_response(&transport, |r| r.status == StatusCode::OK).await;

    // The 2xx terminated the server transaction; give the reaper a moment
    // so the ACK takes the stray path and reaches the core.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let ack = create_ack_from_invite(&invite, &ok).unwrap();
    transport.inject(Message::Request(ack), peer()).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if *core.acks_seen.lock().unwrap() > 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "core never saw the ACK"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn uac_responses_flow_back_to_the_core() {
    init_tracing();
    let core = Arc::new(TestCore::new(vec![Method::Options], InvitePolicy::Accept));
    let (transport, transport_rx) = MockTransport::udp();
    let timers = TimerSettings::scaled_for_test(Duration::from_millis(10));
    let (manager, events_rx) =
        TransactionManager::new(Arc::new(transport.clone()), transport_rx, Some(timers));
    let layer = UserAgentLayer::new(manager);
    layer.spawn(events_rx);

    let request = request(Method::Options, "z9hG4bK-uas-8");
    layer
        .start_client_transaction(core.clone() as Arc<dyn UserAgentCore>, request.clone(), peer())
        .await
        .unwrap();

    // The request goes out, then the far end answers.
    transport.wait_for_send(Duration::from_millis(500)).await.unwrap();
    let ok = ResponseBuilder::from_request(StatusCode::OK, &request).build();
    transport.inject(Message::Response(ok), peer()).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if core.events_seen.lock().unwrap().iter().any(|e| e == "success") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "core never observed the 2xx: {:?}",
            core.events_seen.lock().unwrap()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
