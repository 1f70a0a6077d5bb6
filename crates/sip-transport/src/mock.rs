//! A channel-backed transport for tests and examples.
//!
//! Sent messages land in an inspectable queue instead of a socket; inbound
//! traffic is injected with [`MockTransport::inject`]. Reliability is
//! configurable so both timer regimes can be exercised.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use sipflow_sip_core::Message;

use crate::error::{Error, Result};
use crate::events::TransportEvent;
use crate::transport::{Destination, Transport, TransportKind};

/// An in-memory transport that records what it is told to send.
#[derive(Debug, Clone)]
pub struct MockTransport {
    local_addr: SocketAddr,
    kind: TransportKind,
    sent: Arc<Mutex<VecDeque<(Message, Destination)>>>,
    sent_notify: Arc<Notify>,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl MockTransport {
    /// Creates a mock bound to `local_addr`, returning the transport and
    /// the inbound event channel a manager would consume.
    pub fn new(local_addr: SocketAddr, kind: TransportKind) -> (MockTransport, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        (
            MockTransport {
                local_addr,
                kind,
                sent: Arc::new(Mutex::new(VecDeque::new())),
                sent_notify: Arc::new(Notify::new()),
                events_tx,
                closed: Arc::new(AtomicBool::new(false)),
                fail_sends: Arc::new(AtomicBool::new(false)),
            },
            events_rx,
        )
    }

    /// A UDP mock on a fixed test address.
    pub fn udp() -> (MockTransport, mpsc::Receiver<TransportEvent>) {
        MockTransport::new("127.0.0.1:5060".parse().unwrap(), TransportKind::Udp)
    }

    /// Injects an inbound message as if it arrived from `source`.
    pub async fn inject(&self, message: Message, source: Destination) {
        let event = TransportEvent::MessageReceived {
            message,
            source,
            destination: Destination {
                addr: self.local_addr,
                kind: self.kind,
            },
        };
        let _ = self.events_tx.send(event).await;
    }

    /// Pops the oldest sent message, if any.
    pub fn take_sent(&self) -> Option<(Message, Destination)> {
        self.sent.lock().unwrap().pop_front()
    }

    /// Number of messages sent so far and not yet taken.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Waits until at least one message has been sent, up to `timeout`.
    pub async fn wait_for_send(&self, timeout: std::time::Duration) -> Result<()> {
        if self.sent_count() > 0 {
            return Ok(());
        }
        tokio::time::timeout(timeout, self.sent_notify.notified())
            .await
            .map_err(|_| Error::SendFailed {
                destination: self.local_addr,
                message: "timed out waiting for a send".to_string(),
            })
    }

    /// Makes every subsequent send fail, for transport-error paths.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(&self, message: Message, destination: Destination) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::SendFailed {
                destination: destination.addr,
                message: "mock transport configured to fail".to_string(),
            });
        }
        self.sent.lock().unwrap().push_back((message, destination));
        self.sent_notify.notify_one();
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Closed).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
