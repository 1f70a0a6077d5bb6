//! Transaction timers.
//!
//! RFC 3261 Section 17 drives every state machine off a handful of named
//! one-shot timers derived from T1 (RTT estimate, 500 ms), T2
//! (retransmission cap, 4 s) and T4 (network clearance time, 5 s):
//!
//! - Client INVITE: A (retransmit, doubling), B (timeout, 64·T1),
//!   D (linger in Completed).
//! - Client non-INVITE: E (retransmit, doubling to T2), F (timeout),
//!   K (linger, T4).
//! - Server INVITE: G (response retransmit, doubling to T2), H (ACK wait,
//!   64·T1), I (linger in Confirmed, T4), plus the optional provisional
//!   "100" timer from Section 17.2.1.
//! - Server non-INVITE: J (linger in Completed, 64·T1).
//!
//! Timers are plain `tokio::spawn`ed sleeps that post a
//! [`InternalTransactionCommand::Timer`] back into the transaction's
//! mailbox; the per-kind timer-handle structs own the `JoinHandle`s and
//! abort them on state changes.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::transaction::{InternalTransactionCommand, TransactionKey};

/// Timer durations, overridable per transaction (tests shorten them).
#[derive(Debug, Clone)]
pub struct TimerSettings {
    /// T1: RTT estimate and retransmission base (500 ms).
    pub t1: Duration,
    /// T2: retransmission interval cap for non-INVITE requests and INVITE
    /// responses (4 s).
    pub t2: Duration,
    /// T4: maximum time a message stays in the network (5 s).
    pub t4: Duration,
    /// Transaction timeout, 64·T1 (Timers B, F, H, J).
    pub transaction_timeout: Duration,
    /// Timer D: wait for response retransmissions in client INVITE
    /// Completed (at least 32 s over unreliable transports).
    pub wait_time_d: Duration,
    /// Grace before the server INVITE transaction answers 100 Trying on
    /// the TU's behalf (Section 17.2.1 allows 200 ms).
    pub timer_100_interval: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        TimerSettings {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            transaction_timeout: t1 * 64,
            wait_time_d: Duration::from_secs(32),
            timer_100_interval: Duration::from_millis(200),
        }
    }
}

impl TimerSettings {
    /// Uniformly scaled-down settings for tests.
    pub fn scaled_for_test(unit: Duration) -> TimerSettings {
        TimerSettings {
            t1: unit,
            t2: unit * 8,
            t4: unit * 10,
            transaction_timeout: unit * 64,
            wait_time_d: unit * 64,
            timer_100_interval: unit * 4,
        }
    }

    /// Doubles a retransmission interval, capped at T2 (the Timer A/E/G
    /// backoff rule).
    pub fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }
}

/// Spawns a one-shot timer that posts `Timer(name)` into the transaction's
/// mailbox after `interval`.
///
/// The returned handle is owned by the transaction's timer-handle struct;
/// aborting it cancels the timer.
pub fn start_timer(
    key: &TransactionKey,
    name: &'static str,
    interval: Duration,
    cmd_tx: mpsc::Sender<InternalTransactionCommand>,
) -> JoinHandle<()> {
    let key = key.clone();
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        trace!(id = %key, timer = name, ?interval, "Timer fired");
        // A closed mailbox just means the transaction is already gone.
        let _ = cmd_tx.send(InternalTransactionCommand::Timer(name)).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::Method;

    #[test]
    fn defaults_follow_rfc3261() {
        let settings = TimerSettings::default();
        assert_eq!(settings.t1, Duration::from_millis(500));
        assert_eq!(settings.t2, Duration::from_millis(4000));
        assert_eq!(settings.t4, Duration::from_millis(5000));
        assert_eq!(settings.transaction_timeout, Duration::from_millis(32_000));
        assert!(settings.wait_time_d >= Duration::from_secs(32));
    }

    #[test]
    fn backoff_doubles_and_caps_at_t2() {
        let settings = TimerSettings::default();
        let mut interval = settings.t1;
        let mut observed = Vec::new();
        for _ in 0..5 {
            interval = settings.backoff(interval);
            observed.push(interval.as_millis());
        }
        assert_eq!(observed, vec![1000, 2000, 4000, 4000, 4000]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_posts_into_mailbox() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let key = TransactionKey::client("z9hG4bK-timer", Method::Options);
        let _handle = start_timer(&key, "F", Duration::from_millis(100), cmd_tx);
        tokio::time::advance(Duration::from_millis(101)).await;
        match cmd_rx.recv().await {
            Some(InternalTransactionCommand::Timer(name)) => assert_eq!(name, "F"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_timer_never_fires() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let key = TransactionKey::client("z9hG4bK-timer2", Method::Options);
        let handle = start_timer(&key, "A", Duration::from_millis(100), cmd_tx);
        handle.abort();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(cmd_rx.try_recv().is_err());
    }
}
