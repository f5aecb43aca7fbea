//! # Broadcast Dispatcher
//!
//! Single consumer that fans progress events out to a user's devices.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  producers ──► DispatcherHandle::submit ──► try_send                    │
//! │                                              │                          │
//! │                              full / stopped ─┴─► Dropped (never blocks) │
//! │                                              │                          │
//! │                                              ▼                          │
//! │                          ┌─────────────────────────────────┐            │
//! │                          │  bounded mpsc (queue_capacity)  │            │
//! │                          └───────────────┬─────────────────┘            │
//! │                                          ▼                              │
//! │  BroadcastDispatcher::run ──► registry.snapshot(user)                   │
//! │                                          │                              │
//! │                  ┌───────────────────────┼───────────────────────┐      │
//! │                  ▼                       ▼                       ▼      │
//! │              device A                device B                device C   │
//! │              (send)                  (send fails)            (closed)   │
//! │                                          │                       │      │
//! │                                          └──── evict + close ────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sends for one event run concurrently; the next event waits until all of
//! them finish, so each device sees events in submission order.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use folio_core::ProgressEvent;

use crate::error::SyncError;
use crate::protocol::Envelope;
use crate::registry::ConnectionRegistry;

/// Result of a non-blocking submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Dropped,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Producer side of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    events_tx: mpsc::Sender<ProgressEvent>,
}

impl DispatcherHandle {
    /// Queues an event for fan-out. Never blocks.
    pub fn submit(&self, event: ProgressEvent) -> SubmitOutcome {
        match self.events_tx.try_send(event) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(TrySendError::Full(event)) => {
                warn!(
                    user_id = event.user_id,
                    work_id = event.work_id,
                    capacity = self.events_tx.max_capacity(),
                    "Dispatcher queue full, dropping progress event"
                );
                SubmitOutcome::Dropped
            }
            Err(TrySendError::Closed(event)) => {
                debug!(user_id = event.user_id, "Dispatcher stopped, dropping progress event");
                SubmitOutcome::Dropped
            }
        }
    }

    /// Events waiting in the queue.
    pub fn queued(&self) -> usize {
        self.events_tx.max_capacity() - self.events_tx.capacity()
    }

    /// True once the consumer has stopped.
    pub fn is_closed(&self) -> bool {
        self.events_tx.is_closed()
    }
}

/// Consumer side of the dispatcher.
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
    events_rx: mpsc::Receiver<ProgressEvent>,
}

impl BroadcastDispatcher {
    /// Creates the dispatcher and its handle.
    ///
    /// `queue_capacity` must be non-zero (checked by config validation).
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue_capacity: usize,
    ) -> (Self, DispatcherHandle) {
        let (events_tx, events_rx) = mpsc::channel(queue_capacity.max(1));

        (
            BroadcastDispatcher {
                registry,
                events_rx,
            },
            DispatcherHandle { events_tx },
        )
    }

    /// Consumes events in arrival order until cancelled.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Broadcast dispatcher starting");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Broadcast dispatcher shutting down");
                    break;
                }

                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        self.dispatch(event).await;
                    }
                    None => break,
                },
            }
        }

        self.events_rx.close();
        info!("Broadcast dispatcher stopped");
    }

    /// Delivers one event to every live device of its user.
    pub async fn dispatch(&self, event: ProgressEvent) -> DeliveryReport {
        deliver(&self.registry, event).await
    }
}

/// Fans one event out over a registry snapshot, evicting dead devices.
pub async fn deliver(registry: &ConnectionRegistry, event: ProgressEvent) -> DeliveryReport {
    let user_id = event.user_id;
    let devices = registry.snapshot(user_id).await;

    if devices.is_empty() {
        debug!(user_id, work_id = event.work_id, "No live devices, progress event dropped");
        return DeliveryReport::default();
    }

    let sends = devices.into_iter().map(|conn| {
        let envelope = Envelope::Progress(event.clone());
        async move {
            let result = if conn.is_authenticated() {
                conn.send_message(envelope).await
            } else {
                Err(SyncError::ConnectionClosed)
            };
            (conn, result)
        }
    });

    let mut report = DeliveryReport::default();

    for (conn, result) in join_all(sends).await {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(conn_id = %conn.id(), user_id, error = %e, "Delivery failed, evicting device");
                registry.remove(conn.id()).await;
                conn.close().await;
                report.evicted += 1;
            }
        }
    }

    debug!(
        user_id,
        work_id = event.work_id,
        chapter = event.chapter,
        delivered = report.delivered,
        evicted = report.evicted,
        "Progress event dispatched"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::authenticated;
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn next_progress<R: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<R>) -> ProgressEvent {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        match serde_json::from_str::<Envelope>(line.trim_end()).unwrap() {
            Envelope::Progress(event) => event,
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_drops_when_full() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_dispatcher, handle) = BroadcastDispatcher::new(registry, 2);

        assert_eq!(handle.submit(ProgressEvent::new(1, 1, 1, None)), SubmitOutcome::Accepted);
        assert_eq!(handle.submit(ProgressEvent::new(1, 1, 2, None)), SubmitOutcome::Accepted);
        assert_eq!(handle.submit(ProgressEvent::new(1, 1, 3, None)), SubmitOutcome::Dropped);
        assert_eq!(handle.queued(), 2);
    }

    #[tokio::test]
    async fn test_submit_drops_when_stopped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (dispatcher, handle) = BroadcastDispatcher::new(registry, 8);
        drop(dispatcher);

        assert!(handle.is_closed());
        assert_eq!(handle.submit(ProgressEvent::new(1, 1, 1, None)), SubmitOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_deliver_to_every_device() {
        let registry = ConnectionRegistry::new();
        let (a, ca) = authenticated(1, "kobo");
        let (b, cb) = authenticated(1, "phone");
        let (other, _co) = authenticated(2, "ipad");
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();
        registry.add(other).await.unwrap();

        let report = deliver(&registry, ProgressEvent::new(1, 3, 7, Some(70))).await;
        assert_eq!(report, DeliveryReport { delivered: 2, evicted: 0 });

        assert_eq!(next_progress(&mut BufReader::new(ca)).await.chapter, 7);
        assert_eq!(next_progress(&mut BufReader::new(cb)).await.chapter_id, Some(70));
    }

    #[tokio::test]
    async fn test_dead_device_is_evicted_others_still_receive() {
        let registry = ConnectionRegistry::new();
        let (dead, _cd) = authenticated(1, "kobo");
        let (alive, ca) = authenticated(1, "phone");
        registry.add(dead.clone()).await.unwrap();
        registry.add(alive.clone()).await.unwrap();

        dead.close().await;

        let report = deliver(&registry, ProgressEvent::new(1, 3, 7, None)).await;
        assert_eq!(report, DeliveryReport { delivered: 1, evicted: 1 });

        assert!(!registry.contains(dead.id()).await);
        assert!(registry.contains(alive.id()).await);
        assert_eq!(next_progress(&mut BufReader::new(ca)).await.chapter, 7);
    }

    #[tokio::test]
    async fn test_peer_gone_is_evicted() {
        let registry = ConnectionRegistry::new();
        let (conn, client) = authenticated(1, "kobo");
        registry.add(conn.clone()).await.unwrap();
        drop(client);

        let report = deliver(&registry, ProgressEvent::new(1, 3, 7, None)).await;
        assert_eq!(report.evicted, 1);
        assert!(registry.is_empty().await);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_no_devices_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let report = deliver(&registry, ProgressEvent::new(9, 3, 7, None)).await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_run_preserves_order_per_device() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, client) = authenticated(1, "kobo");
        registry.add(conn).await.unwrap();

        let (dispatcher, handle) = BroadcastDispatcher::new(registry, 16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(cancel.clone()));

        for chapter in 1..=5 {
            assert!(handle.submit(ProgressEvent::new(1, 3, chapter, None)).is_accepted());
        }

        let mut reader = BufReader::new(client);
        for chapter in 1..=5 {
            assert_eq!(next_progress(&mut reader).await.chapter, chapter);
        }

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.submit(ProgressEvent::new(1, 3, 6, None)), SubmitOutcome::Dropped);
    }
}
