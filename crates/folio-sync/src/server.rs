//! # Sync Server
//!
//! TCP accept loop, per-connection tasks and the [`SyncService`] facade
//! that wires the server, dispatcher and deferred write processor together.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  accept ──► admission slot free? ─────────────────no──► close + log     │
//! │                           │ yes (slot held until the task ends)         │
//! │                           ▼                                             │
//! │                 ┌───────────────────┐                                   │
//! │                 │  AuthGate::run    │──── Rejected ──► closed           │
//! │                 └─────────┬─────────┘                                   │
//! │                           │ Admitted (registered, auth_resp sent)       │
//! │                           ▼                                             │
//! │      ┌──────────────────────────┐   ┌──────────────────────────┐        │
//! │      │  read loop               │   │  heartbeat loop          │        │
//! │      │  heartbeat acks, ignores │   │  every heartbeat_interval│        │
//! │      │  other client messages   │   │                          │        │
//! │      └────────────┬─────────────┘   └────────────┬─────────────┘        │
//! │                   └────── first error ───────────┘                      │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │                     registry.remove + close                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cancelling the root token stops the accept loop and closes every live
//! connection through its child token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use folio_core::{Attributes, ChapterId, OperationKind, ProgressEvent, UserId, WorkId};
use folio_db::Database;

use crate::auth::{AuthGate, GateOutcome, JwtManager};
use crate::config::{ServerSettings, SyncConfig};
use crate::connection::Connection;
use crate::deferred::{DeferredWriteProcessor, DeferredWriteQueue, DrainReport};
use crate::dispatcher::{BroadcastDispatcher, DispatcherHandle, SubmitOutcome};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Envelope, ErrorCode};
use crate::registry::ConnectionRegistry;

// =============================================================================
// Admission Control
// =============================================================================

/// Caps open connections, authenticated or not.
///
/// A slot is taken at accept and released when the connection task drops
/// its [`AdmissionSlot`], so sockets idling in the handshake count too.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    slots: Arc<Semaphore>,
    max_connections: usize,
}

/// Held by a connection task for the connection's whole life.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionControl {
    pub fn new(max_connections: usize) -> Self {
        AdmissionControl {
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Takes a slot, or `None` when the server is full.
    pub fn try_admit(&self) -> Option<AdmissionSlot> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionSlot { _permit: permit })
    }

    /// Connections currently holding a slot.
    pub fn live(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

// =============================================================================
// Server
// =============================================================================

/// Accepts device connections and hands them to the auth gate.
pub struct SyncServer {
    listener: TcpListener,
    settings: ServerSettings,
    admission: AdmissionControl,
    gate: Arc<AuthGate>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
}

impl SyncServer {
    /// Binds the listener. Port 0 picks a free port.
    pub async fn bind(
        settings: ServerSettings,
        gate: Arc<AuthGate>,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> SyncResult<Self> {
        let addr = settings.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        Ok(SyncServer {
            listener,
            admission: AdmissionControl::new(settings.max_connections),
            settings,
            gate,
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared view of the connection cap.
    pub fn admission(&self) -> AdmissionControl {
        self.admission.clone()
    }

    /// Runs the accept loop until the shutdown token is cancelled.
    ///
    /// This should be spawned as a background task.
    pub async fn run(self) {
        info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            max_connections = self.settings.max_connections,
            "Sync server listening"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Per-connection accept errors (e.g. EMFILE) must not stop the loop.
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(addr = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let conn = Connection::new(
                stream,
                peer.to_string(),
                self.settings.connection_timeouts(),
                self.settings.max_frame_bytes,
                &self.shutdown,
            );

            let Some(slot) = self.admission.try_admit() else {
                warn!(
                    addr = %peer,
                    live = self.admission.live(),
                    max_connections = self.admission.max_connections(),
                    "Connection limit reached, rejecting connection"
                );
                conn.close().await;
                continue;
            };

            debug!(conn_id = %conn.id(), addr = %peer, "Connection accepted");

            tokio::spawn(serve_connection(
                conn,
                slot,
                self.gate.clone(),
                self.registry.clone(),
                self.settings.heartbeat_interval(),
            ));
        }

        info!("Sync server stopped accepting connections");
    }
}

/// Drives one connection from handshake to teardown.
async fn serve_connection(
    conn: Arc<Connection>,
    _slot: AdmissionSlot,
    gate: Arc<AuthGate>,
    registry: Arc<ConnectionRegistry>,
    heartbeat_interval: Duration,
) {
    let identity = match gate.run(&conn).await {
        GateOutcome::Admitted(identity) => identity,
        GateOutcome::Rejected(_) => return,
    };

    let heartbeat = tokio::spawn(heartbeat_loop(conn.clone(), heartbeat_interval));

    let reason = read_loop(&conn).await;

    info!(
        conn_id = %conn.id(),
        user_id = identity.user_id,
        device = %identity.device_name,
        reason = %reason,
        "Device disconnected"
    );

    registry.remove(conn.id()).await;
    conn.close().await;

    if let Err(e) = heartbeat.await {
        debug!(conn_id = %conn.id(), error = %e, "Heartbeat task ended abnormally");
    }
}

/// Reads client messages until the connection fails. Returns the cause.
async fn read_loop(conn: &Arc<Connection>) -> SyncError {
    loop {
        match conn.read_message().await {
            Ok(Envelope::Heartbeat) => {}
            Ok(other) => {
                debug!(
                    conn_id = %conn.id(),
                    kind = other.type_name(),
                    "Ignoring unexpected client message"
                );
            }
            Err(e) if e.is_protocol_error() => {
                warn!(conn_id = %conn.id(), error = %e, "Protocol violation");
                let _ = conn
                    .send_message(Envelope::error(ErrorCode::ProtocolError, e.to_string()))
                    .await;
                return e;
            }
            Err(e) => return e,
        }
    }
}

/// Pings the device until a send fails or the connection closes.
async fn heartbeat_loop(conn: Arc<Connection>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = conn.closed() => return,
            _ = ticker.tick() => {}
        }

        if let Err(e) = conn.send_message(Envelope::Heartbeat).await {
            debug!(conn_id = %conn.id(), error = %e, "Heartbeat failed, closing connection");
            // Wakes the read loop, which evicts.
            conn.close().await;
            return;
        }
    }
}

// =============================================================================
// Service Facade
// =============================================================================

/// Where a published progress event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the dispatcher for immediate fan-out.
    Dispatched,

    /// No live device or the dispatcher dropped it; parked in the deferred queue.
    Deferred(Uuid),
}

/// The running sync subsystem.
///
/// ## Usage
/// ```rust,ignore
/// let service = SyncService::start(config, db).await?;
/// service.publish_progress(user_id, work_id, 12, None).await?;
/// service.shutdown().await;
/// ```
pub struct SyncService {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    admission: AdmissionControl,
    dispatcher: DispatcherHandle,
    processor: Arc<DeferredWriteProcessor>,
    jwt: Arc<JwtManager>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    /// Binds the server and spawns the accept loop, dispatcher and drain task.
    pub async fn start(config: SyncConfig, db: Database) -> SyncResult<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new());

        let (dispatcher, dispatcher_handle) =
            BroadcastDispatcher::new(registry.clone(), config.dispatcher.queue_capacity);

        let queue = Arc::new(DeferredWriteQueue::new());
        let processor = Arc::new(
            DeferredWriteProcessor::new(queue, Arc::new(db.clone()))
                .with_dispatcher(dispatcher_handle.clone()),
        );

        let jwt = Arc::new(
            JwtManager::new(
                config.auth.jwt_secret.clone(),
                config.auth.token_lifetime_secs,
            )
            .with_leeway(config.auth.token_leeway_secs),
        );
        let gate = Arc::new(AuthGate::new(
            jwt.clone(),
            Arc::new(db),
            registry.clone(),
            config.auth.auth_timeout(),
        ));

        let server = SyncServer::bind(
            config.server.clone(),
            gate,
            registry.clone(),
            shutdown.clone(),
        )
        .await?;
        let local_addr = server.local_addr()?;
        let admission = server.admission();

        let tasks = vec![
            tokio::spawn(server.run()),
            tokio::spawn(dispatcher.run(shutdown.clone())),
            tokio::spawn(
                processor
                    .clone()
                    .run(config.deferred.drain_interval(), shutdown.clone()),
            ),
        ];

        info!(
            %local_addr,
            queue_capacity = config.dispatcher.queue_capacity,
            drain_interval_secs = config.deferred.drain_interval_secs,
            "Sync service started"
        );

        Ok(SyncService {
            local_addr,
            registry,
            admission,
            dispatcher: dispatcher_handle,
            processor,
            jwt,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Open connections, including those still in the handshake.
    pub fn live_connections(&self) -> usize {
        self.admission.live()
    }

    /// Token issuer/validator sharing the server's secret.
    pub fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    /// Queues a progress event for fan-out. Never blocks.
    pub fn submit_progress_event(
        &self,
        user_id: UserId,
        work_id: WorkId,
        chapter: i32,
        chapter_id: Option<ChapterId>,
    ) -> SubmitOutcome {
        self.dispatcher
            .submit(ProgressEvent::new(user_id, work_id, chapter, chapter_id))
    }

    /// Appends a write to the deferred queue.
    pub async fn enqueue_deferred_write(
        &self,
        kind: OperationKind,
        user_id: UserId,
        work_id: WorkId,
        attributes: Attributes,
    ) -> Uuid {
        self.processor
            .queue()
            .enqueue(kind, user_id, work_id, attributes)
            .await
    }

    /// Submits a progress event, falling back to the deferred queue.
    ///
    /// With no live device the position is persisted through
    /// `update_progress`; a dropped submit is retried later as
    /// `broadcast_progress`.
    pub async fn publish_progress(
        &self,
        user_id: UserId,
        work_id: WorkId,
        chapter: i32,
        chapter_id: Option<ChapterId>,
    ) -> SyncResult<PublishOutcome> {
        let mut attributes = Attributes::new();
        attributes.insert("chapter_number".into(), chapter.into());
        if let Some(chapter_id) = chapter_id {
            attributes.insert("chapter_id".into(), chapter_id.into());
        }

        let kind = if self.registry.device_count(user_id).await == 0 {
            OperationKind::UpdateProgress
        } else {
            match self.submit_progress_event(user_id, work_id, chapter, chapter_id) {
                SubmitOutcome::Accepted => return Ok(PublishOutcome::Dispatched),
                SubmitOutcome::Dropped => OperationKind::BroadcastProgress,
            }
        };

        if self.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }

        let id = self
            .enqueue_deferred_write(kind, user_id, work_id, attributes)
            .await;
        debug!(user_id, work_id, kind = %kind, op_id = %id, "Progress publish deferred");

        Ok(PublishOutcome::Deferred(id))
    }

    /// Drains the deferred queue now.
    pub async fn drain_deferred_writes(&self) -> DrainReport {
        self.processor.drain_all().await
    }

    /// Writes waiting in the deferred queue.
    pub async fn pending_deferred_writes(&self) -> usize {
        self.processor.queue().len().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels the root token and waits for the background tasks.
    ///
    /// The drain task performs one last drain before it exits.
    pub async fn shutdown(&self) {
        info!("Sync service shutting down");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Sync task panicked");
            }
        }

        for conn in self.registry.drain().await {
            conn.close().await;
        }

        info!("Sync service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::authenticated;
    use folio_db::DbConfig;

    async fn service() -> SyncService {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut config = SyncConfig::default();
        config.auth.jwt_secret = "test-secret".into();
        config.server.bind_addr = "127.0.0.1".into();
        config.server.port = 0;
        SyncService::start(config, db).await.unwrap()
    }

    #[test]
    fn test_admission_slots_release_on_drop() {
        let admission = AdmissionControl::new(2);

        let first = admission.try_admit().unwrap();
        let second = admission.try_admit().unwrap();
        assert_eq!(admission.live(), 2);
        assert!(admission.try_admit().is_none());

        drop(first);
        assert_eq!(admission.live(), 1);
        let third = admission.try_admit().unwrap();
        assert!(admission.try_admit().is_none());

        drop(second);
        drop(third);
        assert_eq!(admission.live(), 0);
    }

    #[tokio::test]
    async fn test_publish_without_devices_defers_update() {
        let service = service().await;

        let outcome = service.publish_progress(1, 2, 5, Some(50)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Deferred(_)));
        assert_eq!(service.pending_deferred_writes().await, 1);

        let report = service.drain_deferred_writes().await;
        assert_eq!(report, DrainReport { succeeded: 1, failed: 0 });

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_with_device_dispatches() {
        let service = service().await;
        let (conn, _client) = authenticated(1, "kobo");
        service.registry().add(conn).await.unwrap();

        let outcome = service.publish_progress(1, 2, 5, None).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Dispatched);
        assert_eq!(service.pending_deferred_writes().await, 0);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_submits() {
        let service = service().await;
        service.shutdown().await;

        assert!(service.is_shutting_down());
        assert_eq!(
            service.submit_progress_event(1, 2, 3, None),
            SubmitOutcome::Dropped
        );
        assert!(service.registry().is_empty().await);
    }
}
