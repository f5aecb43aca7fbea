//! # Deferred Write Queue
//!
//! Fallback buffer for writes that could not be applied (or delivered)
//! directly. Entries are applied once, in FIFO order, by the
//! [`DeferredWriteProcessor`].
//!
//! ## Drain Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  enqueue ──► VecDeque (FIFO) ──► drain_all ──► take every entry         │
//! │                                       │                                 │
//! │                                       ▼                                 │
//! │                         ┌──────────────────────────────┐                │
//! │                         │ per entry, in order:         │                │
//! │                         │  1. validate ids + fields    │                │
//! │                         │  2. idempotency check        │                │
//! │                         │  3. apply (or re-broadcast)  │                │
//! │                         └──────────────┬───────────────┘                │
//! │                                        │                                │
//! │                   ok / no-op ──► succeeded                              │
//! │                   any error  ──► failed (logged, NOT re-queued)         │
//! │                                                                         │
//! │  Periodic task: every drain_interval, drain if non-empty.               │
//! │  On shutdown: one last drain.                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use folio_core::validation::validate_id;
use folio_core::{
    Attributes, NewReview, OperationKind, ProgressEvent, ProgressUpdate, UserId, WorkId,
    WriteOperation,
};
use folio_db::{Database, DbError};

use crate::dispatcher::{DispatcherHandle, SubmitOutcome};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Queue
// =============================================================================

/// Ordered buffer of pending write operations.
#[derive(Debug, Default)]
pub struct DeferredWriteQueue {
    entries: Mutex<VecDeque<WriteOperation>>,
}

impl DeferredWriteQueue {
    pub fn new() -> Self {
        DeferredWriteQueue::default()
    }

    /// Appends an operation and returns its id.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        user_id: UserId,
        work_id: WorkId,
        attributes: Attributes,
    ) -> Uuid {
        self.push(WriteOperation::new(kind, user_id, work_id, attributes))
            .await
    }

    /// Appends an already-built operation.
    pub async fn push(&self, operation: WriteOperation) -> Uuid {
        let id = operation.id;
        let mut entries = self.entries.lock().await;

        debug!(
            op_id = %id,
            kind = %operation.kind,
            user_id = operation.user_id,
            work_id = operation.work_id,
            "Write deferred"
        );
        entries.push_back(operation);

        id
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Removes and returns everything queued right now.
    async fn take_all(&self) -> Vec<WriteOperation> {
        self.entries.lock().await.drain(..).collect()
    }
}

// =============================================================================
// Persistence Contract
// =============================================================================

/// Applies deferred writes. Each method checks idempotency itself and
/// returns `Ok(false)` when the write was already in place.
#[async_trait]
pub trait WriteApplier: Send + Sync {
    async fn add_to_library(&self, user_id: UserId, work_id: WorkId) -> SyncResult<bool>;

    async fn update_progress(
        &self,
        user_id: UserId,
        work_id: WorkId,
        update: ProgressUpdate,
    ) -> SyncResult<bool>;

    async fn create_review(
        &self,
        user_id: UserId,
        work_id: WorkId,
        review: &NewReview,
    ) -> SyncResult<bool>;
}

#[async_trait]
impl WriteApplier for Database {
    async fn add_to_library(&self, user_id: UserId, work_id: WorkId) -> SyncResult<bool> {
        if self.library().exists(user_id, work_id).await? {
            return Ok(false);
        }
        Ok(self.library().add(user_id, work_id).await?)
    }

    async fn update_progress(
        &self,
        user_id: UserId,
        work_id: WorkId,
        update: ProgressUpdate,
    ) -> SyncResult<bool> {
        Ok(self
            .progress()
            .upsert(user_id, work_id, update.chapter_number, update.chapter_id)
            .await?)
    }

    async fn create_review(
        &self,
        user_id: UserId,
        work_id: WorkId,
        review: &NewReview,
    ) -> SyncResult<bool> {
        if self.reviews().exists_for(user_id, work_id).await? {
            return Ok(false);
        }

        match self
            .reviews()
            .create(user_id, work_id, review.rating, &review.content)
            .await
        {
            Ok(_) => Ok(true),
            // Another writer got there between the check and the insert.
            Err(DbError::UniqueViolation { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Processor
// =============================================================================

/// Counts from one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Applied, or already in place.
    pub succeeded: usize,
    /// Rejected by validation or the applier. Discarded.
    pub failed: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Drains a [`DeferredWriteQueue`] through a [`WriteApplier`].
pub struct DeferredWriteProcessor {
    queue: Arc<DeferredWriteQueue>,
    applier: Arc<dyn WriteApplier>,
    dispatcher: Option<DispatcherHandle>,
    drain_lock: Mutex<()>,
}

impl DeferredWriteProcessor {
    pub fn new(queue: Arc<DeferredWriteQueue>, applier: Arc<dyn WriteApplier>) -> Self {
        DeferredWriteProcessor {
            queue,
            applier,
            dispatcher: None,
            drain_lock: Mutex::new(()),
        }
    }

    /// Routes queued `broadcast_progress` entries through the dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: DispatcherHandle) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn queue(&self) -> &Arc<DeferredWriteQueue> {
        &self.queue
    }

    /// Processes every entry queued at the time of the call.
    ///
    /// Drains never overlap. Entries enqueued while a drain runs are left
    /// for the next one.
    pub async fn drain_all(&self) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let batch = self.queue.take_all().await;
        let mut report = DrainReport::default();

        for operation in batch {
            match self.apply(&operation).await {
                Ok(applied) => {
                    debug!(
                        op_id = %operation.id,
                        kind = %operation.kind,
                        applied,
                        "Deferred write processed"
                    );
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(
                        op_id = %operation.id,
                        kind = %operation.kind,
                        user_id = operation.user_id,
                        work_id = operation.work_id,
                        error = %e,
                        "Deferred write failed, discarding"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.attempted() > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                "Deferred write queue drained"
            );
        }

        report
    }

    /// Drains every `interval` while the queue is non-empty.
    ///
    /// On cancellation runs one final drain before returning. This should be
    /// spawned as a background task.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Deferred write processor starting");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if !self.queue.is_empty().await {
                        self.drain_all().await;
                    }
                }
            }
        }

        if !self.queue.is_empty().await {
            info!("Final drain before shutdown");
            self.drain_all().await;
        }

        info!("Deferred write processor stopped");
    }

    /// Applies one operation. `Ok(false)` means it was already in place.
    async fn apply(&self, operation: &WriteOperation) -> SyncResult<bool> {
        validate_id("user_id", operation.user_id).map_err(folio_core::CoreError::from)?;
        validate_id("work_id", operation.work_id).map_err(folio_core::CoreError::from)?;

        let (user_id, work_id) = (operation.user_id, operation.work_id);

        match operation.kind {
            OperationKind::AddToLibrary => self.applier.add_to_library(user_id, work_id).await,

            OperationKind::UpdateProgress => {
                let update = operation.progress_update()?;
                self.applier.update_progress(user_id, work_id, update).await
            }

            OperationKind::CreateReview => {
                let review = operation.new_review()?;
                self.applier.create_review(user_id, work_id, &review).await
            }

            OperationKind::BroadcastProgress => {
                let update = operation.progress_update()?;
                let dispatcher = self.dispatcher.as_ref().ok_or_else(|| {
                    SyncError::Internal("no dispatcher attached for broadcast_progress".into())
                })?;

                let event = ProgressEvent::new(
                    user_id,
                    work_id,
                    update.chapter_number,
                    update.chapter_id,
                );
                match dispatcher.submit(event) {
                    SubmitOutcome::Accepted => Ok(true),
                    SubmitOutcome::Dropped => Err(SyncError::BroadcastDropped { user_id }),
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::BroadcastDispatcher;
    use crate::registry::ConnectionRegistry;
    use folio_db::DbConfig;
    use serde_json::{json, Value};

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn setup() -> (Database, Arc<DeferredWriteQueue>, DeferredWriteProcessor) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = Arc::new(DeferredWriteQueue::new());
        let processor = DeferredWriteProcessor::new(queue.clone(), Arc::new(db.clone()));
        (db, queue, processor)
    }

    #[tokio::test]
    async fn test_duplicate_library_add_applies_once() {
        let (db, queue, processor) = setup().await;

        queue.enqueue(OperationKind::AddToLibrary, 1, 42, Attributes::new()).await;
        queue.enqueue(OperationKind::AddToLibrary, 1, 42, Attributes::new()).await;
        assert_eq!(queue.len().await, 2);

        let report = processor.drain_all().await;
        assert_eq!(report, DrainReport { succeeded: 2, failed: 0 });
        assert!(queue.is_empty().await);
        assert_eq!(db.library().count_for_user(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_rating_fails_only_that_entry() {
        let (db, queue, processor) = setup().await;

        queue
            .enqueue(
                OperationKind::CreateReview,
                3,
                9,
                attrs(json!({ "rating": 11, "content": "A perfectly long review." })),
            )
            .await;
        queue
            .enqueue(
                OperationKind::UpdateProgress,
                3,
                9,
                attrs(json!({ "chapter_number": 4 })),
            )
            .await;

        let report = processor.drain_all().await;
        assert_eq!(report, DrainReport { succeeded: 1, failed: 1 });
        assert!(queue.is_empty().await);
        assert!(!db.reviews().exists_for(3, 9).await.unwrap());
        assert_eq!(db.progress().get(3, 9).await.unwrap().unwrap().chapter_number, 4);
    }

    #[tokio::test]
    async fn test_review_validation_and_idempotency() {
        let (db, queue, processor) = setup().await;

        let review = attrs(json!({ "rating": 7, "content": "Solid middle volume." }));
        queue.enqueue(OperationKind::CreateReview, 3, 9, review.clone()).await;
        queue.enqueue(OperationKind::CreateReview, 3, 9, review).await;
        queue
            .enqueue(
                OperationKind::CreateReview,
                3,
                10,
                attrs(json!({ "rating": 7, "content": "short" })),
            )
            .await;

        let report = processor.drain_all().await;
        assert_eq!(report, DrainReport { succeeded: 2, failed: 1 });
        assert_eq!(db.reviews().count_for_work(9).await.unwrap(), 1);
        assert_eq!(db.reviews().count_for_work(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_validation() {
        let (_db, queue, processor) = setup().await;

        queue
            .enqueue(OperationKind::UpdateProgress, 3, 9, attrs(json!({ "chapter_number": 0 })))
            .await;
        queue.enqueue(OperationKind::UpdateProgress, 3, 9, Attributes::new()).await;
        queue.enqueue(OperationKind::AddToLibrary, 0, 9, Attributes::new()).await;

        let report = processor.drain_all().await;
        assert_eq!(report, DrainReport { succeeded: 0, failed: 3 });
    }

    #[tokio::test]
    async fn test_failed_entries_are_not_requeued() {
        let (_db, queue, processor) = setup().await;

        queue
            .enqueue(OperationKind::UpdateProgress, 3, 9, attrs(json!({ "chapter_number": -1 })))
            .await;

        assert_eq!(processor.drain_all().await.failed, 1);
        assert!(queue.is_empty().await);
        assert_eq!(processor.drain_all().await, DrainReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_progress_resubmits() {
        let (_db, queue, processor) = setup().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (_dispatcher, handle) = BroadcastDispatcher::new(registry, 1);
        let processor = processor.with_dispatcher(handle.clone());

        let progress = attrs(json!({ "chapter_number": 5 }));
        queue.enqueue(OperationKind::BroadcastProgress, 1, 2, progress.clone()).await;
        // Queue capacity is 1, so the second re-submission is dropped.
        queue.enqueue(OperationKind::BroadcastProgress, 1, 2, progress).await;

        let report = processor.drain_all().await;
        assert_eq!(report, DrainReport { succeeded: 1, failed: 1 });
        assert_eq!(handle.queued(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_dispatcher_fails() {
        let (_db, queue, processor) = setup().await;

        queue
            .enqueue(OperationKind::BroadcastProgress, 1, 2, attrs(json!({ "chapter_number": 5 })))
            .await;

        assert_eq!(processor.drain_all().await.failed, 1);
    }

    #[tokio::test]
    async fn test_fifo_order_is_respected() {
        let (db, queue, processor) = setup().await;

        for chapter in [3, 8, 5] {
            queue
                .enqueue(
                    OperationKind::UpdateProgress,
                    1,
                    2,
                    attrs(json!({ "chapter_number": chapter })),
                )
                .await;
        }

        processor.drain_all().await;
        assert_eq!(db.progress().get(1, 2).await.unwrap().unwrap().chapter_number, 5);
    }

    #[tokio::test]
    async fn test_run_performs_final_drain_on_cancel() {
        let (db, queue, processor) = setup().await;
        let processor = Arc::new(processor);
        let cancel = CancellationToken::new();

        // Long interval so only the shutdown drain can pick this up.
        let task = tokio::spawn(processor.clone().run(Duration::from_secs(3600), cancel.clone()));
        tokio::task::yield_now().await;

        queue.enqueue(OperationKind::AddToLibrary, 1, 42, Attributes::new()).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(queue.is_empty().await);
        assert!(db.library().exists(1, 42).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_drains_on_interval() {
        let (db, queue, processor) = setup().await;
        let processor = Arc::new(processor);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(processor.clone().run(Duration::from_millis(50), cancel.clone()));

        queue.enqueue(OperationKind::AddToLibrary, 1, 42, Attributes::new()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(queue.is_empty().await);
        assert!(db.library().exists(1, 42).await.unwrap());

        cancel.cancel();
        task.await.unwrap();
    }
}
