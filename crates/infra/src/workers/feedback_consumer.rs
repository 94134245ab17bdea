//! Feedback consumer: applies reviewer verdicts to products.
//!
//! One long-running task per process. Each message is decoded, applied to the
//! product inside its own transaction, and then its offset is committed.
//!
//! ## Commit policy
//!
//! The offset is committed after every handled message, whatever the outcome
//! (applied, unknown product, malformed payload, store failure). A verdict
//! whose store write failed is therefore not redelivered; only a crash between
//! read and commit causes redelivery. Applying a verdict is idempotent, so a
//! redelivered message converges to the same product state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use catalogflow_core::ProductId;
use catalogflow_events::{InboundMessage, MessageConsumer};
use catalogflow_products::{ApprovalFeedback, ReviewStatus};

use crate::product_store::{ProductStore, ProductTransaction, StoreError};

/// Feedback consumer configuration.
#[derive(Debug, Clone)]
pub struct FeedbackConsumerConfig {
    /// Name for logging
    pub name: String,
    /// Bound on a single poll; also the back-off after a poll error
    pub poll_timeout: Duration,
}

impl Default for FeedbackConsumerConfig {
    fn default() -> Self {
        Self {
            name: "feedback-consumer".to_string(),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl FeedbackConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

/// What handling one feedback message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Applied {
        product_id: ProductId,
        status: ReviewStatus,
    },
    /// Well-formed feedback for an id the store does not know.
    UnknownProduct(ProductId),
    /// Not JSON, or missing/invalid required fields.
    Malformed,
    StoreFailed(String),
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct FeedbackStats {
    pub processed: u64,
    pub applied: u64,
    pub malformed: u64,
    pub unknown_product: u64,
    pub store_failures: u64,
    pub poll_errors: u64,
    pub commit_failures: u64,
}

impl FeedbackStats {
    fn record(&mut self, outcome: &FeedbackOutcome) {
        self.processed += 1;
        match outcome {
            FeedbackOutcome::Applied { .. } => self.applied += 1,
            FeedbackOutcome::UnknownProduct(_) => self.unknown_product += 1,
            FeedbackOutcome::Malformed => self.malformed += 1,
            FeedbackOutcome::StoreFailed(_) => self.store_failures += 1,
        }
    }
}

type SharedStats = Arc<Mutex<FeedbackStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut FeedbackStats)) {
    let mut guard = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

/// Handle to control a running feedback consumer.
#[derive(Debug)]
pub struct FeedbackConsumerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: SharedStats,
}

impl FeedbackConsumerHandle {
    /// Get current consumer statistics.
    pub fn stats(&self) -> FeedbackStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request a stop and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "feedback consumer task failed");
            }
        }
    }
}

/// Applies reviewer feedback from a consumer-group subscription to the store.
pub struct FeedbackConsumer<C, S> {
    consumer: C,
    store: S,
    config: FeedbackConsumerConfig,
}

impl<C, S> FeedbackConsumer<C, S>
where
    C: MessageConsumer + 'static,
    S: ProductStore + 'static,
{
    pub fn new(consumer: C, store: S) -> Self {
        Self {
            consumer,
            store,
            config: FeedbackConsumerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FeedbackConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the consume loop on the runtime. It runs until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> FeedbackConsumerHandle {
        let stats = SharedStats::default();
        let join = tokio::spawn(self.run(cancel.clone(), Arc::clone(&stats)));

        FeedbackConsumerHandle {
            cancel,
            join: Some(join),
            stats,
        }
    }

    async fn run(mut self, cancel: CancellationToken, stats: SharedStats) {
        let name = self.config.name.clone();
        let poll_timeout = self.config.poll_timeout;
        info!(consumer = %name, "feedback consumer started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.consumer.poll(poll_timeout) => polled,
            };

            match polled {
                Ok(None) => continue,
                Ok(Some(message)) => {
                    let outcome = handle_feedback(&self.store, &message).await;

                    // Committed regardless of outcome.
                    if let Err(err) = self.consumer.commit(&message).await {
                        error!(
                            consumer = %name,
                            offset = %message.offset,
                            error = %err,
                            "failed to commit offset"
                        );
                        update_stats(&stats, |s| s.commit_failures += 1);
                    }
                    update_stats(&stats, |s| s.record(&outcome));
                }
                Err(err) => {
                    error!(consumer = %name, error = %err, "failed to poll feedback");
                    update_stats(&stats, |s| s.poll_errors += 1);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll_timeout) => {}
                    }
                }
            }
        }

        self.consumer.close().await;
        let final_stats = stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        info!(
            consumer = %name,
            processed = final_stats.processed,
            applied = final_stats.applied,
            malformed = final_stats.malformed,
            unknown_product = final_stats.unknown_product,
            store_failures = final_stats.store_failures,
            "feedback consumer stopped"
        );
    }

    /// Decode one message and apply it to its product.
    ///
    /// Never fails: every problem is logged and reported as an outcome so the
    /// caller can commit and move on.
    pub async fn handle_message(&self, message: &InboundMessage) -> FeedbackOutcome {
        handle_feedback(&self.store, message).await
    }
}

#[instrument(skip(store, message), fields(offset = %message.offset))]
async fn handle_feedback<S: ProductStore>(store: &S, message: &InboundMessage) -> FeedbackOutcome {
    let feedback = match ApprovalFeedback::from_slice(&message.payload) {
        Ok(feedback) => feedback,
        Err(err) => {
            error!(error = %err, payload = %message.payload_str(), "malformed feedback");
            return FeedbackOutcome::Malformed;
        }
    };

    let product_id = feedback.product_id;
    match apply_feedback(store, &feedback).await {
        Ok(true) => {
            info!(
                %product_id,
                status = %feedback.status,
                reviewed_by = feedback.reviewed_by.as_deref().unwrap_or(""),
                "feedback applied"
            );
            FeedbackOutcome::Applied {
                product_id,
                status: feedback.status,
            }
        }
        Ok(false) => {
            warn!(%product_id, "feedback for unknown product");
            FeedbackOutcome::UnknownProduct(product_id)
        }
        Err(err) => {
            error!(%product_id, error = %err, "failed to apply feedback");
            FeedbackOutcome::StoreFailed(err.to_string())
        }
    }
}

/// Locking read, apply, write, commit. `Ok(false)` when the product does not exist.
async fn apply_feedback<S: ProductStore>(
    store: &S,
    feedback: &ApprovalFeedback,
) -> Result<bool, StoreError> {
    let mut tx = store.begin().await?;

    let mut product = match tx.find_by_id(feedback.product_id).await {
        Ok(Some(product)) => product,
        Ok(None) => {
            tx.rollback().await?;
            return Ok(false);
        }
        Err(err) => {
            rollback_quietly(tx, feedback.product_id).await;
            return Err(err);
        }
    };

    product.apply_feedback(feedback, Utc::now());
    if let Err(err) = tx.update(&product).await {
        rollback_quietly(tx, feedback.product_id).await;
        return Err(err);
    }
    tx.commit().await?;
    Ok(true)
}

async fn rollback_quietly(tx: Box<dyn ProductTransaction>, id: ProductId) {
    if let Err(err) = tx.rollback().await {
        debug!(product_id = %id, error = %err, "rollback after failed feedback write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogflow_events::{InMemoryBus, InMemoryConsumer};
    use catalogflow_products::{Product, ProductDetails};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use crate::product_store::InMemoryProductStore;

    const TOPIC: &str = "feedback";
    const GROUP: &str = "producer-feedback-group";

    fn store_with_product(id: i32) -> InMemoryProductStore {
        let store = InMemoryProductStore::new();
        let mut product = Product::new(
            ProductId::new(id),
            ProductDetails {
                name: "Laptop Dell XPS 15".to_string(),
                category: "Electronics".to_string(),
                price: Decimal::new(5_000_000, 0),
                description: "Professional laptop".to_string(),
                quantity: 10,
                manufacturer: Some("Dell".to_string()),
                created_at: Utc.with_ymd_and_hms(2025, 11, 30, 9, 0, 0).unwrap(),
            },
        );
        product.mark_dispatched(Utc::now());
        store.put(product);
        store
    }

    fn message(payload: &str) -> InboundMessage {
        InboundMessage {
            topic: TOPIC.to_string(),
            offset: "0".to_string(),
            payload: payload.as_bytes().to_vec(),
            timestamp: None,
        }
    }

    const APPROVED_BY_ALICE: &str = r#"{"productId":7,"status":"Approved","reviewedAt":"2025-12-01T10:00:00Z","reviewedBy":"alice"}"#;

    fn worker(
        bus: &Arc<InMemoryBus>,
        store: &InMemoryProductStore,
    ) -> FeedbackConsumer<InMemoryConsumer, InMemoryProductStore> {
        FeedbackConsumer::new(bus.consumer(TOPIC, GROUP), store.clone()).with_config(
            FeedbackConsumerConfig::default().with_poll_timeout(Duration::from_millis(20)),
        )
    }

    async fn wait_for_processed(handle: &FeedbackConsumerHandle, processed: u64) {
        for _ in 0..300 {
            if handle.stats().processed >= processed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("consumer processed {:?}", handle.stats());
    }

    #[tokio::test]
    async fn approved_feedback_updates_review_fields() {
        let store = store_with_product(7);
        let before = store.get(ProductId::new(7)).unwrap();
        let bus = Arc::new(InMemoryBus::new());

        let outcome = worker(&bus, &store)
            .handle_message(&message(APPROVED_BY_ALICE))
            .await;

        assert_eq!(
            outcome,
            FeedbackOutcome::Applied {
                product_id: ProductId::new(7),
                status: ReviewStatus::Approved
            }
        );
        let after = store.get(ProductId::new(7)).unwrap();
        assert_eq!(after.status(), Some(&ReviewStatus::Approved));
        assert_eq!(after.workflow().reviewed_by.as_deref(), Some("alice"));
        assert_eq!(
            after.workflow().reviewed_at,
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 10, 0, 0).unwrap())
        );
        assert!(after.workflow().updated_at >= before.workflow().updated_at);
        // Dispatch fields and descriptive columns are untouched.
        assert_eq!(after.workflow().sent_at, before.workflow().sent_at);
        assert_eq!(after.details(), before.details());
    }

    #[tokio::test]
    async fn redelivered_feedback_converges() {
        let store = store_with_product(7);
        let bus = Arc::new(InMemoryBus::new());
        let w = worker(&bus, &store);

        w.handle_message(&message(APPROVED_BY_ALICE)).await;
        let once = store.get(ProductId::new(7)).unwrap();
        w.handle_message(&message(APPROVED_BY_ALICE)).await;
        let twice = store.get(ProductId::new(7)).unwrap();

        let without_updated_at = |p: &Product| {
            let mut w = p.workflow().clone();
            w.updated_at = None;
            w
        };
        assert_eq!(without_updated_at(&once), without_updated_at(&twice));
    }

    #[tokio::test]
    async fn rejection_carries_reason_and_comments() {
        let store = store_with_product(7);
        let bus = Arc::new(InMemoryBus::new());

        worker(&bus, &store)
            .handle_message(&message(
                r#"{"productId":7,"status":"Rejected","rejectionReason":"missing certificate","reviewedDate":"2025-12-02T08:30:00Z","comments":"resubmit"}"#,
            ))
            .await;

        let row = store.get(ProductId::new(7)).unwrap();
        assert_eq!(row.status(), Some(&ReviewStatus::Rejected));
        assert_eq!(
            row.workflow().rejection_reason.as_deref(),
            Some("missing certificate")
        );
        assert_eq!(row.workflow().review_comments.as_deref(), Some("resubmit"));
        assert_eq!(row.workflow().reviewed_by, None);
    }

    #[tokio::test]
    async fn unknown_product_leaves_store_untouched() {
        let store = store_with_product(7);
        let before = store.all();
        let bus = Arc::new(InMemoryBus::new());

        let outcome = worker(&bus, &store)
            .handle_message(&message(
                r#"{"productId":99,"status":"Approved","reviewedAt":"2025-12-01T10:00:00Z"}"#,
            ))
            .await;

        assert_eq!(outcome, FeedbackOutcome::UnknownProduct(ProductId::new(99)));
        assert_eq!(store.all(), before);

        let outcome = worker(&bus, &store)
            .handle_message(&message(r#"{"productId":0,"status":"Approved"}"#))
            .await;
        assert_eq!(outcome, FeedbackOutcome::UnknownProduct(ProductId::new(0)));
    }

    #[tokio::test]
    async fn verdicts_without_offset_or_review_time_are_applied() {
        let store = store_with_product(7);
        let bus = Arc::new(InMemoryBus::new());
        bus.append_raw(
            TOPIC,
            r#"{"productId":7,"status":"Approved","reviewedAt":"2025-12-01T10:00:00","reviewedBy":"alice"}"#,
        );

        let handle = worker(&bus, &store).spawn(CancellationToken::new());
        wait_for_processed(&handle, 1).await;
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.malformed, 0);
        assert_eq!(bus.committed_offset(TOPIC, GROUP), Some(1));
        let row = store.get(ProductId::new(7)).unwrap();
        assert_eq!(row.status(), Some(&ReviewStatus::Approved));
        assert_eq!(
            row.workflow().reviewed_at,
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 10, 0, 0).unwrap())
        );

        let outcome = worker(&bus, &store)
            .handle_message(&message(
                r#"{"productId":7,"status":"Rejected","reviewedBy":"bob"}"#,
            ))
            .await;
        assert!(matches!(outcome, FeedbackOutcome::Applied { .. }));
        let row = store.get(ProductId::new(7)).unwrap();
        assert_eq!(row.status(), Some(&ReviewStatus::Rejected));
        assert_eq!(row.workflow().reviewed_at, None);
    }

    #[tokio::test]
    async fn malformed_payloads() {
        let store = store_with_product(7);
        let bus = Arc::new(InMemoryBus::new());
        let w = worker(&bus, &store);

        for payload in [
            "not json",
            r#"{"productId":7}"#,
            r#"{"productId":7,"status":"  ","reviewedAt":"2025-12-01T10:00:00Z"}"#,
            r#"{"productId":7,"status":"Approved","reviewedAt":"yesterday"}"#,
        ] {
            assert_eq!(
                w.handle_message(&message(payload)).await,
                FeedbackOutcome::Malformed,
                "{payload}"
            );
        }
        assert_eq!(store.get(ProductId::new(7)).unwrap().status(), Some(&ReviewStatus::Pending));
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let store = store_with_product(7);
        store.fail_updates_for(ProductId::new(7));
        let bus = Arc::new(InMemoryBus::new());

        let outcome = worker(&bus, &store)
            .handle_message(&message(APPROVED_BY_ALICE))
            .await;

        assert!(matches!(outcome, FeedbackOutcome::StoreFailed(_)));
        assert_eq!(store.get(ProductId::new(7)).unwrap().status(), Some(&ReviewStatus::Pending));
    }

    #[tokio::test]
    async fn loop_commits_every_message() {
        let store = store_with_product(7);
        store.fail_updates_for(ProductId::new(7));
        let bus = Arc::new(InMemoryBus::new());
        bus.append_raw(TOPIC, APPROVED_BY_ALICE);
        bus.append_raw(TOPIC, "garbage");
        bus.append_raw(
            TOPIC,
            r#"{"productId":99,"status":"Approved","reviewedAt":"2025-12-01T10:00:00Z"}"#,
        );

        let handle = worker(&bus, &store).spawn(CancellationToken::new());
        wait_for_processed(&handle, 3).await;

        let stats = handle.stats();
        assert_eq!(stats.store_failures, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unknown_product, 1);
        assert_eq!(bus.committed_offset(TOPIC, GROUP), Some(3));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn poll_errors_do_not_stop_the_loop() {
        let store = store_with_product(7);
        let bus = Arc::new(InMemoryBus::new());
        bus.fail_next_polls(2);
        bus.append_raw(TOPIC, APPROVED_BY_ALICE);

        let handle = worker(&bus, &store).spawn(CancellationToken::new());
        wait_for_processed(&handle, 1).await;

        let stats = handle.stats();
        assert_eq!(stats.poll_errors, 2);
        assert_eq!(stats.applied, 1);
        assert_eq!(
            store.get(ProductId::new(7)).unwrap().status(),
            Some(&ReviewStatus::Approved)
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let store = store_with_product(7);
        let bus = Arc::new(InMemoryBus::new());
        let cancel = CancellationToken::new();

        let handle = worker(&bus, &store).spawn(cancel.clone());
        assert!(!handle.is_finished());

        cancel.cancel();
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_finished());

        // Messages arriving after the stop stay uncommitted for the next run.
        bus.append_raw(TOPIC, APPROVED_BY_ALICE);
        handle.shutdown().await;
        assert_eq!(bus.committed_offset(TOPIC, GROUP), None);
    }
}
