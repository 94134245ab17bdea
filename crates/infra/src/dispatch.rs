//! Outbound dispatch loop.
//!
//! Publishes a batch of products for review, one product at a time:
//!
//! ```text
//! for each product (ascending id):
//!   begin tx
//!     ↓
//!   locking re-read of the row
//!     ↓
//!   publish snapshot ──fail──▶ rollback, count failed
//!     ↓ acked
//!   mark_dispatched + update ──fail──▶ rollback, count failed
//!     ↓
//!   commit ──fail──▶ count failed
//!     ↓
//!   sleep inter-item delay (always)
//! ```
//!
//! A product is only marked `sent` after the broker acknowledged it. The
//! reverse does not hold: a publish followed by a failed update leaves a
//! message on the bus for an unsent product, and the next dispatch sends it
//! again (at-least-once).
//!
//! Items are independent: one failure never aborts the batch, and there are
//! no in-batch retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use catalogflow_core::ProductId;
use catalogflow_events::MessageProducer;
use catalogflow_products::Product;

use crate::product_store::{ProductStore, ProductTransaction, StoreError};
use crate::publisher::{MessagePublisher, PublishError};

pub const DEFAULT_INTER_ITEM_DELAY: Duration = Duration::from_millis(50);

/// Which products a dispatch targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every product not yet sent.
    All,
    /// Exactly these ids (already sent ones included; unknown ids skipped).
    Selected(Vec<ProductId>),
}

impl Selection {
    pub fn mode(&self) -> &'static str {
        match self {
            Selection::All => "all",
            Selection::Selected(_) => "selected",
        }
    }
}

/// Result of one dispatch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// `Selected` with an empty id list; nothing was read or sent.
    NothingSelected,
    /// The selection resolved to no products.
    NothingToSend,
    Completed(DispatchReport),
}

/// Per-batch counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Names of the failed products, in processing order.
    pub failed_names: Vec<String>,
    pub failed_ids: Vec<ProductId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSeverity {
    AllSent,
    Partial,
    NoneSent,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn severity(&self) -> DispatchSeverity {
        match (self.succeeded, self.failed) {
            (_, 0) => DispatchSeverity::AllSent,
            (0, _) => DispatchSeverity::NoneSent,
            _ => DispatchSeverity::Partial,
        }
    }

    /// Message shown to the operator who triggered the batch.
    pub fn summary(&self) -> String {
        match self.severity() {
            DispatchSeverity::AllSent => {
                format!("{} product(s) sent for review.", self.succeeded)
            }
            DispatchSeverity::Partial => format!(
                "{} sent, {} failed: {}",
                self.succeeded,
                self.failed,
                self.failed_names.join(", ")
            ),
            DispatchSeverity::NoneSent => format!(
                "No products were sent. Failed: {}",
                self.failed_names.join(", ")
            ),
        }
    }

    fn record_failure(&mut self, product: &Product) {
        self.failed += 1;
        self.failed_names.push(product.name().to_string());
        self.failed_ids.push(product.id());
    }
}

#[derive(Debug, Error)]
enum ItemError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("product {0} no longer exists")]
    Vanished(ProductId),
}

/// Sequential, transactional publisher of product batches.
#[derive(Debug)]
pub struct OutboundDispatcher<S, P> {
    store: S,
    publisher: Arc<MessagePublisher<P>>,
    inter_item_delay: Duration,
}

impl<S, P> OutboundDispatcher<S, P>
where
    S: ProductStore,
    P: MessageProducer,
{
    pub fn new(store: S, publisher: Arc<MessagePublisher<P>>) -> Self {
        Self {
            store,
            publisher,
            inter_item_delay: DEFAULT_INTER_ITEM_DELAY,
        }
    }

    /// Pause after every item, successful or not.
    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }

    /// Publish the selected products.
    ///
    /// Only a failure to resolve the selection is an `Err`; per-item failures
    /// are counted in the report.
    #[instrument(skip(self, selection), fields(mode = selection.mode()))]
    pub async fn dispatch(&self, selection: Selection) -> Result<DispatchOutcome, StoreError> {
        let products = match &selection {
            Selection::Selected(ids) if ids.is_empty() => {
                info!("dispatch rejected: no products selected");
                return Ok(DispatchOutcome::NothingSelected);
            }
            Selection::Selected(ids) => self.store.find_many(ids).await?,
            Selection::All => self.store.list_unsent().await?,
        };

        if products.is_empty() {
            info!("dispatch rejected: nothing to send");
            return Ok(DispatchOutcome::NothingToSend);
        }

        info!(count = products.len(), "dispatching products");

        let mut report = DispatchReport::default();
        for product in &products {
            info!(product_id = %product.id(), name = %product.name(), "processing product");

            match self.dispatch_one(product.id()).await {
                Ok(()) => {
                    report.succeeded += 1;
                    info!(product_id = %product.id(), name = %product.name(), "product sent");
                }
                Err(err) => {
                    report.record_failure(product);
                    error!(
                        product_id = %product.id(),
                        name = %product.name(),
                        error = %err,
                        "failed to send product"
                    );
                }
            }

            tokio::time::sleep(self.inter_item_delay).await;
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "dispatch finished"
        );
        Ok(DispatchOutcome::Completed(report))
    }

    async fn dispatch_one(&self, id: ProductId) -> Result<(), ItemError> {
        let mut tx = self.store.begin().await?;

        let sent = self.send_within(&mut tx, id).await;
        match sent {
            Ok(()) => Ok(tx.commit().await?),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(product_id = %id, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn send_within(
        &self,
        tx: &mut Box<dyn ProductTransaction>,
        id: ProductId,
    ) -> Result<(), ItemError> {
        let mut product = tx.find_by_id(id).await?.ok_or(ItemError::Vanished(id))?;

        self.publisher.publish_product(&product).await?;

        product.mark_dispatched(Utc::now());
        tx.update(&product).await?;
        Ok(())
    }
}
