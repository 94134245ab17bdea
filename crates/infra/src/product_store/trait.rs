use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use catalogflow_core::ProductId;
use catalogflow_products::Product;

/// Product store operation error.
///
/// Infrastructure failures only; "no such product" on a read is `Ok(None)`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// An update targeted a row that does not exist.
    #[error("product {0} not found")]
    NotFound(ProductId),

    /// Row lock or serialization conflict with a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transaction already finished")]
    TransactionClosed,
}

/// Key-by-id product store with per-item transactions.
///
/// ## Ownership
///
/// The CRUD layer creates and deletes rows and owns the descriptive columns.
/// `update` only persists the workflow columns (`sent`, `sent_at`, `status`,
/// `rejection_reason`, `reviewed_by`, `reviewed_at`, `review_comments`,
/// `updated_at`), so concurrent writers meet at field level.
///
/// ## Transactions
///
/// `begin()` opens a transaction scoped to the caller's unit of work. Reads
/// through the transaction lock the row until `commit` or `rollback`. A
/// transaction dropped without either is rolled back.
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Products among `ids` that exist, in ascending id order. Unknown ids are skipped.
    async fn find_many(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError>;

    /// Every product with `sent = false`, in ascending id order.
    async fn list_unsent(&self) -> Result<Vec<Product>, StoreError>;

    /// Persist the workflow fields of `product` outside any explicit transaction.
    async fn update(&self, product: &Product) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<Box<dyn ProductTransaction>, StoreError>;
}

/// A unit of work on the product store.
#[async_trait]
pub trait ProductTransaction: Send {
    /// Locking read of one product.
    async fn find_by_id(&mut self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Stage the workflow fields of `product`; visible to others after `commit`.
    async fn update(&mut self, product: &Product) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> ProductStore for Arc<S>
where
    S: ProductStore + ?Sized,
{
    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        (**self).find_by_id(id).await
    }

    async fn find_many(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        (**self).find_many(ids).await
    }

    async fn list_unsent(&self) -> Result<Vec<Product>, StoreError> {
        (**self).list_unsent().await
    }

    async fn update(&self, product: &Product) -> Result<(), StoreError> {
        (**self).update(product).await
    }

    async fn begin(&self) -> Result<Box<dyn ProductTransaction>, StoreError> {
        (**self).begin().await
    }
}
