use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use catalogflow_core::{DomainError, ProductId};
use catalogflow_products::{Product, ProductDetails};

use super::r#trait::{ProductStore, ProductTransaction, StoreError};

type RowLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
struct Shared {
    rows: RwLock<BTreeMap<ProductId, Product>>,
    row_locks: Mutex<HashMap<ProductId, RowLock>>,
    failing_updates: Mutex<HashSet<ProductId>>,
    operations: AtomicUsize,
}

impl Shared {
    fn count_op(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait for exclusive access to one row.
    async fn lock_row(self: &Arc<Self>, id: ProductId) -> Result<RowGuard, StoreError> {
        let lock: RowLock = {
            let mut locks = self.row_locks.lock().map_err(|_| poisoned())?;
            locks.entry(id).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        Ok(RowGuard {
            shared: Arc::clone(self),
            id,
            guard: Some(guard),
        })
    }

    /// Drop the row's lock entry once nobody holds or waits on it.
    fn release_row_lock(&self, id: ProductId) {
        if let Ok(mut locks) = self.row_locks.lock() {
            if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&id);
            }
        }
    }

    fn read(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).cloned())
    }

    fn check_update(&self, product: &Product) -> Result<(), StoreError> {
        let failing = self.failing_updates.lock().map_err(|_| poisoned())?;
        if failing.contains(&product.id()) {
            return Err(StoreError::Storage(format!(
                "injected update failure for product {}",
                product.id()
            )));
        }
        drop(failing);

        let rows = self.rows.read().map_err(|_| poisoned())?;
        if !rows.contains_key(&product.id()) {
            return Err(StoreError::NotFound(product.id()));
        }
        Ok(())
    }

    /// Write workflow columns only; descriptive columns keep the stored value.
    fn write_workflow(&self, product: &Product) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let current = rows
            .get(&product.id())
            .ok_or(StoreError::NotFound(product.id()))?;
        let merged = Product::from_parts(
            current.id(),
            current.details().clone(),
            product.workflow().clone(),
        );
        rows.insert(product.id(), merged);
        Ok(())
    }
}

/// Exclusive hold on one row; releases the lock entry on drop.
struct RowGuard {
    shared: Arc<Shared>,
    id: ProductId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.shared.release_row_lock(self.id);
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

/// In-memory product store.
///
/// Intended for tests/dev. Row locks are real (async mutex per id), so a
/// transaction holding a product blocks other writers of that product until
/// it finishes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProductStore {
    shared: Arc<Shared>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a product the way the CRUD layer would (validated, next id).
    pub fn insert(&self, details: ProductDetails) -> Result<Product, DomainError> {
        details.validate()?;
        let mut rows = self
            .shared
            .rows
            .write()
            .map_err(|_| DomainError::invariant("lock poisoned"))?;
        let next = rows.keys().next_back().map(|id| id.get() + 1).unwrap_or(1);
        let product = Product::new(ProductId::new(next), details);
        rows.insert(product.id(), product.clone());
        Ok(product)
    }

    /// Seed a product verbatim (any workflow state).
    pub fn put(&self, product: Product) {
        if let Ok(mut rows) = self.shared.rows.write() {
            rows.insert(product.id(), product);
        }
    }

    pub fn get(&self, id: ProductId) -> Option<Product> {
        self.shared.read(id).ok().flatten()
    }

    pub fn all(&self) -> Vec<Product> {
        self.shared
            .rows
            .read()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every update of `id` fail until cleared.
    pub fn fail_updates_for(&self, id: ProductId) {
        if let Ok(mut failing) = self.shared.failing_updates.lock() {
            failing.insert(id);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.shared.failing_updates.lock() {
            failing.clear();
        }
    }

    /// Number of store calls made so far (reads, writes, transactions).
    pub fn operation_count(&self) -> usize {
        self.shared.operations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        self.shared.count_op();
        self.shared.read(id)
    }

    async fn find_many(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        self.shared.count_op();
        let wanted: HashSet<ProductId> = ids.iter().copied().collect();
        let rows = self.shared.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .values()
            .filter(|p| wanted.contains(&p.id()))
            .cloned()
            .collect())
    }

    async fn list_unsent(&self) -> Result<Vec<Product>, StoreError> {
        self.shared.count_op();
        let rows = self.shared.rows.read().map_err(|_| poisoned())?;
        Ok(rows.values().filter(|p| p.is_dispatchable()).cloned().collect())
    }

    async fn update(&self, product: &Product) -> Result<(), StoreError> {
        self.shared.count_op();
        self.shared.check_update(product)?;

        let _row = self.shared.lock_row(product.id()).await?;
        self.shared.write_workflow(product)
    }

    async fn begin(&self) -> Result<Box<dyn ProductTransaction>, StoreError> {
        self.shared.count_op();
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            staged: BTreeMap::new(),
            guards: HashMap::new(),
        }))
    }
}

struct InMemoryTransaction {
    shared: Arc<Shared>,
    staged: BTreeMap<ProductId, Product>,
    guards: HashMap<ProductId, RowGuard>,
}

impl InMemoryTransaction {
    async fn lock_row(&mut self, id: ProductId) -> Result<(), StoreError> {
        if self.guards.contains_key(&id) {
            return Ok(());
        }
        let guard = self.shared.lock_row(id).await?;
        self.guards.insert(id, guard);
        Ok(())
    }
}

#[async_trait]
impl ProductTransaction for InMemoryTransaction {
    async fn find_by_id(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        self.shared.count_op();
        self.lock_row(id).await?;
        if let Some(staged) = self.staged.get(&id) {
            return Ok(Some(staged.clone()));
        }
        self.shared.read(id)
    }

    async fn update(&mut self, product: &Product) -> Result<(), StoreError> {
        self.shared.count_op();
        self.shared.check_update(product)?;
        self.lock_row(product.id()).await?;
        self.staged.insert(product.id(), product.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.shared.count_op();
        for product in self.staged.values() {
            self.shared.write_workflow(product)?;
        }
        // Row guards drop here, after the writes.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.shared.count_op();
        Ok(())
    }
}
