//! Postgres-backed product store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (lock not available) | `55P03` | `Conflict` |
//! | Database (other) | any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |
//!
//! ## Locking
//!
//! Transactional reads use `SELECT ... FOR UPDATE`, so a dispatch holding a
//! product serializes with a feedback write to the same row.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use catalogflow_core::{DomainError, ProductId};
use catalogflow_products::{Product, ProductDetails, ReviewStatus, WorkflowFields};

use super::r#trait::{ProductStore, ProductTransaction, StoreError};

const SELECT_COLUMNS: &str = r#"
    id,
    name,
    category,
    price,
    description,
    quantity,
    manufacturer,
    created_at,
    updated_at,
    sent,
    sent_at,
    status,
    rejection_reason,
    reviewed_by,
    reviewed_at,
    review_comments
"#;

const UPDATE_WORKFLOW: &str = r#"
    UPDATE products SET
        sent = $2,
        sent_at = $3,
        status = $4,
        rejection_reason = $5,
        reviewed_by = $6,
        reviewed_at = $7,
        review_comments = $8,
        updated_at = $9
    WHERE id = $1
"#;

/// Postgres-backed product store.
///
/// Uses the SQLx connection pool (thread-safe, `Send + Sync`). Each
/// `ProductTransaction` owns one pooled connection for its lifetime.
#[derive(Debug, Clone)]
pub struct PostgresProductStore {
    pool: Arc<PgPool>,
}

impl PostgresProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `products` table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id SERIAL PRIMARY KEY,
                name VARCHAR(100) NOT NULL,
                category VARCHAR(50) NOT NULL,
                price NUMERIC NOT NULL,
                description VARCHAR(500) NOT NULL DEFAULT '',
                quantity INTEGER NOT NULL DEFAULT 0,
                manufacturer VARCHAR(50),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ,
                sent BOOLEAN NOT NULL DEFAULT FALSE,
                sent_at TIMESTAMPTZ,
                status TEXT,
                rejection_reason TEXT,
                reviewed_by TEXT,
                reviewed_at TIMESTAMPTZ,
                review_comments TEXT
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS products_unsent_idx ON products (id) WHERE NOT sent")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    /// Insert a new product (dev seeding; the CRUD layer normally does this).
    #[instrument(skip(self, details), fields(name = %details.name), err)]
    pub async fn insert(&self, details: &ProductDetails) -> Result<Product, InsertError> {
        details.validate()?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO products (name, category, price, description, quantity, manufacturer, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(&details.name)
        .bind(&details.category)
        .bind(details.price)
        .bind(&details.description)
        .bind(details.quantity)
        .bind(details.manufacturer.as_deref())
        .bind(details.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;

        Ok(ProductRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_product", e))?
            .into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
impl ProductStore for PostgresProductStore {
    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM products WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()), err)]
    async fn find_many(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        let raw: Vec<i32> = ids.iter().map(|id| id.get()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM products WHERE id = ANY($1) ORDER BY id ASC"
        ))
        .bind(&raw)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_many", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), fields(row_count = tracing::field::Empty), err)]
    async fn list_unsent(&self) -> Result<Vec<Product>, StoreError> {
        let span = Span::current();
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM products WHERE NOT sent ORDER BY id ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_unsent", e))?;

        span.record("row_count", rows.len());
        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self, product), fields(product_id = %product.id()), err)]
    async fn update(&self, product: &Product) -> Result<(), StoreError> {
        let result = bind_workflow(sqlx::query(UPDATE_WORKFLOW), product)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(product.id()));
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn ProductTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresProductTransaction { tx }))
    }
}

struct PostgresProductTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ProductTransaction for PostgresProductTransaction {
    async fn find_by_id(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM products WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_by_id_for_update", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    async fn update(&mut self, product: &Product) -> Result<(), StoreError> {
        let result = bind_workflow(sqlx::query(UPDATE_WORKFLOW), product)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_in_transaction", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(product.id()));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_workflow<'q>(query: PgQuery<'q>, product: &'q Product) -> PgQuery<'q> {
    let w = product.workflow();
    query
        .bind(product.id().get())
        .bind(w.sent)
        .bind(w.sent_at)
        .bind(w.status.as_ref().map(|s| s.as_str()))
        .bind(w.rejection_reason.as_deref())
        .bind(w.reviewed_by.as_deref())
        .bind(w.reviewed_at)
        .bind(w.review_comments.as_deref())
        .bind(w.updated_at)
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Product, StoreError> {
    ProductRow::from_row(row)
        .map(Product::from)
        .map_err(|e| StoreError::Storage(format!("failed to decode product row: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") | Some("55P03") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct ProductRow {
    id: i32,
    name: String,
    category: String,
    price: Decimal,
    description: String,
    quantity: i32,
    manufacturer: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    sent: bool,
    sent_at: Option<DateTime<Utc>>,
    status: Option<String>,
    rejection_reason: Option<String>,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    review_comments: Option<String>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for ProductRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            category: row.try_get("category")?,
            price: row.try_get("price")?,
            description: row.try_get("description")?,
            quantity: row.try_get("quantity")?,
            manufacturer: row.try_get("manufacturer")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            sent: row.try_get("sent")?,
            sent_at: row.try_get("sent_at")?,
            status: row.try_get("status")?,
            rejection_reason: row.try_get("rejection_reason")?,
            reviewed_by: row.try_get("reviewed_by")?,
            reviewed_at: row.try_get("reviewed_at")?,
            review_comments: row.try_get("review_comments")?,
        })
    }
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product::from_parts(
            ProductId::new(row.id),
            ProductDetails {
                name: row.name,
                category: row.category,
                price: row.price,
                description: row.description,
                quantity: row.quantity,
                manufacturer: row.manufacturer,
                created_at: row.created_at,
            },
            WorkflowFields {
                sent: row.sent,
                sent_at: row.sent_at,
                status: row.status.map(ReviewStatus::from),
                rejection_reason: row.rejection_reason,
                reviewed_by: row.reviewed_by,
                reviewed_at: row.reviewed_at,
                review_comments: row.review_comments,
                updated_at: row.updated_at,
            },
        )
    }
}
