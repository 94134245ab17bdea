//! Product persistence boundary.
//!
//! The approval workflow only reads products and writes their workflow
//! columns; creation and deletion belong to the CRUD layer.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryProductStore;
pub use postgres::{InsertError, PostgresProductStore};
pub use r#trait::{ProductStore, ProductTransaction, StoreError};
