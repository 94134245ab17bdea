//! HTTP routes, one file per area.

use axum::{Router, routing::post};

pub mod products;
pub mod system;

/// Routes exposed to the CRUD layer.
pub fn router() -> Router {
    Router::new().route("/products/dispatch", post(products::dispatch))
}
