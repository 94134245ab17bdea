use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};
use serde_json::json;

use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let (consumer, stats) = services.feedback_status();
    Json(json!({
        "status": "ok",
        "backend": services.backend.as_str(),
        "feedbackConsumer": consumer,
        "feedbackStats": stats,
    }))
}
