use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::dto::{DispatchRequest, DispatchResponse};
use crate::app::errors::{json_error, store_error_to_response};
use crate::app::services::AppServices;

/// Publish a batch of products for review.
///
/// Rejections (nothing selected, nothing to send) are `200` with an
/// `outcome` field; only an unknown mode or a store failure is an error.
pub async fn dispatch(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<DispatchRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text());
        }
    };

    let Some(selection) = body.selection() else {
        tracing::info!(mode = %body.mode, "dispatch rejected: invalid request");
        return json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "mode must be one of: all, selected",
        );
    };

    match services.dispatcher.dispatch(selection).await {
        Ok(outcome) => (StatusCode::OK, Json(DispatchResponse::from(outcome))).into_response(),
        Err(err) => store_error_to_response(err),
    }
}
