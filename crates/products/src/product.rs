use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use catalogflow_core::{DomainError, ProductId};

use crate::feedback::ApprovalFeedback;
use crate::status::ReviewStatus;

pub const NAME_MAX_LEN: usize = 100;
pub const CATEGORY_MAX_LEN: usize = 50;
pub const DESCRIPTION_MAX_LEN: usize = 500;
pub const MANUFACTURER_MAX_LEN: usize = 50;

/// Descriptive catalog data.
///
/// Owned by the CRUD layer; the workflow only serializes it into outbound
/// messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetails {
    pub name: String,
    pub category: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub description: String,
    pub quantity: i32,
    pub manufacturer: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProductDetails {
    /// Field rules the catalog applies on create/edit and on import.
    pub fn validate(&self) -> Result<(), DomainError> {
        require_text("name", &self.name, NAME_MAX_LEN)?;
        require_text("category", &self.category, CATEGORY_MAX_LEN)?;

        if self.description.chars().count() > DESCRIPTION_MAX_LEN {
            return Err(DomainError::validation(format!(
                "description exceeds {DESCRIPTION_MAX_LEN} characters"
            )));
        }
        if let Some(m) = &self.manufacturer {
            if m.chars().count() > MANUFACTURER_MAX_LEN {
                return Err(DomainError::validation(format!(
                    "manufacturer exceeds {MANUFACTURER_MAX_LEN} characters"
                )));
            }
        }
        if self.price.is_sign_negative() {
            return Err(DomainError::validation("price cannot be negative"));
        }
        if self.quantity < 0 {
            return Err(DomainError::validation("quantity cannot be negative"));
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str, max: usize) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    if value.chars().count() > max {
        return Err(DomainError::validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

/// Fields owned by the approval workflow.
///
/// Only `Product::mark_dispatched` and `Product::apply_feedback` write these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFields {
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: Option<ReviewStatus>,
    pub rejection_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_comments: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A catalog product as seen by the approval workflow.
///
/// Serializes to the flat camelCase object published on the product-events
/// topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    #[serde(flatten)]
    details: ProductDetails,
    #[serde(flatten)]
    workflow: WorkflowFields,
}

impl Product {
    /// Rebuild a product from stored state.
    pub fn from_parts(id: ProductId, details: ProductDetails, workflow: WorkflowFields) -> Self {
        Self {
            id,
            details,
            workflow,
        }
    }

    /// A freshly created, never dispatched product.
    pub fn new(id: ProductId, details: ProductDetails) -> Self {
        Self::from_parts(id, details, WorkflowFields::default())
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.details.name
    }

    pub fn details(&self) -> &ProductDetails {
        &self.details
    }

    pub fn workflow(&self) -> &WorkflowFields {
        &self.workflow
    }

    pub fn is_sent(&self) -> bool {
        self.workflow.sent
    }

    pub fn status(&self) -> Option<&ReviewStatus> {
        self.workflow.status.as_ref()
    }

    /// Selected by a dispatch of every unsent product.
    pub fn is_dispatchable(&self) -> bool {
        !self.workflow.sent
    }

    pub fn is_awaiting_review(&self) -> bool {
        self.workflow.sent && matches!(self.workflow.status, Some(ReviewStatus::Pending))
    }

    /// Record an acknowledged publish.
    ///
    /// Call only after the bus confirmed the message; `sent` implies that.
    /// Re-dispatching an already reviewed product puts it back to `Pending`.
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) {
        self.workflow.sent = true;
        self.workflow.sent_at = Some(now);
        self.workflow.status = Some(ReviewStatus::Pending);
        self.workflow.updated_at = Some(now);
    }

    /// Overwrite the review fields with a reviewer verdict.
    ///
    /// Last write wins: `reviewed_at` is not compared against the stored value,
    /// so an older verdict delivered late replaces a newer one.
    pub fn apply_feedback(&mut self, feedback: &ApprovalFeedback, now: DateTime<Utc>) {
        self.workflow.status = Some(feedback.status.clone());
        self.workflow.rejection_reason = feedback.rejection_reason.clone();
        self.workflow.reviewed_at = feedback.reviewed_at;
        self.workflow.reviewed_by = feedback.reviewed_by.clone();
        self.workflow.review_comments = feedback.comments.clone();
        self.workflow.updated_at = Some(now);
    }
}
