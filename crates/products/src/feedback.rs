use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;

use catalogflow_core::ProductId;

use crate::status::ReviewStatus;

/// A reviewer verdict as it arrives on the feedback topic.
///
/// Transient: built on deserialization, applied to a `Product`, then dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalFeedback {
    pub product_id: ProductId,
    pub status: ReviewStatus,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    /// Offset-less timestamps are read as UTC.
    #[serde(default, alias = "reviewedDate", deserialize_with = "lenient_timestamp")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Error)]
pub enum FeedbackError {
    /// Payload was not a JSON feedback record.
    #[error("malformed feedback payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Payload parsed but carries values the workflow cannot apply.
    #[error("invalid feedback: {0}")]
    Invalid(String),
}

impl ApprovalFeedback {
    /// Decode and validate a raw message value.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FeedbackError> {
        let feedback: ApprovalFeedback = serde_json::from_slice(bytes)?;
        feedback.validate()?;
        Ok(feedback)
    }

    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.status.as_str().trim().is_empty() {
            return Err(FeedbackError::Invalid("status cannot be blank".to_string()));
        }
        Ok(())
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|raw| parse_timestamp(&raw).map_err(de::Error::custom))
        .transpose()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Ok(at.with_timezone(&Utc)),
        Err(err) => raw
            .parse::<NaiveDateTime>()
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_full_record() {
        let raw = br#"{
            "productId": 7,
            "status": "Rejected",
            "rejectionReason": "missing certificate",
            "reviewedAt": "2025-12-01T10:00:00Z",
            "reviewedBy": "bob",
            "comments": "resubmit with docs"
        }"#;

        let fb = ApprovalFeedback::from_slice(raw).unwrap();
        assert_eq!(fb.product_id, ProductId::new(7));
        assert_eq!(fb.status, ReviewStatus::Rejected);
        assert_eq!(fb.rejection_reason.as_deref(), Some("missing certificate"));
        assert_eq!(
            fb.reviewed_at,
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(fb.reviewed_by.as_deref(), Some("bob"));
        assert_eq!(fb.comments.as_deref(), Some("resubmit with docs"));
    }

    #[test]
    fn optional_fields_may_be_null_or_absent() {
        let raw = br#"{"productId":3,"status":"Approved","rejectionReason":null,"reviewedAt":"2025-12-01T10:00:00Z"}"#;
        let fb = ApprovalFeedback::from_slice(raw).unwrap();
        assert!(fb.rejection_reason.is_none());
        assert!(fb.reviewed_by.is_none());
        assert!(fb.comments.is_none());
    }

    #[test]
    fn accepts_reviewed_date_spelling() {
        let raw = br#"{"productId":3,"status":"Approved","reviewedDate":"2025-12-01T10:00:00Z"}"#;
        assert!(ApprovalFeedback::from_slice(raw).is_ok());
    }

    #[test]
    fn missing_product_id_is_malformed() {
        let raw = br#"{"status":"Approved","reviewedAt":"2025-12-01T10:00:00Z"}"#;
        let err = ApprovalFeedback::from_slice(raw).unwrap_err();
        assert!(matches!(err, FeedbackError::Malformed(_)));
    }

    #[test]
    fn non_json_is_malformed() {
        let err = ApprovalFeedback::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, FeedbackError::Malformed(_)));
    }

    #[test]
    fn blank_status_is_invalid() {
        let raw = br#"{"productId":3,"status":"  ","reviewedAt":"2025-12-01T10:00:00Z"}"#;
        let err = ApprovalFeedback::from_slice(raw).unwrap_err();
        assert!(matches!(err, FeedbackError::Invalid(_)));
    }

    #[test]
    fn non_positive_product_id_is_left_to_the_store() {
        let raw = br#"{"productId":0,"status":"Approved"}"#;
        let fb = ApprovalFeedback::from_slice(raw).unwrap();
        assert_eq!(fb.product_id, ProductId::new(0));
    }

    #[test]
    fn review_time_without_offset_is_utc() {
        let raw = br#"{"productId":7,"status":"Approved","reviewedAt":"2025-12-01T10:00:00.123"}"#;
        let fb = ApprovalFeedback::from_slice(raw).unwrap();
        assert_eq!(
            fb.reviewed_at.map(|at| at.timestamp_millis()),
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 10, 0, 0).unwrap().timestamp_millis() + 123)
        );

        let raw = br#"{"productId":7,"status":"Approved","reviewedDate":"2025-12-01T10:00:00"}"#;
        let fb = ApprovalFeedback::from_slice(raw).unwrap();
        assert_eq!(
            fb.reviewed_at,
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn offsets_are_normalised_to_utc() {
        let raw = br#"{"productId":7,"status":"Approved","reviewedAt":"2025-12-01T12:00:00+02:00"}"#;
        let fb = ApprovalFeedback::from_slice(raw).unwrap();
        assert_eq!(
            fb.reviewed_at,
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn review_time_is_optional() {
        let raw = br#"{"productId":7,"status":"Approved","reviewedBy":"alice"}"#;
        let fb = ApprovalFeedback::from_slice(raw).unwrap();
        assert!(fb.reviewed_at.is_none());
        assert_eq!(fb.reviewed_by.as_deref(), Some("alice"));

        let raw = br#"{"productId":7,"status":"Approved","reviewedAt":null}"#;
        assert!(ApprovalFeedback::from_slice(raw).unwrap().reviewed_at.is_none());
    }

    #[test]
    fn unreadable_review_time_is_malformed() {
        let raw = br#"{"productId":7,"status":"Approved","reviewedAt":"yesterday"}"#;
        let err = ApprovalFeedback::from_slice(raw).unwrap_err();
        assert!(matches!(err, FeedbackError::Malformed(_)));
    }
}
