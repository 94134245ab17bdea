use serde::{Deserialize, Serialize};

/// Review status of a dispatched product.
///
/// The three values the workflow itself knows about are modelled explicitly;
/// anything else a reviewer sends is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReviewStatus {
    /// Published and waiting for a reviewer verdict.
    Pending,
    Approved,
    Rejected,
    Other(String),
}

impl ReviewStatus {
    pub const PENDING: &'static str = "Pending";
    pub const APPROVED: &'static str = "Approved";
    pub const REJECTED: &'static str = "Rejected";

    pub fn as_str(&self) -> &str {
        match self {
            ReviewStatus::Pending => Self::PENDING,
            ReviewStatus::Approved => Self::APPROVED,
            ReviewStatus::Rejected => Self::REJECTED,
            ReviewStatus::Other(s) => s,
        }
    }

    /// True once a reviewer verdict has been recorded.
    pub fn is_reviewed(&self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }
}

impl From<String> for ReviewStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            Self::PENDING => ReviewStatus::Pending,
            Self::APPROVED => ReviewStatus::Approved,
            Self::REJECTED => ReviewStatus::Rejected,
            _ => ReviewStatus::Other(value),
        }
    }
}

impl From<&str> for ReviewStatus {
    fn from(value: &str) -> Self {
        ReviewStatus::from(value.to_string())
    }
}

impl From<ReviewStatus> for String {
    fn from(value: ReviewStatus) -> Self {
        match value {
            ReviewStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_values_parse_exactly() {
        assert_eq!(ReviewStatus::from("Pending"), ReviewStatus::Pending);
        assert_eq!(ReviewStatus::from("Approved"), ReviewStatus::Approved);
        assert_eq!(ReviewStatus::from("Rejected"), ReviewStatus::Rejected);
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert_eq!(
            ReviewStatus::from("approved"),
            ReviewStatus::Other("approved".to_string())
        );
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&ReviewStatus::Approved).unwrap();
        assert_eq!(json, "\"Approved\"");

        let custom: ReviewStatus = serde_json::from_str("\"NeedsChanges\"").unwrap();
        assert_eq!(custom, ReviewStatus::Other("NeedsChanges".to_string()));
        assert!(custom.is_reviewed());
    }

    proptest! {
        /// Any reviewer-supplied string survives the round trip unchanged.
        #[test]
        fn reviewer_values_are_preserved(raw in "[A-Za-z][A-Za-z _-]{0,30}") {
            let status = ReviewStatus::from(raw.clone());
            prop_assert_eq!(String::from(status), raw);
        }
    }
}
