//! Request/response DTOs and mapping to/from workflow types.

use serde::{Deserialize, Serialize};

use catalogflow_core::ProductId;
use catalogflow_infra::{DispatchOutcome, Selection};

/// `POST /products/dispatch` body.
///
/// `{"mode":"all"}` or `{"mode":"selected","productIds":[1,2]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub mode: String,
    #[serde(default)]
    pub product_ids: Vec<i32>,
}

impl DispatchRequest {
    /// `None` for an unknown mode.
    pub fn selection(&self) -> Option<Selection> {
        match self.mode.as_str() {
            "all" => Some(Selection::All),
            "selected" => Some(Selection::Selected(
                self.product_ids.iter().copied().map(ProductId::new).collect(),
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub outcome: &'static str,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_names: Vec<String>,
    pub message: String,
}

impl From<DispatchOutcome> for DispatchResponse {
    fn from(outcome: DispatchOutcome) -> Self {
        match outcome {
            DispatchOutcome::NothingSelected => Self {
                outcome: "nothing_selected",
                succeeded: 0,
                failed: 0,
                failed_names: vec![],
                message: "No products selected.".to_string(),
            },
            DispatchOutcome::NothingToSend => Self {
                outcome: "nothing_to_send",
                succeeded: 0,
                failed: 0,
                failed_names: vec![],
                message: "There are no products to send.".to_string(),
            },
            DispatchOutcome::Completed(report) => Self {
                outcome: "completed",
                succeeded: report.succeeded,
                failed: report.failed,
                message: report.summary(),
                failed_names: report.failed_names,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes() {
        let all: DispatchRequest = serde_json::from_str(r#"{"mode":"all"}"#).unwrap();
        assert_eq!(all.selection(), Some(Selection::All));

        let selected: DispatchRequest =
            serde_json::from_str(r#"{"mode":"selected","productIds":[3,1]}"#).unwrap();
        assert_eq!(
            selected.selection(),
            Some(Selection::Selected(vec![ProductId::new(3), ProductId::new(1)]))
        );

        let empty: DispatchRequest = serde_json::from_str(r#"{"mode":"selected"}"#).unwrap();
        assert_eq!(empty.selection(), Some(Selection::Selected(vec![])));

        let bogus: DispatchRequest = serde_json::from_str(r#"{"mode":"everything"}"#).unwrap();
        assert_eq!(bogus.selection(), None);
    }
}
