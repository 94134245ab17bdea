//! Product approval domain (no IO).
//!
//! The catalog row as the approval workflow sees it, the review status state
//! machine, and the reviewer feedback record consumed from the bus.

pub mod feedback;
pub mod product;
pub mod status;

pub use feedback::{ApprovalFeedback, FeedbackError};
pub use product::{Product, ProductDetails, WorkflowFields};
pub use status::ReviewStatus;
