use super::status::{TagFilterOperation, TagFilterStatus};
use thiserror::Error;

/// Tag filter rule violations surfaced to the caller
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagFilterError {
    #[error("Tag filter {0} not found")]
    NotFound(i64),

    #[error("Tagging in progress. Please try again later")]
    BulkTagInProgress,

    #[error("Tag filter {id} cannot be {operation} while {status}")]
    InvalidStatus {
        id: i64,
        status: TagFilterStatus,
        operation: TagFilterOperation,
    },

    #[error("Tag filter update has no fields to change")]
    EmptyUpdate,
}

impl TagFilterError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "tag_filter_not_found",
            Self::BulkTagInProgress => "bulk_tag_in_progress",
            Self::InvalidStatus { .. } => "invalid_tag_filter_status",
            Self::EmptyUpdate => "empty_update",
        }
    }
}
