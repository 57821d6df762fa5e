//! Tag filter lifecycle.
//!
//! ```text
//! EDITING ──┬── bulk enqueue ──▶ QUEUED ──▶ PROCESSING ──▶ ACTIVE
//! ACTIVE  ──┘                                         └──▶ ERROR
//! EDITING/ACTIVE ── apply ──▶ PROCESSING ──▶ ACTIVE | ERROR
//! ACTIVE ── undo ──▶ PROCESSING ──▶ EDITING | ERROR
//! ```

use super::errors::TagFilterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagFilterStatus {
    Editing,
    Active,
    Queued,
    Processing,
    Error,
}

impl TagFilterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Editing => "EDITING",
            Self::Active => "ACTIVE",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Error => "ERROR",
        }
    }

    /// Statuses picked up by a bulk run
    pub const PENDING: [TagFilterStatus; 2] = [Self::Active, Self::Editing];

    pub fn allows(&self, operation: TagFilterOperation) -> bool {
        match operation {
            TagFilterOperation::Edit | TagFilterOperation::Delete => *self == Self::Editing,
            TagFilterOperation::Apply => Self::PENDING.contains(self),
            TagFilterOperation::Undo => *self == Self::Active,
        }
    }

    /// Reject `operation` on filter `id` unless the status allows it
    pub fn guard(&self, id: i64, operation: TagFilterOperation) -> Result<(), TagFilterError> {
        if self.allows(operation) {
            Ok(())
        } else {
            Err(TagFilterError::InvalidStatus {
                id,
                status: *self,
                operation,
            })
        }
    }
}

impl fmt::Display for TagFilterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TagFilterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EDITING" => Ok(Self::Editing),
            "ACTIVE" => Ok(Self::Active),
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Invalid tag filter status: {s}")),
        }
    }
}

/// Operator actions gated by status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagFilterOperation {
    Edit,
    Delete,
    Apply,
    Undo,
}

impl fmt::Display for TagFilterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Edit => "edited",
            Self::Delete => "deleted",
            Self::Apply => "applied",
            Self::Undo => "undone",
        };
        write!(f, "{verb}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_editing_filters_can_be_changed() {
        for status in [
            TagFilterStatus::Active,
            TagFilterStatus::Queued,
            TagFilterStatus::Processing,
            TagFilterStatus::Error,
        ] {
            assert!(!status.allows(TagFilterOperation::Edit));
            assert!(!status.allows(TagFilterOperation::Delete));
        }
        assert!(TagFilterStatus::Editing.allows(TagFilterOperation::Edit));
        assert!(TagFilterStatus::Editing.allows(TagFilterOperation::Delete));
    }

    #[test]
    fn test_only_active_filters_can_be_undone() {
        assert!(TagFilterStatus::Active.allows(TagFilterOperation::Undo));
        assert!(!TagFilterStatus::Editing.allows(TagFilterOperation::Undo));
        assert!(!TagFilterStatus::Queued.allows(TagFilterOperation::Undo));
    }

    #[test]
    fn test_guard_reports_domain_error() {
        let err = TagFilterStatus::Queued
            .guard(7, TagFilterOperation::Delete)
            .unwrap_err();
        assert_eq!(
            err,
            TagFilterError::InvalidStatus {
                id: 7,
                status: TagFilterStatus::Queued,
                operation: TagFilterOperation::Delete,
            }
        );
        assert_eq!(err.to_string(), "Tag filter 7 cannot be deleted while QUEUED");
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            TagFilterStatus::Editing,
            TagFilterStatus::Active,
            TagFilterStatus::Queued,
            TagFilterStatus::Processing,
            TagFilterStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<TagFilterStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<TagFilterStatus>().is_err());
    }
}
