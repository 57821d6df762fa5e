//! Error types for the syndication system.
//!
//! Each layer owns a focused `thiserror` enum; `SyndicationError` is the
//! crate-wide error every handler ultimately returns. Domain invariant
//! violations (tag filter status rules) stay distinguishable from
//! infrastructure failures so the web layer can surface them to callers.

use crate::cloud::CloudError;
use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::orchestration::payload::PayloadError;
use crate::orchestration::registry::RegistryError;
use crate::tagging::TagFilterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyndicationError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Messaging error: {0}")]
    MessagingError(String),
    #[error("External service error: {0}")]
    ExternalServiceError(String),
    #[error("Payload error: {0}")]
    PayloadError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error(transparent)]
    TagFilter(#[from] TagFilterError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyndicationError {
    /// True when the error is a user-visible domain rule violation rather
    /// than an infrastructure failure.
    pub fn is_domain_violation(&self) -> bool {
        matches!(self, Self::TagFilter(_))
    }
}

impl From<sqlx::Error> for SyndicationError {
    fn from(err: sqlx::Error) -> Self {
        SyndicationError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyndicationError {
    fn from(err: serde_json::Error) -> Self {
        SyndicationError::Internal(format!("JSON serialization error: {err}"))
    }
}

impl From<MessagingError> for SyndicationError {
    fn from(err: MessagingError) -> Self {
        SyndicationError::MessagingError(err.to_string())
    }
}

impl From<CloudError> for SyndicationError {
    fn from(err: CloudError) -> Self {
        SyndicationError::ExternalServiceError(err.to_string())
    }
}

impl From<PayloadError> for SyndicationError {
    fn from(err: PayloadError) -> Self {
        SyndicationError::PayloadError(err.to_string())
    }
}

impl From<RegistryError> for SyndicationError {
    fn from(err: RegistryError) -> Self {
        SyndicationError::OrchestrationError(err.to_string())
    }
}

impl From<ConfigurationError> for SyndicationError {
    fn from(err: ConfigurationError) -> Self {
        SyndicationError::ConfigurationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyndicationError>;
