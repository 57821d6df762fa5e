//! # Messaging Error Types
//!
//! Errors raised while handing continuations to the delayed-dispatch queue.

use crate::cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("POST dispatch to {relative_uri} has no body")]
    MissingBody { relative_uri: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },
}

impl MessagingError {
    /// Create a queue operation error
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }
}

impl From<CloudError> for MessagingError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Authentication(message) => MessagingError::Authentication { message },
            other => MessagingError::queue_operation("cloud_tasks", "create_task", other.to_string()),
        }
    }
}
