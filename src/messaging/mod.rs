//! # Messaging Module
//!
//! Delayed-dispatch continuation queue used to chain pipeline steps and to
//! hand single-hop tagging work to a background request.

pub mod continuation_queue;
pub mod errors;

pub use continuation_queue::{CloudTasksQueue, ContinuationQueue, DispatchRequest, RecordingQueue};
pub use errors::MessagingError;
