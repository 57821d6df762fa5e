//! # Progress Reporting
//!
//! Human-readable run progress posted to a shared discussion thread, with an
//! audit trail of every message sent.

pub mod message_history;
pub mod reporter;
pub mod slack;

pub use message_history::{
    InMemoryMessageHistoryStore, MessageDestination, MessageEvent, MessageHistoryEntry,
    MessageHistoryStore, MessageSource, NewMessageHistoryEntry, PgMessageHistoryStore,
};
pub use reporter::ProgressReporter;
pub use slack::{DisabledChannel, NotificationChannel, SlackChannel};
