//! # Bulk Tagging
//!
//! Tag filters tag every response matching their search text. Applying and
//! undoing filters is slow, so operator requests only change a filter's
//! status and dispatch a single-hop task on the tagging queue. The daily
//! bulk run is also a node of the syndication chain.

pub mod errors;
pub mod service;
pub mod status;
pub mod store;

pub use errors::TagFilterError;
pub use service::{BulkTagRequest, BulkTagService, BulkTagSummary, BULK_TAG_TASK_PATH};
pub use status::{TagFilterOperation, TagFilterStatus};
pub use store::{
    InMemoryTagFilterStore, PgTagFilterStore, TagFilter, TagFilterStore, TagFilterUpdate,
    UndoSummary,
};
