//! # Bulk Tagging
//!
//! Operator requests move filters into their working status synchronously and
//! hand the slow database work to a single-hop continuation on the tagging
//! queue. The task side applies or undoes filters and reports on the
//! notification thread the operator request started.

use super::errors::TagFilterError;
use super::status::{TagFilterOperation, TagFilterStatus};
use super::store::{TagFilter, TagFilterStore, TagFilterUpdate, UndoSummary};
use crate::config::QueueConfig;
use crate::constants::progress::{CHECK_MARK, CROSS_MARK};
use crate::error::{Result, SyndicationError};
use crate::messaging::{ContinuationQueue, DispatchRequest};
use crate::orchestration::HttpMethod;
use crate::progress::ProgressReporter;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const BULK_TAG_TASK_PATH: &str = "/tasks/tag/bulk_tag";

/// Body of the bulk tag task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkTagRequest {
    pub thread_ts: Option<String>,
}

impl BulkTagRequest {
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let bytes = STANDARD
            .decode(trimmed)
            .map_err(|e| SyndicationError::PayloadError(format!("bulk tag body is not base64: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Result of one pass over the queued filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkTagSummary {
    pub applied: Vec<i64>,
    pub failed: Vec<i64>,
    pub provenance_inserted: u64,
}

pub struct BulkTagService {
    store: Arc<dyn TagFilterStore>,
    queue: Arc<dyn ContinuationQueue>,
    progress: Arc<ProgressReporter>,
    queues: QueueConfig,
    ts_vector_language: &'static str,
    /// Appended to notification lines, e.g. the hosting project
    label: String,
}

impl std::fmt::Debug for BulkTagService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkTagService")
            .field("tagging_queue_id", &self.queues.tagging_queue_id)
            .field("ts_vector_language", &self.ts_vector_language)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl BulkTagService {
    pub fn new(
        store: Arc<dyn TagFilterStore>,
        queue: Arc<dyn ContinuationQueue>,
        progress: Arc<ProgressReporter>,
        queues: QueueConfig,
        ts_vector_language: &'static str,
        label: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            progress,
            queues,
            ts_vector_language,
            label: label.into(),
        }
    }

    pub fn store(&self) -> &dyn TagFilterStore {
        self.store.as_ref()
    }

    async fn require(&self, id: i64) -> Result<TagFilter> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| TagFilterError::NotFound(id).into())
    }

    async fn dispatch(&self, method: HttpMethod, relative_uri: String, body: Option<String>) -> Result<()> {
        let request = DispatchRequest::new(
            self.queues.tagging_queue_id.clone(),
            method,
            relative_uri,
            body,
            Duration::ZERO,
        )?;
        self.queue.dispatch(request).await?;
        Ok(())
    }

    // Operator surface

    /// Queue every ACTIVE and EDITING filter and start the bulk task
    pub async fn enqueue_all(&self) -> Result<u64> {
        let queued = self.enqueue_pending().await?;
        if queued == 0 && self.has_queued().await? {
            return Err(TagFilterError::BulkTagInProgress.into());
        }

        let thread_ts = self
            .progress
            .start_thread(&format!("Bulk tagging all filters ({}) :label:", self.label))
            .await;

        let body = BulkTagRequest { thread_ts }.encode()?;
        self.dispatch(HttpMethod::Post, BULK_TAG_TASK_PATH.to_string(), Some(body))
            .await?;
        info!(queued, "Bulk tagging requested");
        Ok(queued)
    }

    /// Mark one filter PROCESSING and dispatch its apply task
    pub async fn request_apply(&self, id: i64) -> Result<()> {
        let filter = self.require(id).await?;
        filter.status.guard(id, TagFilterOperation::Apply)?;
        if !self
            .store
            .transition(id, &TagFilterStatus::PENDING, TagFilterStatus::Processing)
            .await?
        {
            return Err(self.stale_status(id, TagFilterOperation::Apply).await);
        }
        self.dispatch(HttpMethod::Get, format!("{BULK_TAG_TASK_PATH}/{id}"), None)
            .await
    }

    /// Mark one ACTIVE filter PROCESSING and dispatch its undo task
    pub async fn request_undo(&self, id: i64) -> Result<()> {
        let filter = self.require(id).await?;
        filter.status.guard(id, TagFilterOperation::Undo)?;
        if !self
            .store
            .transition(id, &[TagFilterStatus::Active], TagFilterStatus::Processing)
            .await?
        {
            return Err(self.stale_status(id, TagFilterOperation::Undo).await);
        }
        self.dispatch(HttpMethod::Get, format!("{BULK_TAG_TASK_PATH}/undo/{id}"), None)
            .await
    }

    pub async fn update_filter(&self, id: i64, update: &TagFilterUpdate) -> Result<()> {
        if update.is_empty() {
            return Err(TagFilterError::EmptyUpdate.into());
        }
        let filter = self.require(id).await?;
        filter.status.guard(id, TagFilterOperation::Edit)?;
        if !self.store.update(id, update).await? {
            return Err(self.stale_status(id, TagFilterOperation::Edit).await);
        }
        Ok(())
    }

    pub async fn delete_filter(&self, id: i64) -> Result<()> {
        let filter = self.require(id).await?;
        filter.status.guard(id, TagFilterOperation::Delete)?;
        if !self.store.delete(id).await? {
            return Err(self.stale_status(id, TagFilterOperation::Delete).await);
        }
        Ok(())
    }

    /// Error for a filter whose status changed between the guard and the write
    async fn stale_status(&self, id: i64, operation: TagFilterOperation) -> SyndicationError {
        match self.store.find(id).await {
            Ok(Some(filter)) => TagFilterError::InvalidStatus {
                id,
                status: filter.status,
                operation,
            }
            .into(),
            Ok(None) => TagFilterError::NotFound(id).into(),
            Err(e) => e,
        }
    }

    // Task surface

    pub async fn has_queued(&self) -> Result<bool> {
        Ok(self.store.count_with_status(&[TagFilterStatus::Queued]).await? > 0)
    }

    pub async fn has_pending(&self) -> Result<bool> {
        Ok(self.store.count_with_status(&TagFilterStatus::PENDING).await? > 0)
    }

    /// ACTIVE and EDITING filters become QUEUED, unless a bulk pass already
    /// holds QUEUED filters; then nothing moves and 0 is returned
    pub async fn enqueue_pending(&self) -> Result<u64> {
        self.store.enqueue_if_idle(&TagFilterStatus::PENDING).await
    }

    /// Apply every QUEUED filter one after another under a shared action id.
    /// A failing filter is marked ERROR and reported, in the channel itself
    /// when there is no thread; the others still run.
    pub async fn apply_queued(&self, thread_ts: Option<&str>) -> Result<BulkTagSummary> {
        let ids = self.store.ids_with_status(TagFilterStatus::Queued).await?;
        let action_uuid = Uuid::new_v4();
        let mut summary = BulkTagSummary::default();

        for id in ids {
            let tag_text = self
                .store
                .find(id)
                .await?
                .map(|filter| filter.tag_text)
                .unwrap_or_default();
            self.store.set_status(id, TagFilterStatus::Processing).await?;

            match self.store.apply(id, action_uuid, self.ts_vector_language).await {
                Ok(inserted) => {
                    summary.applied.push(id);
                    summary.provenance_inserted += inserted;
                    self.progress
                        .post(
                            thread_ts,
                            &format!(
                                "Tagging complete: filter id {id}: #{tag_text} ({}) :{CHECK_MARK}:",
                                self.label
                            ),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(tag_filter_id = id, error = %e, "Bulk tagging failed for filter");
                    self.store.set_status(id, TagFilterStatus::Error).await?;
                    summary.failed.push(id);
                    self.progress
                        .alert(
                            thread_ts,
                            &format!(
                                "Error tagging filter id {id}: #{tag_text} ({}) :{CROSS_MARK}:",
                                self.label
                            ),
                        )
                        .await;
                }
            }
        }
        Ok(summary)
    }

    /// Apply one filter previously marked PROCESSING
    pub async fn apply_filter(&self, id: i64) -> Result<u64> {
        let filter = self.require(id).await?;
        let thread_ts = self
            .progress
            .start_thread(&format!(
                "Applying tag filter id {id}: #{} ({})",
                filter.tag_text, self.label
            ))
            .await;

        match self.store.apply(id, Uuid::new_v4(), self.ts_vector_language).await {
            Ok(inserted) => {
                self.progress
                    .post(thread_ts.as_deref(), &format!("Applied :{CHECK_MARK}:"))
                    .await;
                Ok(inserted)
            }
            Err(e) => {
                self.store.set_status(id, TagFilterStatus::Error).await?;
                self.progress
                    .alert(
                        thread_ts.as_deref(),
                        &format!("Error applying tag filter id {id}: #{} :{CROSS_MARK}:", filter.tag_text),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Undo one filter previously marked PROCESSING
    pub async fn undo_filter(&self, id: i64) -> Result<UndoSummary> {
        let filter = self.require(id).await?;
        let thread_ts = self
            .progress
            .start_thread(&format!(
                "Undoing tag filter id {id}: #{} ({})",
                filter.tag_text, self.label
            ))
            .await;

        match self.store.undo(id).await {
            Ok(summary) => {
                self.progress
                    .post(thread_ts.as_deref(), &format!("Undo complete :{CHECK_MARK}:"))
                    .await;
                Ok(summary)
            }
            Err(e) => {
                self.store.set_status(id, TagFilterStatus::Error).await?;
                self.progress
                    .alert(
                        thread_ts.as_deref(),
                        &format!("Error undoing tag filter id {id}: #{} :{CROSS_MARK}:", filter.tag_text),
                    )
                    .await;
                Err(e)
            }
        }
    }
}
