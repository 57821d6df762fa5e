//! Progress reporting for pipeline runs.
//!
//! Every message is written to the audit log before it is delivered. Delivery
//! and audit failures are logged and swallowed: a missing progress line must
//! never stall the pipeline or trigger a redelivery of work already done.

use super::message_history::{
    MessageDestination, MessageEvent, MessageHistoryStore, MessageSource, NewMessageHistoryEntry,
};
use super::slack::NotificationChannel;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ProgressReporter {
    channel: Arc<dyn NotificationChannel>,
    history: Arc<dyn MessageHistoryStore>,
    channel_id: String,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        history: Arc<dyn MessageHistoryStore>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            history,
            channel_id: channel_id.into(),
        }
    }

    /// Post a top-level message and return its thread handle
    pub async fn start_thread(&self, text: &str) -> Option<String> {
        let entry_id = self
            .audit(
                MessageEvent::DataRunProgress,
                json!({ "channel_id": self.channel_id }),
                text,
            )
            .await;

        let thread_ts = match self.channel.post_message(&self.channel_id, text, None).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "Failed to start progress thread");
                None
            }
        };

        if let (Some(id), Some(ts)) = (entry_id, thread_ts.as_deref()) {
            if let Err(e) = self.history.attach_thread(id, ts).await {
                warn!(error = %e, message_history_id = id, "Failed to attach thread to audit entry");
            }
        }
        thread_ts
    }

    /// Reply in `thread_ts`; no-op without a thread
    pub async fn post(&self, thread_ts: Option<&str>, text: &str) {
        let Some(thread_ts) = thread_ts else {
            debug!(text = %text, "No progress thread; message skipped");
            return;
        };

        self.audit(MessageEvent::DataRunProgress, self.thread_detail(thread_ts), text)
            .await;
        if let Err(e) = self
            .channel
            .post_message(&self.channel_id, text, Some(thread_ts))
            .await
        {
            warn!(error = %e, "Failed to send progress message");
        }
    }

    /// React to the thread's root message; no-op without a thread
    pub async fn react(&self, thread_ts: Option<&str>, reaction: &str) {
        let Some(thread_ts) = thread_ts else {
            return;
        };

        self.audit(MessageEvent::DataRunProgress, self.thread_detail(thread_ts), reaction)
            .await;
        if let Err(e) = self
            .channel
            .add_reaction(&self.channel_id, reaction, thread_ts)
            .await
        {
            warn!(error = %e, "Failed to send progress reaction");
        }
    }

    /// Reply in `thread_ts`, or post a top-level message when there is no
    /// thread. Failures must reach a reader either way.
    pub async fn alert(&self, thread_ts: Option<&str>, text: &str) {
        if thread_ts.is_some() {
            self.post(thread_ts, text).await;
            return;
        }

        self.audit(
            MessageEvent::DataRunProgress,
            json!({ "channel_id": self.channel_id }),
            text,
        )
        .await;
        if let Err(e) = self.channel.post_message(&self.channel_id, text, None).await {
            warn!(error = %e, "Failed to send alert");
        }
    }

    /// Audit-only entry recording a change made to shared data
    pub async fn record_datafix(&self, body: &str) {
        self.audit(
            MessageEvent::DatafixAudit,
            json!({ "channel_id": self.channel_id }),
            body,
        )
        .await;
    }

    fn thread_detail(&self, thread_ts: &str) -> Value {
        json!({ "channel_id": self.channel_id, "thread_ts": thread_ts })
    }

    async fn audit(&self, event: MessageEvent, destination_detail: Value, body: &str) -> Option<i64> {
        let entry = NewMessageHistoryEntry {
            event,
            source: MessageSource::System,
            source_detail: None,
            destination: MessageDestination::Slack,
            destination_detail,
            body: body.to_string(),
        };
        match self.history.record(entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, body = %body, "Failed to write message history");
                None
            }
        }
    }
}
