//! Append-only audit log of every outbound notification.

use crate::error::{Result, SyndicationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageEvent {
    DataRunProgress,
    DatafixAudit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSource {
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageDestination {
    Slack,
    Email,
}

macro_rules! text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($ty), s)),
                }
            }
        }
    };
}

text_enum!(MessageEvent { DataRunProgress => "DATA_RUN_PROGRESS", DatafixAudit => "DATAFIX_AUDIT" });
text_enum!(MessageSource { System => "SYSTEM" });
text_enum!(MessageDestination { Slack => "SLACK", Email => "EMAIL" });

/// Entry about to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessageHistoryEntry {
    pub event: MessageEvent,
    pub source: MessageSource,
    pub source_detail: Option<Value>,
    pub destination: MessageDestination,
    pub destination_detail: Value,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHistoryEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub event: MessageEvent,
    pub source: MessageSource,
    pub source_detail: Option<Value>,
    pub destination: MessageDestination,
    pub destination_detail: Value,
    pub body: String,
}

impl MessageHistoryEntry {
    pub fn thread_ts(&self) -> Option<&str> {
        self.destination_detail.get("thread_ts").and_then(Value::as_str)
    }
}

#[async_trait]
pub trait MessageHistoryStore: Send + Sync {
    /// Append an entry; returns its id
    async fn record(&self, entry: NewMessageHistoryEntry) -> Result<i64>;

    /// Set `destination_detail.thread_ts` once the thread handle is known
    async fn attach_thread(&self, id: i64, thread_ts: &str) -> Result<()>;

    /// Newest first
    async fn recent(&self, limit: i64) -> Result<Vec<MessageHistoryEntry>>;
}

#[derive(Debug, Default)]
pub struct InMemoryMessageHistoryStore {
    entries: Mutex<Vec<MessageHistoryEntry>>,
}

impl InMemoryMessageHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<MessageHistoryEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl MessageHistoryStore for InMemoryMessageHistoryStore {
    async fn record(&self, entry: NewMessageHistoryEntry) -> Result<i64> {
        let mut entries = self.entries.lock();
        let id = entries.len() as i64 + 1;
        entries.push(MessageHistoryEntry {
            id,
            created_at: Utc::now(),
            event: entry.event,
            source: entry.source,
            source_detail: entry.source_detail,
            destination: entry.destination,
            destination_detail: entry.destination_detail,
            body: entry.body,
        });
        Ok(id)
    }

    async fn attach_thread(&self, id: i64, thread_ts: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| SyndicationError::DatabaseError(format!("message_history {id} not found")))?;

        match entry.destination_detail.as_object_mut() {
            Some(detail) => {
                detail.insert("thread_ts".to_string(), Value::String(thread_ts.to_string()));
            }
            None => {
                entry.destination_detail = serde_json::json!({ "thread_ts": thread_ts });
            }
        }
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<MessageHistoryEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// Store backed by the `message_history` table
#[derive(Debug, Clone)]
pub struct PgMessageHistoryStore {
    pool: PgPool,
}

impl PgMessageHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageHistoryStore for PgMessageHistoryStore {
    async fn record(&self, entry: NewMessageHistoryEntry) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO message_history (event, source, source_detail, destination, destination_detail, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(entry.event.as_str())
        .bind(entry.source.as_str())
        .bind(entry.source_detail)
        .bind(entry.destination.as_str())
        .bind(entry.destination_detail)
        .bind(entry.body)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn attach_thread(&self, id: i64, thread_ts: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE message_history
            SET destination_detail = jsonb_set(COALESCE(destination_detail, '{}'::jsonb), '{thread_ts}', to_jsonb($1::text))
            WHERE id = $2
            "#,
        )
        .bind(thread_ts)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<MessageHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, event, source, source_detail, destination, destination_detail, body
            FROM message_history
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event: String = row.try_get("event")?;
                let source: String = row.try_get("source")?;
                let destination: String = row.try_get("destination")?;
                let destination_detail: Option<Value> = row.try_get("destination_detail")?;
                Ok(MessageHistoryEntry {
                    id: row.try_get("id")?,
                    created_at: row.try_get("created_at")?,
                    event: event.parse().map_err(SyndicationError::DatabaseError)?,
                    source: source.parse().map_err(SyndicationError::DatabaseError)?,
                    source_detail: row.try_get("source_detail")?,
                    destination: destination.parse().map_err(SyndicationError::DatabaseError)?,
                    destination_detail: destination_detail.unwrap_or(Value::Null),
                    body: row.try_get("body")?,
                })
            })
            .collect()
    }
}
