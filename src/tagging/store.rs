//! Tag filter persistence.
//!
//! Applying a filter tags every response whose token vector matches the
//! filter's search text (within its settlements and date window) and records
//! provenance against the filter's actor, all in one statement. Undo removes
//! that provenance, the actor and any tag no other actor vouches for.

use super::status::TagFilterStatus;
use crate::error::{Result, SyndicationError};
use crate::logging::log_database_operation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    pub id: i64,
    pub tag_text: String,
    pub search_text: String,
    pub status: TagFilterStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Editable fields; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilterUpdate {
    pub tag_text: Option<String>,
    pub search_text: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl TagFilterUpdate {
    pub fn is_empty(&self) -> bool {
        self.tag_text.is_none()
            && self.search_text.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoSummary {
    pub provenance_deleted: u64,
    pub actors_deleted: u64,
    pub tags_deleted: u64,
}

#[async_trait]
pub trait TagFilterStore: Send + Sync {
    async fn find(&self, id: i64) -> Result<Option<TagFilter>>;

    async fn count_with_status(&self, statuses: &[TagFilterStatus]) -> Result<i64>;

    async fn ids_with_status(&self, status: TagFilterStatus) -> Result<Vec<i64>>;

    /// Queue every filter in one of `from`, unless some filter is already
    /// QUEUED. Check and update are one atomic step; returns the number of
    /// filters queued, 0 when a bulk pass is in progress.
    async fn enqueue_if_idle(&self, from: &[TagFilterStatus]) -> Result<u64>;

    /// Move one filter to `to` if it is currently in one of `from`
    async fn transition(&self, id: i64, from: &[TagFilterStatus], to: TagFilterStatus) -> Result<bool>;

    async fn set_status(&self, id: i64, status: TagFilterStatus) -> Result<()>;

    /// Apply `update` if the filter is still EDITING
    async fn update(&self, id: i64, update: &TagFilterUpdate) -> Result<bool>;

    /// Delete the filter if it is still EDITING
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Tag matching responses, mark the filter ACTIVE and stamp its run;
    /// returns the number of provenance rows written
    async fn apply(&self, id: i64, action_uuid: Uuid, ts_vector_language: &str) -> Result<u64>;

    /// Remove everything the filter tagged and return it to EDITING
    async fn undo(&self, id: i64) -> Result<UndoSummary>;
}

/// Serializes bulk enqueues across server instances
const BULK_ENQUEUE_LOCK_KEY: i64 = 0x7461_675f_6275_6c6b;

fn status_strings(statuses: &[TagFilterStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

const APPLY_FILTER_SQL: &str = r#"
WITH new_actor AS (
    INSERT INTO tag_actors (actor_entity_type, actor_entity_id)
    SELECT 'FILTER', $1
    WHERE NOT EXISTS (SELECT 1 FROM tag_actors WHERE actor_entity_type = 'FILTER' AND actor_entity_id = $1)
    RETURNING id
), tag_action AS (
    SELECT id AS actor_id FROM new_actor
    UNION
    SELECT id AS actor_id FROM tag_actors WHERE actor_entity_type = 'FILTER' AND actor_entity_id = $1
), untagged AS (
    SELECT r.id AS response_id, f.tag_text, t.id AS tag_id
    FROM tag_filters f
    LEFT JOIN tag_filter_settlements tfs ON tfs.tag_filter_id = f.id
    INNER JOIN settlements s ON tfs.settlement_id IS NULL OR tfs.settlement_id = s.id
    INNER JOIN service_points sp ON sp.settlement_id = s.id
    INNER JOIN responses r
        ON r.idea_token_vector @@ to_tsquery($3::regconfig, f.search_text) AND r.service_point_id = sp.id
    LEFT JOIN tags t ON t.response_id = r.id AND t."name" = f.tag_text
    LEFT JOIN tag_actors a ON a.actor_entity_type = 'FILTER' AND a.actor_entity_id = f.id
    LEFT JOIN tag_provenance p ON p.tag_id = t.id AND p.tag_actor_id = a.id
    WHERE p.id IS NULL
      AND (f.start_date IS NULL OR f.start_date <= r.created_at)
      AND (f.end_date IS NULL OR f.end_date >= r.created_at)
      AND (f.last_run_at IS NULL OR (f.updated_at < f.last_run_at AND f.last_run_at < r.uploaded_at))
      AND f.id = $1
), just_tagged AS (
    INSERT INTO tags (response_id, name)
    SELECT response_id, tag_text FROM untagged WHERE tag_id IS NULL
    RETURNING id, response_id
), new_provenance AS (
    INSERT INTO tag_provenance (tag_id, tag_actor_id, action_uuid)
    SELECT coalesce(u.tag_id, j.id), tag_action.actor_id, $2
    FROM untagged u
    LEFT JOIN just_tagged j ON u.response_id = j.response_id
    LEFT JOIN tag_action ON true
    RETURNING id
)
SELECT COUNT(1)::bigint AS provenance_count FROM new_provenance
"#;

/// Tag filter store backed by the target database
#[derive(Debug, Clone)]
pub struct PgTagFilterStore {
    pool: PgPool,
}

impl PgTagFilterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<TagFilter> {
        let status: String = row.try_get("status")?;
        Ok(TagFilter {
            id: row.try_get("id")?,
            tag_text: row.try_get("tag_text")?,
            search_text: row.try_get("search_text")?,
            status: status.parse().map_err(SyndicationError::DatabaseError)?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            last_run_at: row.try_get("last_run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TagFilterStore for PgTagFilterStore {
    async fn find(&self, id: i64) -> Result<Option<TagFilter>> {
        let row = sqlx::query(
            r#"
            SELECT id::bigint AS id, tag_text, search_text, status, start_date, end_date,
                   last_run_at, created_at, updated_at
            FROM tag_filters
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn count_with_status(&self, statuses: &[TagFilterStatus]) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*)::bigint FROM tag_filters WHERE status = ANY($1)")
            .bind(status_strings(statuses))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn ids_with_status(&self, status: TagFilterStatus) -> Result<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id::bigint FROM tag_filters WHERE status = $1 ORDER BY id")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn enqueue_if_idle(&self, from: &[TagFilterStatus]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(BULK_ENQUEUE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            r#"
            UPDATE tag_filters SET status = 'QUEUED'
            WHERE status = ANY($1)
              AND NOT EXISTS (SELECT 1 FROM tag_filters WHERE status = 'QUEUED')
            "#,
        )
        .bind(status_strings(from))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn transition(&self, id: i64, from: &[TagFilterStatus], to: TagFilterStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE tag_filters SET status = $3 WHERE id = $1 AND status = ANY($2)")
            .bind(id)
            .bind(status_strings(from))
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_status(&self, id: i64, status: TagFilterStatus) -> Result<()> {
        sqlx::query("UPDATE tag_filters SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update(&self, id: i64, update: &TagFilterUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tag_filters
            SET tag_text = COALESCE($2, tag_text),
                search_text = COALESCE($3, search_text),
                start_date = COALESCE($4, start_date),
                end_date = COALESCE($5, end_date),
                updated_at = now()
            WHERE id = $1 AND status = 'EDITING'
            "#,
        )
        .bind(id)
        .bind(update.tag_text.as_deref())
        .bind(update.search_text.as_deref())
        .bind(update.start_date)
        .bind(update.end_date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tag_filters WHERE id = $1 AND status = 'EDITING'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply(&self, id: i64, action_uuid: Uuid, ts_vector_language: &str) -> Result<u64> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        let inserted: i64 = sqlx::query_scalar(APPLY_FILTER_SQL)
            .bind(id)
            .bind(action_uuid.to_string())
            .bind(ts_vector_language)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE tag_filters SET status = 'ACTIVE', last_run_at = now() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let inserted = inserted.max(0) as u64;
        log_database_operation(
            "apply_tag_filter",
            Some("tag_provenance"),
            Some(inserted),
            "success",
            Some(started.elapsed().as_millis() as u64),
            Some(&format!("tag_filter_id {id}")),
        );
        Ok(inserted)
    }

    async fn undo(&self, id: i64) -> Result<UndoSummary> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        let actor_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id::bigint FROM tag_actors WHERE actor_entity_type = 'FILTER' AND actor_entity_id = $1",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        // Tags vouched for only by this filter's actors
        let orphaned_tag_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT p.tag_id::bigint
            FROM tag_provenance p
            WHERE p.tag_actor_id = ANY($1)
              AND NOT EXISTS (
                  SELECT 1 FROM tag_provenance other
                  WHERE other.tag_id = p.tag_id AND NOT (other.tag_actor_id = ANY($1))
              )
            "#,
        )
        .bind(&actor_ids)
        .fetch_all(&mut *tx)
        .await?;

        let provenance_deleted = sqlx::query("DELETE FROM tag_provenance WHERE tag_actor_id = ANY($1)")
            .bind(&actor_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let actors_deleted = sqlx::query("DELETE FROM tag_actors WHERE id = ANY($1)")
            .bind(&actor_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let tags_deleted = sqlx::query("DELETE FROM tags WHERE id = ANY($1)")
            .bind(&orphaned_tag_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("UPDATE tag_filters SET status = 'EDITING' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        log_database_operation(
            "undo_tag_filter",
            Some("tags"),
            Some(tags_deleted),
            "success",
            Some(started.elapsed().as_millis() as u64),
            Some(&format!("tag_filter_id {id}, {provenance_deleted} provenance rows")),
        );
        Ok(UndoSummary {
            provenance_deleted,
            actors_deleted,
            tags_deleted,
        })
    }
}

/// Process-local store for tests and the test environment. Applying a
/// filter tags the responses registered for it with [`Self::set_matches`].
#[derive(Debug, Default)]
pub struct InMemoryTagFilterStore {
    filters: Mutex<BTreeMap<i64, TagFilter>>,
    matches: Mutex<BTreeMap<i64, Vec<i64>>>,
    /// (filter id, response id) pairs tagged so far
    tagged: Mutex<HashSet<(i64, i64)>>,
    failing: Mutex<HashSet<i64>>,
}

impl InMemoryTagFilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: i64, tag_text: &str, status: TagFilterStatus) {
        let now = Utc::now();
        self.filters.lock().insert(
            id,
            TagFilter {
                id,
                tag_text: tag_text.to_string(),
                search_text: tag_text.to_string(),
                status,
                start_date: None,
                end_date: None,
                last_run_at: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub fn set_matches(&self, id: i64, response_ids: Vec<i64>) {
        self.matches.lock().insert(id, response_ids);
    }

    /// Make every following apply or undo of `id` fail
    pub fn fail_on(&self, id: i64) {
        self.failing.lock().insert(id);
    }

    pub fn status_of(&self, id: i64) -> Option<TagFilterStatus> {
        self.filters.lock().get(&id).map(|filter| filter.status)
    }

    pub fn tagged_count(&self, id: i64) -> usize {
        self.tagged.lock().iter().filter(|(filter, _)| *filter == id).count()
    }

    fn check_failure(&self, id: i64, operation: &str) -> Result<()> {
        if self.failing.lock().contains(&id) {
            return Err(SyndicationError::DatabaseError(format!(
                "{operation} of tag filter {id} failed"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TagFilterStore for InMemoryTagFilterStore {
    async fn find(&self, id: i64) -> Result<Option<TagFilter>> {
        Ok(self.filters.lock().get(&id).cloned())
    }

    async fn count_with_status(&self, statuses: &[TagFilterStatus]) -> Result<i64> {
        Ok(self
            .filters
            .lock()
            .values()
            .filter(|filter| statuses.contains(&filter.status))
            .count() as i64)
    }

    async fn ids_with_status(&self, status: TagFilterStatus) -> Result<Vec<i64>> {
        Ok(self
            .filters
            .lock()
            .values()
            .filter(|filter| filter.status == status)
            .map(|filter| filter.id)
            .collect())
    }

    async fn enqueue_if_idle(&self, from: &[TagFilterStatus]) -> Result<u64> {
        let mut filters = self.filters.lock();
        if filters.values().any(|filter| filter.status == TagFilterStatus::Queued) {
            return Ok(0);
        }
        let mut queued = 0;
        for filter in filters.values_mut() {
            if from.contains(&filter.status) {
                filter.status = TagFilterStatus::Queued;
                queued += 1;
            }
        }
        Ok(queued)
    }

    async fn transition(&self, id: i64, from: &[TagFilterStatus], to: TagFilterStatus) -> Result<bool> {
        let mut filters = self.filters.lock();
        match filters.get_mut(&id) {
            Some(filter) if from.contains(&filter.status) => {
                filter.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(&self, id: i64, status: TagFilterStatus) -> Result<()> {
        if let Some(filter) = self.filters.lock().get_mut(&id) {
            filter.status = status;
        }
        Ok(())
    }

    async fn update(&self, id: i64, update: &TagFilterUpdate) -> Result<bool> {
        let mut filters = self.filters.lock();
        let Some(filter) = filters.get_mut(&id) else {
            return Ok(false);
        };
        if filter.status != TagFilterStatus::Editing {
            return Ok(false);
        }
        if let Some(tag_text) = &update.tag_text {
            filter.tag_text = tag_text.clone();
        }
        if let Some(search_text) = &update.search_text {
            filter.search_text = search_text.clone();
        }
        if update.start_date.is_some() {
            filter.start_date = update.start_date;
        }
        if update.end_date.is_some() {
            filter.end_date = update.end_date;
        }
        filter.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let mut filters = self.filters.lock();
        match filters.get(&id) {
            Some(filter) if filter.status == TagFilterStatus::Editing => {
                filters.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply(&self, id: i64, _action_uuid: Uuid, _ts_vector_language: &str) -> Result<u64> {
        self.check_failure(id, "apply")?;
        let responses = self.matches.lock().get(&id).cloned().unwrap_or_default();
        let mut tagged = self.tagged.lock();
        let inserted = responses
            .into_iter()
            .filter(|response_id| tagged.insert((id, *response_id)))
            .count() as u64;

        if let Some(filter) = self.filters.lock().get_mut(&id) {
            filter.status = TagFilterStatus::Active;
            filter.last_run_at = Some(Utc::now());
        }
        Ok(inserted)
    }

    async fn undo(&self, id: i64) -> Result<UndoSummary> {
        self.check_failure(id, "undo")?;
        let mut tagged = self.tagged.lock();
        let before = tagged.len();
        tagged.retain(|(filter, _)| *filter != id);
        let removed = (before - tagged.len()) as u64;

        if let Some(filter) = self.filters.lock().get_mut(&id) {
            filter.status = TagFilterStatus::Editing;
        }
        Ok(UndoSummary {
            provenance_deleted: removed,
            actors_deleted: u64::from(removed > 0),
            tags_deleted: removed,
        })
    }
}
