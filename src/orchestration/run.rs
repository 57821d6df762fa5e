//! # Pipeline Runs
//!
//! A `PipelineRun` is the orchestrator's state for one syndication run: the
//! step currently in flight and the progress thread it reports to. Runs are
//! plain values; the transitions below are pure and the orchestrator persists
//! the result through a [`RunStore`], keyed by the run id every continuation
//! payload carries. Two triggers therefore produce two independent runs
//! instead of one clobbering the other.
//!
//! Every dispatch bumps the run's `sequence` and stamps it on the payload.
//! The queue delivers at least once, so a continuation is only acted on
//! while its sequence is the one the run last dispatched.

use super::registry::StepRegistry;
use super::step::StepName;
use crate::error::{Result, SyndicationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    /// Superseded by a newer run
    Abandoned,
    /// A step gave up waiting on its backend operation
    DeadLettered,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Abandoned => "abandoned",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "abandoned" => Ok(Self::Abandoned),
            "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(format!("Invalid run status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub current: Option<StepName>,
    /// Correlation handle of the progress thread, once one was started
    pub thread_ts: Option<String>,
    pub status: RunStatus,
    /// Sequence of the last continuation dispatched for this run
    #[serde(default)]
    pub sequence: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Fresh run positioned at the head of the chain
    pub fn initiate(registry: &StepRegistry) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            current: Some(registry.head()),
            thread_ts: None,
            status: RunStatus::Running,
            sequence: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Run reconstructed from a continuation whose stored state is gone
    pub fn reconstructed(run_id: Uuid, step: StepName, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            current: Some(step),
            thread_ts: None,
            status: RunStatus::Running,
            sequence,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Move to the successor of the current step. Returns the step to
    /// dispatch; `None` once the chain is exhausted, which finishes the run.
    pub fn advance(&mut self, registry: &StepRegistry) -> Option<StepName> {
        let next = self.current.and_then(|step| registry.successor(step));
        self.current = next;
        if next.is_none() {
            self.status = RunStatus::Finished;
        }
        self.touch();
        next
    }

    /// The step to re-dispatch; never changes `current`
    pub fn requeue(&self) -> Option<StepName> {
        self.current
    }

    pub fn skip_to(&mut self, step: Option<StepName>) -> Option<StepName> {
        self.current = step;
        self.touch();
        step
    }

    /// Skip by string name. An unknown or unregistered name leaves the run
    /// with no current step, and nothing is dispatched.
    pub fn skip_to_named(&mut self, name: &str, registry: &StepRegistry) -> Option<StepName> {
        let step = registry.lookup(name);
        self.skip_to(step)
    }

    /// Whether a continuation for `step` stamped with `sequence` is the one
    /// this run is waiting on
    pub fn expects(&self, step: StepName, sequence: u64) -> bool {
        self.current == Some(step) && self.sequence == sequence
    }

    /// Claim the sequence of the next dispatch
    pub fn next_dispatch(&mut self) -> u64 {
        self.sequence += 1;
        self.touch();
        self.sequence
    }

    pub fn attach_thread(&mut self, thread_ts: impl Into<String>) {
        self.thread_ts = Some(thread_ts.into());
        self.touch();
    }

    pub fn finish(&mut self) {
        self.status = RunStatus::Finished;
        self.touch();
    }

    pub fn abandon(&mut self) {
        self.status = RunStatus::Abandoned;
        self.touch();
    }

    pub fn dead_letter(&mut self) {
        self.status = RunStatus::DeadLettered;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Durable home for pipeline runs
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: &PipelineRun) -> Result<()>;
    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>>;
    /// Most recently started run that is still running
    async fn latest_running(&self) -> Result<Option<PipelineRun>>;
}

/// Process-local run store
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, PipelineRun>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<()> {
        self.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        Ok(self.runs.get(&run_id).map(|entry| entry.value().clone()))
    }

    async fn latest_running(&self) -> Result<Option<PipelineRun>> {
        Ok(self
            .runs
            .iter()
            .filter(|entry| entry.value().is_running())
            .max_by_key(|entry| entry.value().started_at)
            .map(|entry| entry.value().clone()))
    }
}

/// Run store backed by the `syndication_runs` table
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<PipelineRun> {
        let current: Option<String> = row.try_get("current_step")?;
        let status: String = row.try_get("status")?;
        let sequence: i64 = row.try_get("sequence")?;

        let current = match current {
            Some(name) => match name.parse::<StepName>() {
                Ok(step) => Some(step),
                Err(e) => {
                    warn!(error = %e, "Stored run references an unknown step");
                    None
                }
            },
            None => None,
        };

        Ok(PipelineRun {
            run_id: row.try_get("run_id")?,
            current,
            thread_ts: row.try_get("thread_ts")?,
            status: status
                .parse()
                .map_err(SyndicationError::DatabaseError)?,
            sequence: u64::try_from(sequence).unwrap_or_default(),
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO syndication_runs (run_id, current_step, thread_ts, status, sequence, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO UPDATE
            SET current_step = EXCLUDED.current_step,
                thread_ts = EXCLUDED.thread_ts,
                status = EXCLUDED.status,
                sequence = EXCLUDED.sequence,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run.run_id)
        .bind(run.current.map(|step| step.as_str()))
        .bind(run.thread_ts.as_deref())
        .bind(run.status.as_str())
        .bind(i64::try_from(run.sequence).unwrap_or(i64::MAX))
        .bind(run.started_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, current_step, thread_ts, status, sequence, started_at, updated_at
            FROM syndication_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn latest_running(&self) -> Result<Option<PipelineRun>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, current_step, thread_ts, status, sequence, started_at, updated_at
            FROM syndication_runs
            WHERE status = 'running'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }
}
