// Test Helpers Module - In-memory collaborators
//
// Recording fakes of the external services the pipeline drives. Unit and
// integration tests assert on what a handler asked for; the `test`
// environment of the server binary runs against the same fakes.

use crate::cloud::{
    CloudError, CloudResult, CsvExportRequest, CsvImportRequest, InstanceDetails, ObjectStorage,
    SqlAdmin, Warehouse, WarehouseField, WarehouseLoadRequest,
};
use crate::config::{ServiceTypeMapping, SyndicationConfig};
use crate::constants::dispatch;
use crate::error::{Result, SyndicationError};
use crate::messaging::RecordingQueue;
use crate::orchestration::{
    ContinuationPayload, DeferralPolicy, HttpMethod, InMemoryRunStore, ResumeContext, RunStore,
    StepOutcome, StepRegistry, TaskChainOrchestrator,
};
use crate::progress::{InMemoryMessageHistoryStore, NotificationChannel, ProgressReporter};
use crate::syndication::migration::{MigrationReport, StagingMigrator};
use crate::syndication::{CloudServices, IdSpacePartition, MigrationEngine, SyndicationNaming, SyndicationSteps};
use crate::tagging::{BulkTagService, InMemoryTagFilterStore};
use crate::web::state::AppState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A message posted through [`RecordingChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub channel_id: String,
    pub text: String,
    pub thread_ts: Option<String>,
}

/// Notification channel that keeps everything it is sent
#[derive(Debug, Default)]
pub struct RecordingChannel {
    messages: Mutex<Vec<RecordedMessage>>,
    reactions: Mutex<Vec<String>>,
    sequence: AtomicU64,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.text.clone()).collect()
    }

    pub fn reactions(&self) -> Vec<String> {
        self.reactions.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn post_message(&self, channel_id: &str, text: &str, thread_ts: Option<&str>) -> CloudResult<Option<String>> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.messages.lock().push(RecordedMessage {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            thread_ts: thread_ts.map(str::to_string),
        });
        Ok(Some(format!("1700000000.{sequence:06}")))
    }

    async fn add_reaction(&self, _channel_id: &str, name: &str, _message_ts: &str) -> CloudResult<()> {
        self.reactions.lock().push(name.to_string());
        Ok(())
    }
}

/// SQL admin API with one instance per project and switchable busy state
#[derive(Debug, Default)]
pub struct FakeSqlAdmin {
    busy: Mutex<HashSet<String>>,
    exports: Mutex<Vec<(String, CsvExportRequest)>>,
    imports: Mutex<Vec<(String, CsvImportRequest)>>,
    failure: Mutex<Option<String>>,
}

impl FakeSqlAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_name(project: &str) -> String {
        format!("{project}-db")
    }

    pub fn service_account(project: &str) -> String {
        format!("{project}@gcp-sa-cloud-sql.iam.gserviceaccount.com")
    }

    /// Mark the project's instance as running an operation
    pub fn set_busy(&self, project: &str, busy: bool) {
        let mut projects = self.busy.lock();
        if busy {
            projects.insert(project.to_string());
        } else {
            projects.remove(project);
        }
    }

    /// Exports started, as (project, request)
    pub fn exports(&self) -> Vec<(String, CsvExportRequest)> {
        self.exports.lock().clone()
    }

    /// Imports started, as (project, request)
    pub fn imports(&self) -> Vec<(String, CsvImportRequest)> {
        self.imports.lock().clone()
    }

    /// Make every following call fail with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    fn check_failure(&self) -> CloudResult<()> {
        match self.failure.lock().clone() {
            Some(message) => Err(CloudError::transport("sqladmin", message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SqlAdmin for FakeSqlAdmin {
    async fn instance_details(&self, project: &str) -> CloudResult<InstanceDetails> {
        self.check_failure()?;
        Ok(InstanceDetails {
            project: project.to_string(),
            instance: Self::instance_name(project),
            service_account_email: Self::service_account(project),
        })
    }

    async fn most_recent_operation_done(&self, project: &str, _instance: &str) -> CloudResult<bool> {
        self.check_failure()?;
        Ok(!self.busy.lock().contains(project))
    }

    async fn start_export(&self, project: &str, _instance: &str, request: &CsvExportRequest) -> CloudResult<()> {
        self.check_failure()?;
        self.exports.lock().push((project.to_string(), request.clone()));
        Ok(())
    }

    async fn start_import(&self, project: &str, _instance: &str, request: &CsvImportRequest) -> CloudResult<()> {
        self.check_failure()?;
        self.imports.lock().push((project.to_string(), request.clone()));
        Ok(())
    }
}

/// Object storage recording buckets and grants
#[derive(Debug, Default)]
pub struct FakeObjectStorage {
    buckets: Mutex<Vec<String>>,
    bucket_writers: Mutex<Vec<(String, String)>>,
    object_readers: Mutex<Vec<(String, String, String)>>,
}

impl FakeObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buckets(&self) -> Vec<String> {
        self.buckets.lock().clone()
    }

    /// (bucket, email)
    pub fn bucket_writers(&self) -> Vec<(String, String)> {
        self.bucket_writers.lock().clone()
    }

    /// (bucket, object, email)
    pub fn object_readers(&self) -> Vec<(String, String, String)> {
        self.object_readers.lock().clone()
    }
}

#[async_trait]
impl ObjectStorage for FakeObjectStorage {
    async fn ensure_bucket(&self, _project: &str, bucket: &str, _location: &str) -> CloudResult<()> {
        let mut buckets = self.buckets.lock();
        if !buckets.iter().any(|b| b == bucket) {
            buckets.push(bucket.to_string());
        }
        Ok(())
    }

    async fn grant_bucket_writer(&self, bucket: &str, email: &str) -> CloudResult<()> {
        let grant = (bucket.to_string(), email.to_string());
        let mut writers = self.bucket_writers.lock();
        if !writers.contains(&grant) {
            writers.push(grant);
        }
        Ok(())
    }

    async fn grant_object_reader(&self, bucket: &str, object: &str, email: &str) -> CloudResult<()> {
        self.object_readers
            .lock()
            .push((bucket.to_string(), object.to_string(), email.to_string()));
        Ok(())
    }
}

/// Warehouse recording datasets, tables and load jobs
#[derive(Debug, Default)]
pub struct FakeWarehouse {
    datasets: Mutex<Vec<String>>,
    tables: Mutex<BTreeMap<String, Vec<WarehouseField>>>,
    loads: Mutex<Vec<WarehouseLoadRequest>>,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn datasets(&self) -> Vec<String> {
        self.datasets.lock().clone()
    }

    pub fn table_schema(&self, table_id: &str) -> Option<Vec<WarehouseField>> {
        self.tables.lock().get(table_id).cloned()
    }

    pub fn loads(&self) -> Vec<WarehouseLoadRequest> {
        self.loads.lock().clone()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn ensure_dataset(&self, _project: &str, dataset_id: &str, _location: &str) -> CloudResult<()> {
        let mut datasets = self.datasets.lock();
        if !datasets.iter().any(|d| d == dataset_id) {
            datasets.push(dataset_id.to_string());
        }
        Ok(())
    }

    async fn ensure_table(
        &self,
        _project: &str,
        _dataset_id: &str,
        table_id: &str,
        schema: &[WarehouseField],
        _location: &str,
    ) -> CloudResult<()> {
        self.tables
            .lock()
            .entry(table_id.to_string())
            .or_insert_with(|| schema.to_vec());
        Ok(())
    }

    async fn load_csv(&self, request: &WarehouseLoadRequest) -> CloudResult<String> {
        let mut loads = self.loads.lock();
        loads.push(request.clone());
        Ok(format!("job-{}", loads.len()))
    }
}

/// Staging migrator over an in-memory shared table. Each environment stages
/// local ids; migration writes `id + offset -> environment` rows.
#[derive(Debug, Default)]
pub struct FakeMigrator {
    staged: Mutex<BTreeMap<String, Vec<i64>>>,
    shared: Mutex<BTreeMap<i64, String>>,
    schemas: Mutex<Vec<(String, Vec<ServiceTypeMapping>)>>,
}

impl FakeMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, source_env: &str, local_ids: Vec<i64>) {
        self.staged.lock().insert(source_env.to_string(), local_ids);
    }

    /// Seed a locally created row of the target
    pub fn insert_local(&self, id: i64) {
        self.shared.lock().insert(id, "local".to_string());
    }

    pub fn shared_rows(&self) -> BTreeMap<i64, String> {
        self.shared.lock().clone()
    }

    /// Schemas recreated so far with the mappings they were seeded with
    pub fn schemas(&self) -> Vec<(String, Vec<ServiceTypeMapping>)> {
        self.schemas.lock().clone()
    }
}

#[async_trait]
impl StagingMigrator for FakeMigrator {
    async fn recreate_schema(&self, source_env: &str, mappings: &[ServiceTypeMapping]) -> Result<()> {
        self.schemas
            .lock()
            .push((source_env.to_string(), mappings.to_vec()));
        Ok(())
    }

    async fn migrate_environment(&self, source_env: &str, offset: i64) -> Result<MigrationReport> {
        let local_ids = self.staged.lock().get(source_env).cloned().unwrap_or_default();
        let mut shared = self.shared.lock();

        let before = shared.len();
        shared.retain(|id, _| *id < offset);
        let rows_deleted = (before - shared.len()) as u64;

        for id in &local_ids {
            shared.insert(id + offset, source_env.to_string());
        }

        Ok(MigrationReport {
            source_environment: source_env.to_string(),
            offset,
            rows_deleted,
            rows_inserted: local_ids.len() as u64,
        })
    }
}

/// Configuration of a two-source deployment used throughout the tests
pub fn test_config() -> SyndicationConfig {
    let mut config = SyndicationConfig::default();
    config.environment = "test".to_string();
    config.gcp.project = "kujakuja-ofda-prod".to_string();
    config.syndication.target_environment = "ofda".to_string();
    config.syndication.source_environments = vec!["crc".to_string(), "nrc".to_string()];
    config.notifications.enabled = true;
    config.notifications.channel_id = "C0SYNDICATION".to_string();
    config.deferral.max_attempts = 3;
    config.deferral.jitter_factor = 0.0;
    config
}

/// The whole pipeline wired over in-memory collaborators
pub struct TestPipeline {
    pub config: SyndicationConfig,
    pub queue: Arc<RecordingQueue>,
    pub channel: Arc<RecordingChannel>,
    pub history: Arc<InMemoryMessageHistoryStore>,
    pub runs: Arc<InMemoryRunStore>,
    pub sql: Arc<FakeSqlAdmin>,
    pub storage: Arc<FakeObjectStorage>,
    pub warehouse: Arc<FakeWarehouse>,
    pub migrator: Arc<FakeMigrator>,
    pub tag_filters: Arc<InMemoryTagFilterStore>,
    pub progress: Arc<ProgressReporter>,
    pub orchestrator: Arc<TaskChainOrchestrator>,
    pub tagging: Arc<BulkTagService>,
    pub steps: Arc<SyndicationSteps>,
}

impl std::fmt::Debug for TestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPipeline")
            .field("dispatched", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SyndicationConfig) -> Self {
        Self::with_registry(config, StepRegistry::standard())
    }

    pub fn with_registry(config: SyndicationConfig, registry: StepRegistry) -> Self {
        let queue = Arc::new(RecordingQueue::new());
        let channel = Arc::new(RecordingChannel::new());
        let history = Arc::new(InMemoryMessageHistoryStore::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let sql = Arc::new(FakeSqlAdmin::new());
        let storage = Arc::new(FakeObjectStorage::new());
        let warehouse = Arc::new(FakeWarehouse::new());
        let migrator = Arc::new(FakeMigrator::new());
        let tag_filters = Arc::new(InMemoryTagFilterStore::new());

        let label = SyndicationNaming::new(&config).target_project();
        let progress = Arc::new(ProgressReporter::new(
            channel.clone(),
            history.clone(),
            config.notifications.channel_id.clone(),
        ));
        let orchestrator = Arc::new(TaskChainOrchestrator::new(
            Arc::new(registry),
            queue.clone(),
            runs.clone(),
            progress.clone(),
            DeferralPolicy::from(&config.deferral),
            config.queues.clone(),
            label.clone(),
        ));
        let tagging = Arc::new(BulkTagService::new(
            tag_filters.clone(),
            queue.clone(),
            progress.clone(),
            config.queues.clone(),
            config.tagging.ts_vector_language(),
            label,
        ));
        let migration = Arc::new(MigrationEngine::new(
            migrator.clone(),
            IdSpacePartition::from(&config.id_space),
            config.syndication.clone(),
        ));
        let cloud = CloudServices {
            sql: sql.clone(),
            storage: storage.clone(),
            warehouse: warehouse.clone(),
        };
        let steps = Arc::new(SyndicationSteps::new(
            orchestrator.clone(),
            cloud,
            migration,
            tagging.clone(),
            &config,
        ));

        Self {
            config,
            queue,
            channel,
            history,
            runs,
            sql,
            storage,
            warehouse,
            migrator,
            tag_filters,
            progress,
            orchestrator,
            tagging,
            steps,
        }
    }

    /// Payloads of every chain dispatch so far, in order. Single-hop
    /// tagging tasks carry no continuation and are skipped.
    pub fn payloads(&self) -> Vec<ContinuationPayload> {
        self.queue
            .dispatched()
            .iter()
            .filter_map(|request| match request.method {
                HttpMethod::Post => request
                    .body
                    .as_deref()
                    .and_then(|body| ContinuationPayload::decode(body).ok()),
                HttpMethod::Get => {
                    let marker = format!("{}=", dispatch::CONTEXT_QUERY_PARAM);
                    request
                        .relative_uri
                        .split_once(&marker)
                        .and_then(|(_, raw)| ContinuationPayload::decode(raw).ok())
                }
            })
            .collect()
    }

    /// Web state over the same collaborators
    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::new(self.config.clone()),
            self.steps.clone(),
            self.tagging.clone(),
            self.history.clone(),
        )
    }

    pub fn last_payload(&self) -> Option<ContinuationPayload> {
        self.payloads().pop()
    }

    /// A continuation for `context` that the stored run accepts, as if the
    /// chain had just dispatched it: the run moves to the context's step and
    /// claims the next dispatch sequence.
    pub async fn continuation_at(&self, run_id: Uuid, context: ResumeContext) -> Result<ContinuationPayload> {
        let mut run = self
            .runs
            .load(run_id)
            .await?
            .ok_or_else(|| SyndicationError::Internal(format!("run {run_id} is not stored")))?;
        run.skip_to(Some(context.step()));
        let sequence = run.next_dispatch();
        self.runs.save(&run).await?;
        Ok(ContinuationPayload::new(run_id, context).with_sequence(sequence))
    }

    /// Deliver the most recent continuation to its handler
    pub async fn deliver_last(&self) -> Result<StepOutcome> {
        let payload = self
            .last_payload()
            .ok_or_else(|| SyndicationError::Internal("nothing was dispatched".to_string()))?;
        self.steps.handle(payload).await
    }
}

impl Default for TestPipeline {
    fn default() -> Self {
        Self::new()
    }
}
