//! # Syndication Step Handlers
//!
//! One handler per pipeline step. Every invocation does at most one bounded
//! unit of work (one export, one import, one migration pass, one warehouse
//! job) and then tells the orchestrator how to continue:
//!
//! - the backend instance is still busy: `defer` the same step
//! - more tables or environments remain: `requeue_task` with the next ones
//! - the step is complete: `task_done`
//!
//! Continuations naming an unknown table, or belonging to a run that is no
//! longer running, are dropped without dispatching anything.

use super::migration::MigrationEngine;
use super::naming::SyndicationNaming;
use super::tables::{self, SyndicatedTable};
use super::warehouse_export;
use crate::cloud::{
    CsvExportRequest, CsvImportRequest, InstanceDetails, ObjectStorage, SqlAdmin, Warehouse,
    WarehouseLoadRequest,
};
use crate::config::SyndicationConfig;
use crate::constants::progress::CHECK_MARK;
use crate::error::Result;
use crate::logging::log_step_operation;
use crate::orchestration::{
    ContinuationPayload, PipelineRun, ResumeContext, StepName, StepOutcome, TaskChainOrchestrator,
};
use crate::tagging::BulkTagService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// External services the handlers drive
#[derive(Clone)]
pub struct CloudServices {
    pub sql: Arc<dyn SqlAdmin>,
    pub storage: Arc<dyn ObjectStorage>,
    pub warehouse: Arc<dyn Warehouse>,
}

impl std::fmt::Debug for CloudServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudServices").finish_non_exhaustive()
    }
}

pub struct SyndicationSteps {
    orchestrator: Arc<TaskChainOrchestrator>,
    cloud: CloudServices,
    migration: Arc<MigrationEngine>,
    tagging: Arc<BulkTagService>,
    naming: SyndicationNaming,
    source_environments: Vec<String>,
    grant_object_readers: bool,
    local_threshold: i64,
    bucket_location: String,
}

impl std::fmt::Debug for SyndicationSteps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyndicationSteps")
            .field("source_environments", &self.source_environments)
            .field("target_environment", &self.naming.target_environment())
            .finish_non_exhaustive()
    }
}

impl SyndicationSteps {
    pub fn new(
        orchestrator: Arc<TaskChainOrchestrator>,
        cloud: CloudServices,
        migration: Arc<MigrationEngine>,
        tagging: Arc<BulkTagService>,
        config: &SyndicationConfig,
    ) -> Self {
        Self {
            orchestrator,
            cloud,
            migration,
            tagging,
            naming: SyndicationNaming::new(config),
            source_environments: config.syndication.active_source_environments(),
            grant_object_readers: config.syndication.grant_object_readers,
            local_threshold: config.id_space.local_threshold,
            bucket_location: config.gcp.location.clone(),
        }
    }

    pub fn orchestrator(&self) -> &TaskChainOrchestrator {
        &self.orchestrator
    }

    pub fn naming(&self) -> &SyndicationNaming {
        &self.naming
    }

    /// Start a new run: prepare the shared bucket and dispatch the head of
    /// the chain, or jump straight to the warehouse export when there is
    /// nothing to syndicate.
    pub async fn trigger(&self) -> Result<(PipelineRun, StepOutcome)> {
        let mut run = self.orchestrator.initiate().await?;

        let target = self.target_instance().await?;
        let bucket = self.naming.bucket();
        self.cloud
            .storage
            .ensure_bucket(&target.project, &bucket, &self.bucket_location)
            .await?;
        // The target instance writes the warehouse exports
        self.cloud
            .storage
            .grant_bucket_writer(&bucket, &target.service_account_email)
            .await?;

        if self.source_environments.is_empty() {
            info!(run_id = %run.run_id, "No source environments; skipping to warehouse export");
            let outcome = self
                .orchestrator
                .skip_to_task(&mut run, StepName::WarehouseExport, None, Duration::ZERO)
                .await?;
            return Ok((run, outcome));
        }

        self.orchestrator
            .send_progress_message(&run, "*Syndication* :repeat:")
            .await;
        let context = match run.current {
            Some(StepName::Export) => Some(self.export_context(tables::first(), self.source_environments.clone())),
            Some(StepName::Import) => Some(ResumeContext::Import {
                table_name: tables::first().name.to_string(),
                source_environments: self.source_environments.clone(),
                last_source_environment: None,
            }),
            _ => None,
        };
        let outcome = self.orchestrator.start(&mut run, context, Duration::ZERO).await?;
        Ok((run, outcome))
    }

    /// Resume the run a continuation belongs to and run its step
    pub async fn handle(&self, payload: ContinuationPayload) -> Result<StepOutcome> {
        let step = payload.step();
        let Some(mut run) = self.orchestrator.resume(&payload).await? else {
            return Ok(StepOutcome::Dropped);
        };

        let attempt = payload.attempt;
        let outcome = match payload.context {
            ResumeContext::Export {
                table_name,
                source_environments,
            } => self.export(&mut run, attempt, table_name, source_environments).await?,
            ResumeContext::CreateSchemas {
                last_source_environment,
            } => self.create_schemas(&mut run, last_source_environment).await?,
            ResumeContext::Import {
                table_name,
                source_environments,
                last_source_environment,
            } => {
                self.import(&mut run, attempt, table_name, source_environments, last_source_environment)
                    .await?
            }
            ResumeContext::Migrate {
                last_source_environment,
            } => self.migrate(&mut run, attempt, last_source_environment).await?,
            ResumeContext::WarehouseExport { with_tags } => {
                self.warehouse_export(&mut run, attempt, with_tags).await?
            }
            ResumeContext::WarehouseLoad { with_tags } => {
                self.warehouse_load(&mut run, attempt, with_tags).await?
            }
            ResumeContext::BulkTag => self.bulk_tag(&mut run, attempt).await?,
        };

        log_step_operation(
            "handle",
            Some(run.run_id),
            Some(step.as_str()),
            None,
            outcome.as_str(),
            Some(&format!("attempt {attempt}")),
        );
        Ok(outcome)
    }

    async fn export(
        &self,
        run: &mut PipelineRun,
        attempt: u32,
        table_name: String,
        source_environments: Vec<String>,
    ) -> Result<StepOutcome> {
        let Some(table) = tables::find(&table_name) else {
            return Ok(self
                .orchestrator
                .record_dropped_payload(StepName::Export, &format!("unknown table '{table_name}'")));
        };
        let Some(env) = source_environments.first().cloned() else {
            return Ok(self
                .orchestrator
                .record_dropped_payload(StepName::Export, "no source environment left"));
        };

        let source = self.source_instance(&env).await?;
        if !self.is_idle(&source).await? {
            debug!(source_environment = %env, table = table.name, "Source instance busy; deferring export");
            let context = self.export_context(table, source_environments);
            return self.orchestrator.defer(run, attempt, context).await;
        }

        let bucket = self.naming.bucket();
        self.cloud
            .storage
            .grant_bucket_writer(&bucket, &source.service_account_email)
            .await?;

        let object = self.naming.export_object(&env, table.name);
        let request = CsvExportRequest {
            uri: self.naming.object_uri(&object),
            database: self.naming.source_database(&env),
            tables: vec![table.name.to_string()],
            select_query: table.export_query(self.local_threshold),
        };
        self.cloud
            .sql
            .start_export(&source.project, &source.instance, &request)
            .await?;
        log_step_operation(
            "export",
            Some(run.run_id),
            Some(StepName::Export.as_str()),
            Some(&env),
            "started",
            Some(&request.uri),
        );

        if let Some(next) = table.successor() {
            let context = self.export_context(next, source_environments);
            return self
                .orchestrator
                .requeue_task(run, context, self.orchestrator.default_delay())
                .await;
        }

        self.orchestrator
            .send_progress_message(run, &format!("- export {env} :{CHECK_MARK}:"))
            .await;
        let remaining: Vec<String> = source_environments.into_iter().skip(1).collect();
        if remaining.is_empty() {
            self.orchestrator
                .task_done(
                    run,
                    Some(ResumeContext::CreateSchemas {
                        last_source_environment: Some(env),
                    }),
                    Duration::ZERO,
                )
                .await
        } else {
            // The next environment exports from a different instance
            let context = self.export_context(tables::first(), remaining);
            self.orchestrator
                .requeue_task(run, context, Duration::ZERO)
                .await
        }
    }

    async fn create_schemas(
        &self,
        run: &mut PipelineRun,
        last_source_environment: Option<String>,
    ) -> Result<StepOutcome> {
        if self.source_environments.is_empty() {
            return self
                .orchestrator
                .skip_to_task(run, StepName::WarehouseExport, None, Duration::ZERO)
                .await;
        }

        let created = self
            .migration
            .create_all_schemas(&self.source_environments)
            .await?;
        for env in &created {
            self.orchestrator
                .send_progress_message(run, &format!("- drop and create schema {env} :{CHECK_MARK}:"))
                .await;
        }

        // Schema creation is synchronous; nothing to wait for
        self.orchestrator
            .task_done(
                run,
                Some(ResumeContext::Import {
                    table_name: tables::first().name.to_string(),
                    source_environments: self.source_environments.clone(),
                    last_source_environment,
                }),
                Duration::ZERO,
            )
            .await
    }

    async fn import(
        &self,
        run: &mut PipelineRun,
        attempt: u32,
        table_name: String,
        source_environments: Vec<String>,
        last_source_environment: Option<String>,
    ) -> Result<StepOutcome> {
        let Some(table) = tables::find(&table_name) else {
            return Ok(self
                .orchestrator
                .record_dropped_payload(StepName::Import, &format!("unknown table '{table_name}'")));
        };
        let Some(env) = source_environments.first().cloned() else {
            return Ok(self
                .orchestrator
                .record_dropped_payload(StepName::Import, "no source environment left"));
        };

        // Only the first import waits for the final export to finish
        let mut last_export_done = true;
        if let Some(last) = &last_source_environment {
            let last_source = self.source_instance(last).await?;
            last_export_done = self.is_idle(&last_source).await?;
        }
        let target = self.target_instance().await?;
        if !last_export_done || !self.is_idle(&target).await? {
            debug!(source_environment = %env, table = table.name, "Instance busy; deferring import");
            let context = ResumeContext::Import {
                table_name,
                source_environments,
                last_source_environment,
            };
            return self.orchestrator.defer(run, attempt, context).await;
        }

        let object = self.naming.export_object(&env, table.name);
        if self.grant_object_readers {
            self.cloud
                .storage
                .grant_object_reader(&self.naming.bucket(), &object, &target.service_account_email)
                .await?;
        }

        let request = CsvImportRequest {
            uri: self.naming.object_uri(&object),
            database: self.naming.target_database(),
            table: self.naming.staging_table(&env, table.name),
        };
        self.cloud
            .sql
            .start_import(&target.project, &target.instance, &request)
            .await?;
        log_step_operation(
            "import",
            Some(run.run_id),
            Some(StepName::Import.as_str()),
            Some(&env),
            "started",
            Some(&request.table),
        );

        // Every import runs on the target instance, so each hop waits the default delay
        let delay = self.orchestrator.default_delay();
        if let Some(next) = table.successor() {
            let context = ResumeContext::Import {
                table_name: next.name.to_string(),
                source_environments,
                last_source_environment: None,
            };
            return self.orchestrator.requeue_task(run, context, delay).await;
        }

        self.orchestrator
            .send_progress_message(run, &format!("- import {env} :{CHECK_MARK}:"))
            .await;
        let remaining: Vec<String> = source_environments.into_iter().skip(1).collect();
        if remaining.is_empty() {
            self.orchestrator
                .task_done(
                    run,
                    Some(ResumeContext::Migrate {
                        last_source_environment: Some(env),
                    }),
                    delay,
                )
                .await
        } else {
            let context = ResumeContext::Import {
                table_name: tables::first().name.to_string(),
                source_environments: remaining,
                last_source_environment: None,
            };
            self.orchestrator.requeue_task(run, context, delay).await
        }
    }

    async fn migrate(
        &self,
        run: &mut PipelineRun,
        attempt: u32,
        last_source_environment: Option<String>,
    ) -> Result<StepOutcome> {
        let mut ready = true;
        if let Some(last) = &last_source_environment {
            let last_source = self.source_instance(last).await?;
            ready = self.is_idle(&last_source).await?;
        }
        // The final import must have landed before merging
        if ready {
            let target = self.target_instance().await?;
            ready = self.is_idle(&target).await?;
        }
        if !ready {
            let context = ResumeContext::Migrate {
                last_source_environment,
            };
            return self.orchestrator.defer(run, attempt, context).await;
        }

        let reports = self
            .migration
            .migrate_all_data(&self.source_environments)
            .await?;

        self.orchestrator
            .send_progress_message(run, &format!("- delete previously migrated data :{CHECK_MARK}:"))
            .await;
        for report in &reports {
            self.orchestrator
                .progress()
                .record_datafix(&report.audit_body(self.naming.target_environment()))
                .await;
            self.orchestrator
                .send_progress_message(
                    run,
                    &format!("- migrate {} :{CHECK_MARK}:", report.source_environment),
                )
                .await;
        }

        self.orchestrator.task_done(run, None, Duration::ZERO).await
    }

    async fn warehouse_export(&self, run: &mut PipelineRun, attempt: u32, with_tags: bool) -> Result<StepOutcome> {
        let target = self.target_instance().await?;
        if !self.is_idle(&target).await? {
            return self
                .orchestrator
                .defer(run, attempt, ResumeContext::WarehouseExport { with_tags })
                .await;
        }

        let (header, done) = if with_tags {
            ("*BigQuery with tags :repeat:*", "- responses with tags export")
        } else {
            ("*BigQuery :repeat:*", "- responses export")
        };
        self.orchestrator.send_progress_message(run, header).await;

        let request = CsvExportRequest {
            uri: self.naming.object_uri(&self.naming.warehouse_object(with_tags)),
            database: self.naming.target_database(),
            tables: warehouse_export::export_tables(with_tags),
            select_query: warehouse_export::export_query(with_tags),
        };
        self.cloud
            .sql
            .start_export(&target.project, &target.instance, &request)
            .await?;
        self.orchestrator
            .send_progress_message(run, &format!("{done} :{CHECK_MARK}:"))
            .await;

        // The load waits for this export to finish
        self.orchestrator
            .task_done(run, None, self.orchestrator.default_delay())
            .await
    }

    async fn warehouse_load(&self, run: &mut PipelineRun, attempt: u32, with_tags: bool) -> Result<StepOutcome> {
        let target = self.target_instance().await?;
        if !self.is_idle(&target).await? {
            return self
                .orchestrator
                .defer(run, attempt, ResumeContext::WarehouseLoad { with_tags })
                .await;
        }

        let project = self.naming.target_project();
        let dataset_id = self.naming.warehouse_dataset().to_string();
        let location = self.naming.warehouse_location().to_string();
        let table_id = self.naming.warehouse_table(with_tags);
        let schema = warehouse_export::table_schema(with_tags);

        self.cloud
            .warehouse
            .ensure_dataset(&project, &dataset_id, &location)
            .await?;
        self.cloud
            .warehouse
            .ensure_table(&project, &dataset_id, &table_id, &schema, &location)
            .await?;
        let job_id = self
            .cloud
            .warehouse
            .load_csv(&WarehouseLoadRequest {
                project,
                dataset_id,
                table_id: table_id.clone(),
                source_uri: self.naming.object_uri(&self.naming.warehouse_object(with_tags)),
                schema,
                location,
            })
            .await?;
        info!(run_id = %run.run_id, table_id = %table_id, job_id = %job_id, "Warehouse load started");

        let done = if with_tags {
            "- responses with tags upload"
        } else {
            "- responses upload"
        };
        self.orchestrator
            .send_progress_message(run, &format!("{done} :{CHECK_MARK}:"))
            .await;

        // Warehouse loads do not occupy the SQL instance
        self.orchestrator.task_done(run, None, Duration::ZERO).await
    }

    async fn bulk_tag(&self, run: &mut PipelineRun, attempt: u32) -> Result<StepOutcome> {
        if self.tagging.has_queued().await? {
            return self
                .orchestrator
                .defer(run, attempt, ResumeContext::BulkTag)
                .await;
        }

        self.orchestrator
            .send_progress_message(run, "*Bulk Tagging* :label:")
            .await;
        if self.tagging.has_pending().await? {
            self.orchestrator
                .send_progress_message(run, "Performing daily bulk tagging of all filters")
                .await;
            if self.tagging.enqueue_pending().await? == 0 && self.tagging.has_queued().await? {
                // An operator bulk pass got in first
                return self
                    .orchestrator
                    .defer(run, attempt, ResumeContext::BulkTag)
                    .await;
            }
            let summary = self.tagging.apply_queued(run.thread_ts.as_deref()).await?;
            info!(
                run_id = %run.run_id,
                applied = summary.applied.len(),
                failed = summary.failed.len(),
                "Daily bulk tagging finished"
            );
        }
        self.orchestrator
            .send_progress_message(run, &format!("- bulk tagging complete :{CHECK_MARK}:"))
            .await;

        self.orchestrator.task_done(run, None, Duration::ZERO).await
    }

    fn export_context(&self, table: &SyndicatedTable, source_environments: Vec<String>) -> ResumeContext {
        ResumeContext::Export {
            table_name: table.name.to_string(),
            source_environments,
        }
    }

    async fn target_instance(&self) -> Result<InstanceDetails> {
        Ok(self
            .cloud
            .sql
            .instance_details(&self.naming.target_project())
            .await?)
    }

    async fn source_instance(&self, source_env: &str) -> Result<InstanceDetails> {
        Ok(self
            .cloud
            .sql
            .instance_details(&self.naming.source_project(source_env))
            .await?)
    }

    async fn is_idle(&self, instance: &InstanceDetails) -> Result<bool> {
        Ok(self
            .cloud
            .sql
            .most_recent_operation_done(&instance.project, &instance.instance)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{RunStatus, RunStore};
    use crate::tagging::TagFilterStatus;
    use crate::test_helpers::{test_config, FakeSqlAdmin, TestPipeline};

    const TARGET_PROJECT: &str = "kujakuja-ofda-prod";

    async fn run_until_finished(pipeline: &TestPipeline) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..100 {
            let outcome = pipeline.deliver_last().await.unwrap();
            outcomes.push(outcome);
            if outcome == StepOutcome::Finished {
                break;
            }
        }
        outcomes
    }

    #[tokio::test]
    async fn test_trigger_prepares_bucket_and_starts_export() {
        let pipeline = TestPipeline::new();
        let (run, outcome) = pipeline.steps.trigger().await.unwrap();

        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(run.current, Some(StepName::Export));
        assert_eq!(pipeline.storage.buckets(), vec!["kujakuja-ofda-prod-syndication".to_string()]);
        assert_eq!(
            pipeline.storage.bucket_writers(),
            vec![(
                "kujakuja-ofda-prod-syndication".to_string(),
                FakeSqlAdmin::service_account(TARGET_PROJECT)
            )]
        );

        let payload = pipeline.last_payload().unwrap();
        assert_eq!(payload.run_id, run.run_id);
        assert_eq!(
            payload.context,
            ResumeContext::Export {
                table_name: "countries".to_string(),
                source_environments: vec!["crc".to_string(), "nrc".to_string()],
            }
        );
        assert!(pipeline
            .channel
            .texts()
            .contains(&"*Syndication* :repeat:".to_string()));
    }

    #[tokio::test]
    async fn test_trigger_without_sources_skips_to_warehouse_export() {
        let mut config = test_config();
        config.syndication.source_environments = vec!["None".to_string()];
        let pipeline = TestPipeline::with_config(config);

        let (run, outcome) = pipeline.steps.trigger().await.unwrap();
        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(run.current, Some(StepName::WarehouseExport));
        assert_eq!(
            pipeline.last_payload().unwrap().context,
            ResumeContext::WarehouseExport { with_tags: false }
        );
    }

    #[tokio::test]
    async fn test_export_of_unknown_table_is_dropped() {
        let pipeline = TestPipeline::new();
        let (run, _) = pipeline.steps.trigger().await.unwrap();
        let dispatched = pipeline.queue.len();

        let payload = pipeline
            .continuation_at(
                run.run_id,
                ResumeContext::Export {
                    table_name: "passwords".to_string(),
                    source_environments: vec!["crc".to_string()],
                },
            )
            .await
            .unwrap();
        let outcome = pipeline.steps.handle(payload).await.unwrap();

        assert_eq!(outcome, StepOutcome::Dropped);
        assert_eq!(pipeline.queue.len(), dispatched);
        assert!(pipeline.sql.exports().is_empty());
        assert_eq!(pipeline.orchestrator.stats().dropped_payloads, 1);
    }

    #[tokio::test]
    async fn test_export_defers_while_source_instance_busy() {
        let pipeline = TestPipeline::new();
        pipeline.steps.trigger().await.unwrap();
        pipeline.sql.set_busy("kujakuja-crc-prod", true);

        let outcome = pipeline.deliver_last().await.unwrap();
        assert_eq!(outcome, StepOutcome::Deferred);
        assert!(pipeline.sql.exports().is_empty());

        let payload = pipeline.last_payload().unwrap();
        assert_eq!(payload.attempt, 1);
        assert_eq!(payload.step(), StepName::Export);
    }

    #[tokio::test]
    async fn test_export_loops_tables_then_environments() {
        let pipeline = TestPipeline::new();
        pipeline.steps.trigger().await.unwrap();

        for _ in 0..tables::TABLES.len() {
            assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Requeued);
        }
        assert_eq!(
            pipeline.last_payload().unwrap().context,
            ResumeContext::Export {
                table_name: "countries".to_string(),
                source_environments: vec!["nrc".to_string()],
            }
        );

        for _ in 0..tables::TABLES.len() - 1 {
            pipeline.deliver_last().await.unwrap();
        }
        assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Advanced);
        assert_eq!(
            pipeline.last_payload().unwrap().context,
            ResumeContext::CreateSchemas {
                last_source_environment: Some("nrc".to_string()),
            }
        );

        let exports = pipeline.sql.exports();
        assert_eq!(exports.len(), 2 * tables::TABLES.len());
        let (project, first) = &exports[0];
        assert_eq!(project, "kujakuja-crc-prod");
        assert_eq!(first.uri, "gs://kujakuja-ofda-prod-syndication/crc-prod-countries.csv");
        assert!(first.select_query.contains("WHERE id < 1000000000"));
        assert!(pipeline
            .channel
            .texts()
            .contains(&"- export crc :heavy_check_mark:".to_string()));
    }

    #[tokio::test]
    async fn test_import_grants_object_reader_unless_disabled() {
        for grant in [true, false] {
            let mut config = test_config();
            config.syndication.grant_object_readers = grant;
            let pipeline = TestPipeline::with_config(config);
            let (run, _) = pipeline.steps.trigger().await.unwrap();

            let payload = pipeline
                .continuation_at(
                    run.run_id,
                    ResumeContext::Import {
                        table_name: "users".to_string(),
                        source_environments: vec!["crc".to_string()],
                        last_source_environment: Some("nrc".to_string()),
                    },
                )
                .await
                .unwrap();
            assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Requeued);

            let imports = pipeline.sql.imports();
            assert_eq!(imports.len(), 1);
            assert_eq!(imports[0].0, TARGET_PROJECT);
            assert_eq!(imports[0].1.table, "\"crc\".users");
            assert_eq!(pipeline.storage.object_readers().len(), usize::from(grant));
            assert_eq!(
                pipeline.last_payload().unwrap().context,
                ResumeContext::Import {
                    table_name: "responses".to_string(),
                    source_environments: vec!["crc".to_string()],
                    last_source_environment: None,
                }
            );
        }
    }

    #[tokio::test]
    async fn test_first_import_waits_for_last_export() {
        let pipeline = TestPipeline::new();
        let (run, _) = pipeline.steps.trigger().await.unwrap();
        pipeline.sql.set_busy("kujakuja-nrc-prod", true);

        let payload = pipeline
            .continuation_at(
                run.run_id,
                ResumeContext::Import {
                    table_name: "countries".to_string(),
                    source_environments: vec!["crc".to_string(), "nrc".to_string()],
                    last_source_environment: Some("nrc".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Deferred);
        assert!(pipeline.sql.imports().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_records_datafix_per_environment() {
        let pipeline = TestPipeline::new();
        pipeline.migrator.stage("crc", vec![1, 2]);
        pipeline.migrator.stage("nrc", vec![1]);
        let (run, _) = pipeline.steps.trigger().await.unwrap();

        let payload = pipeline
            .continuation_at(
                run.run_id,
                ResumeContext::Migrate {
                    last_source_environment: Some("nrc".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Advanced);
        assert_eq!(pipeline.last_payload().unwrap().step(), StepName::WarehouseExport);

        let rows = pipeline.migrator.shared_rows();
        assert_eq!(rows.keys().copied().collect::<Vec<_>>(), vec![1_000_000_001, 1_000_000_002, 2_000_000_001]);
        let datafixes = pipeline
            .history
            .entries()
            .into_iter()
            .filter(|entry| entry.body.starts_with("syndication migrate"))
            .count();
        assert_eq!(datafixes, 2);
    }

    #[tokio::test]
    async fn test_warehouse_load_creates_table_and_job() {
        let pipeline = TestPipeline::new();
        let (run, _) = pipeline.steps.trigger().await.unwrap();

        // The with-tags load is the terminal node
        let payload = pipeline
            .continuation_at(run.run_id, ResumeContext::WarehouseLoad { with_tags: true })
            .await
            .unwrap();
        assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Finished);

        assert_eq!(pipeline.warehouse.datasets(), vec!["kujakuja".to_string()]);
        let schema = pipeline.warehouse.table_schema("kk_ofda_daily_w_tags").unwrap();
        assert!(schema.iter().any(|field| field.name == "tags"));
        let loads = pipeline.warehouse.loads();
        assert_eq!(loads.len(), 1);
        assert_eq!(
            loads[0].source_uri,
            "gs://kujakuja-ofda-prod-syndication/ofda-prod-responses-w-tags.csv"
        );
    }

    #[tokio::test]
    async fn test_bulk_tag_defers_while_filters_queued() {
        let pipeline = TestPipeline::new();
        pipeline.tag_filters.insert(1, "water", TagFilterStatus::Queued);
        let (run, _) = pipeline.steps.trigger().await.unwrap();

        let payload = pipeline
            .continuation_at(run.run_id, ResumeContext::BulkTag)
            .await
            .unwrap();
        assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Deferred);
        assert_eq!(pipeline.tag_filters.status_of(1), Some(TagFilterStatus::Queued));
    }

    #[tokio::test]
    async fn test_bulk_tag_applies_pending_filters() {
        let pipeline = TestPipeline::new();
        pipeline.tag_filters.insert(1, "water", TagFilterStatus::Active);
        pipeline.tag_filters.insert(2, "shelter", TagFilterStatus::Editing);
        pipeline.tag_filters.set_matches(1, vec![10, 11]);
        let (run, _) = pipeline.steps.trigger().await.unwrap();

        let payload = pipeline
            .continuation_at(run.run_id, ResumeContext::BulkTag)
            .await
            .unwrap();
        assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Advanced);

        assert_eq!(pipeline.tag_filters.status_of(1), Some(TagFilterStatus::Active));
        assert_eq!(pipeline.tag_filters.status_of(2), Some(TagFilterStatus::Active));
        assert_eq!(pipeline.tag_filters.tagged_count(1), 2);
        assert_eq!(
            pipeline.last_payload().unwrap().context,
            ResumeContext::WarehouseExport { with_tags: true }
        );
    }

    #[tokio::test]
    async fn test_deferral_limit_dead_letters_run() {
        let pipeline = TestPipeline::new();
        let (run, _) = pipeline.steps.trigger().await.unwrap();
        pipeline.sql.set_busy("kujakuja-crc-prod", true);

        for _ in 0..3 {
            assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Deferred);
        }
        assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::DeadLettered);

        let stored = pipeline.runs.load(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::DeadLettered);
        assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_full_run_reaches_terminal_step() {
        let pipeline = TestPipeline::new();
        pipeline.migrator.stage("crc", vec![1]);
        pipeline.migrator.stage("nrc", vec![1]);
        let (run, _) = pipeline.steps.trigger().await.unwrap();

        let outcomes = run_until_finished(&pipeline).await;
        assert_eq!(outcomes.last(), Some(&StepOutcome::Finished));

        let stored = pipeline.runs.load(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Finished);
        assert_eq!(stored.current, None);
        assert_eq!(pipeline.channel.reactions(), vec!["heavy_check_mark".to_string()]);
        assert_eq!(pipeline.warehouse.loads().len(), 2);
        assert_eq!(pipeline.sql.imports().len(), 2 * tables::TABLES.len());
    }
}
