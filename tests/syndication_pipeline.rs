//! # Syndication Pipeline Integration Tests
//!
//! End-to-end runs of the standard chain over the in-memory collaborators,
//! plus the id-space guarantees of the migration engine.

use std::sync::Arc;
use syndication_core::config::IdSpaceConfig;
use syndication_core::orchestration::{
    ContinuationPayload, ResumeContext, RunStatus, RunStore, StepName, StepOutcome,
};
use syndication_core::syndication::{IdSpacePartition, MigrationEngine};
use syndication_core::tagging::TagFilterStatus;
use syndication_core::test_helpers::{test_config, FakeMigrator, TestPipeline};

const I: i64 = 1_000_000_000;

/// Deliver continuations until the run finishes, returning every outcome
async fn drive(pipeline: &TestPipeline) -> Vec<(StepName, StepOutcome)> {
    let mut outcomes = Vec::new();
    for _ in 0..200 {
        let payload = pipeline.last_payload().expect("a continuation is pending");
        let step = payload.step();
        let outcome = pipeline.steps.handle(payload).await.unwrap();
        outcomes.push((step, outcome));
        if matches!(outcome, StepOutcome::Finished | StepOutcome::DeadLettered) {
            break;
        }
    }
    outcomes
}

#[tokio::test]
async fn test_full_run_visits_every_step_in_order() {
    let pipeline = TestPipeline::new();
    pipeline.migrator.stage("crc", vec![1, 2, 3]);
    pipeline.migrator.stage("nrc", vec![1, 2]);
    pipeline.tag_filters.insert(7, "water", TagFilterStatus::Editing);
    pipeline.tag_filters.set_matches(7, vec![1_000_000_001, 2_000_000_002]);

    let (run, _) = pipeline.steps.trigger().await.unwrap();
    let outcomes = drive(&pipeline).await;
    assert_eq!(outcomes.last().map(|(_, outcome)| *outcome), Some(StepOutcome::Finished));

    let mut visited: Vec<StepName> = outcomes.iter().map(|(step, _)| *step).collect();
    visited.dedup();
    assert_eq!(
        visited,
        vec![
            StepName::Export,
            StepName::CreateSchemas,
            StepName::Import,
            StepName::MigrateData,
            StepName::WarehouseExport,
            StepName::WarehouseLoad,
            StepName::BulkTag,
            StepName::WarehouseExportWithTags,
            StepName::WarehouseLoadWithTags,
        ]
    );

    let stored = pipeline.runs.load(run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Finished);
    assert_eq!(pipeline.tag_filters.status_of(7), Some(TagFilterStatus::Active));
    assert_eq!(pipeline.tag_filters.tagged_count(7), 2);

    let rows = pipeline.migrator.shared_rows();
    assert_eq!(rows.len(), 5);
    assert!(rows.keys().all(|id| *id >= I));

    let texts = pipeline.channel.texts();
    for expected in [
        "*Syndication* :repeat:",
        "*BigQuery :repeat:*",
        "*Bulk Tagging* :label:",
        "*BigQuery with tags :repeat:*",
    ] {
        assert!(texts.iter().any(|text| text == expected), "missing progress line {expected:?}");
    }
    assert_eq!(pipeline.channel.reactions(), vec!["heavy_check_mark".to_string()]);
}

#[tokio::test]
async fn test_busy_instances_defer_without_losing_progress() {
    let pipeline = TestPipeline::new();
    pipeline.steps.trigger().await.unwrap();

    // Export of the first table is started, then the source stays busy
    assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Requeued);
    pipeline.sql.set_busy("kujakuja-crc-prod", true);
    assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Deferred);
    assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Deferred);
    assert_eq!(pipeline.sql.exports().len(), 1);

    pipeline.sql.set_busy("kujakuja-crc-prod", false);
    assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Requeued);
    assert_eq!(pipeline.sql.exports().len(), 2);
    assert_eq!(pipeline.last_payload().unwrap().attempt, 0, "a successful step resets the attempt");
}

#[tokio::test]
async fn test_new_trigger_drops_continuations_of_superseded_run() {
    let pipeline = TestPipeline::new();
    let (first, _) = pipeline.steps.trigger().await.unwrap();
    let stale = pipeline.last_payload().unwrap();
    let (second, _) = pipeline.steps.trigger().await.unwrap();
    assert_ne!(first.run_id, second.run_id);

    let exports = pipeline.sql.exports().len();
    assert_eq!(pipeline.steps.handle(stale).await.unwrap(), StepOutcome::Dropped);
    assert_eq!(pipeline.sql.exports().len(), exports);
    assert_eq!(pipeline.orchestrator.stats().dropped_payloads, 1);

    let stored = pipeline.runs.load(first.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Abandoned);
}

#[tokio::test]
async fn test_redelivered_export_after_advance_does_not_rewind_run() {
    let pipeline = TestPipeline::new();
    let (run, _) = pipeline.steps.trigger().await.unwrap();
    let first_export = pipeline.last_payload().unwrap();

    let mut outcome = StepOutcome::Requeued;
    for _ in 0..50 {
        outcome = pipeline.deliver_last().await.unwrap();
        if outcome != StepOutcome::Requeued {
            break;
        }
    }
    assert_eq!(outcome, StepOutcome::Advanced);
    let advanced = pipeline.runs.load(run.run_id).await.unwrap().unwrap();
    assert_eq!(advanced.current, Some(StepName::CreateSchemas));

    let dispatched = pipeline.queue.len();
    let exports = pipeline.sql.exports().len();
    assert_eq!(pipeline.steps.handle(first_export).await.unwrap(), StepOutcome::Dropped);

    let stored = pipeline.runs.load(run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.current, Some(StepName::CreateSchemas));
    assert_eq!(stored.sequence, advanced.sequence);
    assert_eq!(pipeline.queue.len(), dispatched, "no second chain is forked");
    assert_eq!(pipeline.sql.exports().len(), exports);
    assert_eq!(pipeline.orchestrator.stats().dropped_payloads, 1);

    // The continuation the run is waiting on still goes through
    assert_eq!(pipeline.deliver_last().await.unwrap(), StepOutcome::Advanced);
    assert_eq!(pipeline.last_payload().unwrap().step(), StepName::Import);
}

#[tokio::test]
async fn test_duplicate_delivery_of_requeued_step_is_dropped() {
    let pipeline = TestPipeline::new();
    pipeline.steps.trigger().await.unwrap();
    let first = pipeline.last_payload().unwrap();

    assert_eq!(pipeline.steps.handle(first.clone()).await.unwrap(), StepOutcome::Requeued);
    let requeued = pipeline.last_payload().unwrap();
    assert_eq!(requeued.step(), StepName::Export);
    assert_eq!(requeued.sequence, first.sequence + 1);

    // Same step, older dispatch
    assert_eq!(pipeline.steps.handle(first).await.unwrap(), StepOutcome::Dropped);
    assert_eq!(pipeline.sql.exports().len(), 1);
    assert_eq!(pipeline.last_payload().unwrap(), requeued);
}

#[tokio::test]
async fn test_continuation_for_lost_run_is_resumed() {
    let pipeline = TestPipeline::new();
    let payload = ContinuationPayload::new(
        uuid::Uuid::new_v4(),
        ResumeContext::WarehouseExport { with_tags: false },
    );

    assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Advanced);
    assert_eq!(pipeline.last_payload().unwrap().step(), StepName::WarehouseLoad);
}

#[tokio::test]
async fn test_create_schemas_seeds_service_type_mappings() {
    let mut config = test_config();
    config.syndication.service_type_mappings = vec![syndication_core::config::ServiceTypeMapping {
        source_env: "crc".to_string(),
        source_service_type_id: 1,
        source_service_type_name: "Health".to_string(),
        target_service_type_id: 4,
        target_service_type_name: "Health".to_string(),
    }];
    let pipeline = TestPipeline::with_config(config);
    let (run, _) = pipeline.steps.trigger().await.unwrap();

    let payload = pipeline
        .continuation_at(
            run.run_id,
            ResumeContext::CreateSchemas {
                last_source_environment: Some("nrc".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(pipeline.steps.handle(payload).await.unwrap(), StepOutcome::Advanced);

    let schemas = pipeline.migrator.schemas();
    assert_eq!(schemas.len(), 2);
    assert_eq!(schemas[0].0, "crc");
    assert_eq!(schemas[0].1.len(), 1);
    assert_eq!(schemas[1].0, "nrc");
    assert!(schemas[1].1.is_empty());
    assert_eq!(pipeline.last_payload().unwrap().step(), StepName::Import);
}

#[tokio::test]
async fn test_migration_is_idempotent() {
    let migrator = Arc::new(FakeMigrator::new());
    migrator.insert_local(5);
    migrator.stage("crc", vec![1, 2]);
    migrator.stage("nrc", vec![1, 9]);
    let engine = MigrationEngine::new(
        migrator.clone(),
        IdSpacePartition::default(),
        test_config().syndication,
    );
    let envs = vec!["crc".to_string(), "nrc".to_string()];

    let first = engine.migrate_all_data(&envs).await.unwrap();
    let after_first = migrator.shared_rows();
    let second = engine.migrate_all_data(&envs).await.unwrap();

    assert_eq!(migrator.shared_rows(), after_first);
    assert_eq!(
        after_first.keys().copied().collect::<Vec<_>>(),
        vec![5, I + 1, I + 2, 2 * I + 1, 2 * I + 9]
    );
    assert_eq!(first[0].rows_deleted, 0);
    assert!(second[0].rows_deleted > 0, "the rerun replaces previously migrated rows");
    assert_eq!(
        first.iter().map(|r| r.rows_inserted).collect::<Vec<_>>(),
        second.iter().map(|r| r.rows_inserted).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_second_environment_lands_in_its_own_range() {
    // Relative layout: environment i occupies [i*I, (i+1)*I)
    let partition = IdSpacePartition::from(&IdSpaceConfig {
        base_offset: 0,
        increment: I,
        local_threshold: I,
    });
    let migrator = Arc::new(FakeMigrator::new());
    migrator.stage("crc", vec![1]);
    migrator.stage("nrc", vec![1, 42, I - 1]);
    let engine = MigrationEngine::new(migrator.clone(), partition, test_config().syndication);

    let reports = engine
        .migrate_all_data(&["crc".to_string(), "nrc".to_string()])
        .await
        .unwrap();
    assert_eq!(reports[1].offset, I);

    let nrc_ids: Vec<i64> = migrator
        .shared_rows()
        .into_iter()
        .filter(|(_, env)| env == "nrc")
        .map(|(id, _)| id)
        .collect();
    assert_eq!(nrc_ids.len(), 3);
    assert!(nrc_ids.iter().all(|y| partition.range(1).contains(y)));
}
