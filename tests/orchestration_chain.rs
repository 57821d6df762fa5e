//! # Orchestration Chain Integration Tests
//!
//! Drives `TaskChainOrchestrator` directly over a short custom chain to
//! check advancement, requeueing, skips, deferral limits and stale
//! continuation handling independent of what the syndication handlers do.

use proptest::prelude::*;
use std::time::Duration;
use syndication_core::orchestration::{
    ContinuationPayload, PipelineRun, ResumeContext, RunStatus, RunStore, StepName, StepOutcome,
    StepRegistry,
};
use syndication_core::test_helpers::{test_config, TestPipeline};

/// Three steps that can all start from their initial context
fn abc_registry() -> StepRegistry {
    StepRegistry::from_steps(&[
        StepName::CreateSchemas,
        StepName::MigrateData,
        StepName::WarehouseExport,
    ])
    .unwrap()
}

fn abc_pipeline() -> TestPipeline {
    TestPipeline::with_registry(test_config(), abc_registry())
}

#[tokio::test]
async fn test_chain_advances_then_finishes() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;

    let mut run = orchestrator.initiate().await.unwrap();
    assert_eq!(run.current, Some(StepName::CreateSchemas));
    assert!(run.thread_ts.is_some(), "run should own a progress thread");

    let outcome = orchestrator.task_done(&mut run, None, Duration::ZERO).await.unwrap();
    assert_eq!(outcome, StepOutcome::Advanced);
    assert_eq!(run.current, Some(StepName::MigrateData));
    assert_eq!(pipeline.last_payload().unwrap().step(), StepName::MigrateData);

    let outcome = orchestrator.task_done(&mut run, None, Duration::ZERO).await.unwrap();
    assert_eq!(outcome, StepOutcome::Advanced);
    assert_eq!(run.current, Some(StepName::WarehouseExport));

    let dispatched = pipeline.queue.len();
    let outcome = orchestrator.task_done(&mut run, None, Duration::ZERO).await.unwrap();
    assert_eq!(outcome, StepOutcome::Finished);
    assert_eq!(run.current, None);
    assert_eq!(run.status, RunStatus::Finished);
    assert_eq!(pipeline.queue.len(), dispatched, "the terminal step dispatches nothing");
    assert_eq!(pipeline.channel.reactions(), vec!["heavy_check_mark".to_string()]);

    let stats = orchestrator.stats();
    assert_eq!(stats.runs_initiated, 1);
    assert_eq!(stats.runs_finished, 1);
    assert_eq!(stats.dispatched, 2);
}

#[tokio::test]
async fn test_requeue_keeps_current_step() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();
    orchestrator.task_done(&mut run, None, Duration::ZERO).await.unwrap();

    let context = ResumeContext::Migrate {
        last_source_environment: Some("nrc".to_string()),
    };
    for _ in 0..3 {
        let outcome = orchestrator
            .requeue_task(&mut run, context.clone(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Requeued);
        assert_eq!(run.current, Some(StepName::MigrateData));
    }

    let last = pipeline.queue.last().unwrap();
    assert_eq!(last.delay, Duration::from_secs(30));
    assert_eq!(pipeline.last_payload().unwrap().context, context);
}

#[tokio::test]
async fn test_requeue_rejects_context_of_another_step() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();

    let result = orchestrator
        .requeue_task(&mut run, ResumeContext::BulkTag, Duration::ZERO)
        .await;
    assert!(result.is_err());
    assert_eq!(run.current, Some(StepName::CreateSchemas));
}

#[tokio::test]
async fn test_unknown_skip_target_clears_current_without_dispatch() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();
    let dispatched = pipeline.queue.len();

    let outcome = orchestrator
        .skip_to_task_named(&mut run, "reindex_everything", None, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome, StepOutcome::Dropped);
    assert_eq!(run.current, None);
    assert_eq!(pipeline.queue.len(), dispatched);
    assert_eq!(orchestrator.stats().unknown_skip_targets, 1);

    // A step missing from this chain is just as unknown
    let mut run = orchestrator.initiate().await.unwrap();
    let outcome = orchestrator
        .skip_to_task(&mut run, StepName::BulkTag, None, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome, StepOutcome::Dropped);
    assert_eq!(orchestrator.stats().unknown_skip_targets, 2);
}

#[tokio::test]
async fn test_skip_to_registered_step_dispatches_it() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();

    let outcome = orchestrator
        .skip_to_task_named(&mut run, "warehouse_export", None, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome, StepOutcome::Skipped);
    assert_eq!(run.current, Some(StepName::WarehouseExport));
    assert_eq!(
        pipeline.last_payload().unwrap().context,
        ResumeContext::WarehouseExport { with_tags: false }
    );
}

#[tokio::test]
async fn test_initiate_abandons_previous_running_run() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;

    let first = orchestrator.initiate().await.unwrap();
    let second = orchestrator.initiate().await.unwrap();
    assert_ne!(first.run_id, second.run_id);

    let stored = pipeline.runs.load(first.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Abandoned);
    let latest = pipeline.runs.latest_running().await.unwrap().unwrap();
    assert_eq!(latest.run_id, second.run_id);
}

#[tokio::test]
async fn test_resume_reconstructs_unknown_run() {
    let pipeline = abc_pipeline();
    let run_id = uuid::Uuid::new_v4();
    let payload = ContinuationPayload::new(
        run_id,
        ResumeContext::Migrate {
            last_source_environment: None,
        },
    )
    .with_sequence(4);

    let run = pipeline.orchestrator.resume(&payload).await.unwrap().unwrap();
    assert_eq!(run.run_id, run_id);
    assert_eq!(run.current, Some(StepName::MigrateData));
    assert_eq!(run.sequence, 4);
    assert!(run.is_running());
    assert!(pipeline.runs.load(run_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_resume_drops_continuation_of_a_previous_step() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();
    orchestrator.start(&mut run, None, Duration::ZERO).await.unwrap();
    let delivered = pipeline.last_payload().unwrap();
    assert!(orchestrator.resume(&delivered).await.unwrap().is_some());

    orchestrator.task_done(&mut run, None, Duration::ZERO).await.unwrap();
    assert!(orchestrator.resume(&delivered).await.unwrap().is_none());

    let stored = pipeline.runs.load(run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.current, Some(StepName::MigrateData), "a stale delivery never rewinds the run");
    assert_eq!(orchestrator.stats().dropped_payloads, 1);
}

#[tokio::test]
async fn test_defer_backs_off_then_dead_letters() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();
    let context = ResumeContext::CreateSchemas {
        last_source_environment: Some("nrc".to_string()),
    };

    let mut delays = Vec::new();
    for previous in 0..3 {
        let outcome = orchestrator.defer(&mut run, previous, context.clone()).await.unwrap();
        assert_eq!(outcome, StepOutcome::Deferred);
        assert_eq!(pipeline.last_payload().unwrap().attempt, previous + 1);
        delays.push(pipeline.queue.last().unwrap().delay);
    }
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "delays should not shrink: {delays:?}");

    let dispatched = pipeline.queue.len();
    let outcome = orchestrator.defer(&mut run, 3, context).await.unwrap();
    assert_eq!(outcome, StepOutcome::DeadLettered);
    assert_eq!(run.status, RunStatus::DeadLettered);
    assert_eq!(pipeline.queue.len(), dispatched);
    assert_eq!(orchestrator.stats().dead_lettered, 1);
    assert!(pipeline
        .channel
        .texts()
        .iter()
        .any(|text| text.contains("gave up after 3 deferrals")));
}

#[tokio::test]
async fn test_defer_rejects_context_of_another_step() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();
    let dispatched = pipeline.queue.len();

    let result = orchestrator
        .defer(&mut run, 0, ResumeContext::WarehouseExport { with_tags: false })
        .await;
    assert!(result.is_err());
    assert_eq!(run.current, Some(StepName::CreateSchemas));
    assert_eq!(pipeline.queue.len(), dispatched);
    assert_eq!(orchestrator.stats().deferred, 0);
}

#[tokio::test]
async fn test_dispatch_failure_restores_run_for_redelivery() {
    let pipeline = abc_pipeline();
    let orchestrator = &pipeline.orchestrator;
    let mut run = orchestrator.initiate().await.unwrap();
    orchestrator.start(&mut run, None, Duration::ZERO).await.unwrap();
    let delivered = pipeline.last_payload().unwrap();
    pipeline.queue.fail_with("queue unavailable");

    let result = orchestrator.task_done(&mut run, None, Duration::ZERO).await;
    assert!(result.is_err());
    assert_eq!(orchestrator.stats().dispatched, 1);
    assert_eq!(run.current, Some(StepName::CreateSchemas));
    assert_eq!(run.sequence, delivered.sequence);
    assert_eq!(pipeline.runs.load(run.run_id).await.unwrap(), Some(run.clone()));

    // The queue redelivers the continuation whose handler failed
    pipeline.queue.recover();
    let mut resumed = orchestrator.resume(&delivered).await.unwrap().expect("redelivery is accepted");
    let outcome = orchestrator.task_done(&mut resumed, None, Duration::ZERO).await.unwrap();
    assert_eq!(outcome, StepOutcome::Advanced);
    assert_eq!(pipeline.last_payload().unwrap().step(), StepName::MigrateData);
}

const STARTABLE: [StepName; 7] = [
    StepName::CreateSchemas,
    StepName::MigrateData,
    StepName::WarehouseExport,
    StepName::WarehouseLoad,
    StepName::BulkTag,
    StepName::WarehouseExportWithTags,
    StepName::WarehouseLoadWithTags,
];

proptest! {
    /// Property: a chain of n steps advances exactly n - 1 times
    #[test]
    fn chain_of_n_steps_advances_n_minus_one_times(
        steps in proptest::sample::subsequence(STARTABLE.to_vec(), 1..=STARTABLE.len())
    ) {
        let registry = StepRegistry::from_steps(&steps).unwrap();
        let mut run = PipelineRun::initiate(&registry);

        let mut advances = 0;
        while run.advance(&registry).is_some() {
            advances += 1;
            prop_assert!(advances < steps.len());
        }
        prop_assert_eq!(advances, steps.len() - 1);
        prop_assert_eq!(run.current, None);
    }

    /// Property: requeue never moves the run
    #[test]
    fn requeue_never_changes_current(
        steps in proptest::sample::subsequence(STARTABLE.to_vec(), 1..=STARTABLE.len()),
        advances in 0usize..7,
        requeues in 1usize..5,
    ) {
        let registry = StepRegistry::from_steps(&steps).unwrap();
        let mut run = PipelineRun::initiate(&registry);
        for _ in 0..advances.min(steps.len() - 1) {
            run.advance(&registry);
        }

        let before = run.current;
        for _ in 0..requeues {
            prop_assert_eq!(run.requeue(), before);
        }
        prop_assert_eq!(run.current, before);
    }
}
