//! # Task Chain Orchestrator
//!
//! Sequences the steps of a pipeline run over the continuation queue. Each
//! operation takes the run it acts on, applies the pure transition from
//! [`PipelineRun`], persists the result and schedules the next invocation:
//!
//! - `task_done` advances to the successor and dispatches it
//! - `requeue_task` re-dispatches the current step unchanged
//! - `defer` re-dispatches the current step under the deferral policy,
//!   dead-lettering the run once the policy gives up
//! - `skip_to_task` / `skip_to_task_named` jump straight to a named step
//!
//! The run is saved with its new dispatch sequence before the continuation
//! is enqueued, so a zero-delay delivery never races the save. A failed
//! dispatch restores the run as it was and propagates to the calling
//! handler; the queue's redelivery of the continuation being handled is the
//! retry mechanism.

use super::backoff::{DeferralDecision, DeferralPolicy};
use super::payload::{ContinuationPayload, ResumeContext};
use super::registry::StepRegistry;
use super::run::{PipelineRun, RunStore};
use super::step::{HttpMethod, QueueKind, StepName};
use crate::config::QueueConfig;
use crate::constants::{dispatch, progress};
use crate::error::{Result, SyndicationError};
use crate::logging::{log_run_operation, log_step_operation};
use crate::messaging::{ContinuationQueue, DispatchRequest};
use crate::progress::ProgressReporter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What a step invocation ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Successor dispatched
    Advanced,
    /// Same step dispatched again with new context
    Requeued,
    /// Jumped to a named step
    Skipped,
    /// Waiting on a backend operation; same step re-dispatched with backoff
    Deferred,
    /// Deferral limit reached; run stopped
    DeadLettered,
    /// Payload or target could not be acted on; nothing dispatched
    Dropped,
    /// Chain exhausted
    Finished,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advanced => "advanced",
            Self::Requeued => "requeued",
            Self::Skipped => "skipped",
            Self::Deferred => "deferred",
            Self::DeadLettered => "dead_lettered",
            Self::Dropped => "dropped",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Orchestrator counters
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    runs_initiated: AtomicU64,
    runs_finished: AtomicU64,
    dispatched: AtomicU64,
    deferred: AtomicU64,
    dropped_payloads: AtomicU64,
    unknown_skip_targets: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStatsSnapshot {
    pub runs_initiated: u64,
    pub runs_finished: u64,
    pub dispatched: u64,
    pub deferred: u64,
    pub dropped_payloads: u64,
    pub unknown_skip_targets: u64,
    pub dead_lettered: u64,
}

impl OrchestratorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OrchestratorStatsSnapshot {
        OrchestratorStatsSnapshot {
            runs_initiated: self.runs_initiated.load(Ordering::Relaxed),
            runs_finished: self.runs_finished.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dropped_payloads: self.dropped_payloads.load(Ordering::Relaxed),
            unknown_skip_targets: self.unknown_skip_targets.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

pub struct TaskChainOrchestrator {
    registry: Arc<StepRegistry>,
    queue: Arc<dyn ContinuationQueue>,
    runs: Arc<dyn RunStore>,
    progress: Arc<ProgressReporter>,
    policy: DeferralPolicy,
    queues: QueueConfig,
    /// Shown in the run's thread header, e.g. the target project
    run_label: String,
    stats: OrchestratorStats,
}

impl fmt::Debug for TaskChainOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskChainOrchestrator")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("run_label", &self.run_label)
            .finish_non_exhaustive()
    }
}

impl TaskChainOrchestrator {
    pub fn new(
        registry: Arc<StepRegistry>,
        queue: Arc<dyn ContinuationQueue>,
        runs: Arc<dyn RunStore>,
        progress: Arc<ProgressReporter>,
        policy: DeferralPolicy,
        queues: QueueConfig,
        run_label: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            queue,
            runs,
            progress,
            policy,
            queues,
            run_label: run_label.into(),
            stats: OrchestratorStats::default(),
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn stats(&self) -> OrchestratorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Delay used when a handler has no reason to pick another
    pub fn default_delay(&self) -> Duration {
        Duration::from_secs(self.queues.default_delay_seconds)
    }

    /// Start a new run at the head of the chain. A run still marked running
    /// is superseded and marked abandoned.
    pub async fn initiate(&self) -> Result<PipelineRun> {
        if let Some(mut previous) = self.runs.latest_running().await? {
            previous.abandon();
            self.runs.save(&previous).await?;
            log_run_operation("abandon", previous.run_id, previous.status.as_str(), Some("superseded by a new run"));
        }

        let mut run = PipelineRun::initiate(&self.registry);
        let summary = format!("Data Run *({})* - Details in thread below...", self.run_label);
        if let Some(thread_ts) = self.progress.start_thread(&summary).await {
            run.attach_thread(thread_ts);
        }
        self.runs.save(&run).await?;

        OrchestratorStats::bump(&self.stats.runs_initiated);
        log_run_operation("initiate", run.run_id, run.status.as_str(), run.current.map(|s| s.as_str()));
        Ok(run)
    }

    /// Dispatch the step a freshly initiated run is positioned at
    pub async fn start(
        &self,
        run: &mut PipelineRun,
        context: Option<ResumeContext>,
        delay: Duration,
    ) -> Result<StepOutcome> {
        let head = run.current.ok_or_else(|| {
            SyndicationError::OrchestrationError(format!("run {} has no step to start", run.run_id))
        })?;
        let context = Self::context_for(head, context)?;
        let previous = run.clone();
        let payload = ContinuationPayload::new(run.run_id, context);
        self.commit_and_dispatch(run, previous, head, payload, delay).await?;
        Ok(StepOutcome::Advanced)
    }

    /// Load the run a continuation belongs to. Returns `None`, counting the
    /// payload as dropped, when the run has stopped or the continuation is
    /// not the one the run last dispatched. A run the store no longer knows
    /// is reconstructed from the continuation alone.
    pub async fn resume(&self, payload: &ContinuationPayload) -> Result<Option<PipelineRun>> {
        let step = payload.step();
        let Some(run) = self.runs.load(payload.run_id).await? else {
            warn!(run_id = %payload.run_id, step = %step, "Run not found; reconstructing from continuation");
            let run = PipelineRun::reconstructed(payload.run_id, step, payload.sequence);
            self.runs.save(&run).await?;
            return Ok(Some(run));
        };

        if !run.is_running() {
            self.record_dropped_payload(step, &format!("run {} is {}", run.run_id, run.status));
            return Ok(None);
        }
        if !run.expects(step, payload.sequence) {
            let waiting_on = run.current.map_or("nothing", |current| current.as_str());
            self.record_dropped_payload(
                step,
                &format!(
                    "stale continuation #{} for run {}; waiting on {waiting_on} #{}",
                    payload.sequence, run.run_id, run.sequence
                ),
            );
            return Ok(None);
        }
        Ok(Some(run))
    }

    /// The current step completed; dispatch its successor. `next_context`
    /// defaults to the successor's initial context when absent.
    pub async fn task_done(
        &self,
        run: &mut PipelineRun,
        next_context: Option<ResumeContext>,
        delay: Duration,
    ) -> Result<StepOutcome> {
        let previous = run.clone();
        let completed = run.current;
        let next = run.advance(&self.registry);

        let Some(next) = next else {
            self.runs.save(run).await?;
            OrchestratorStats::bump(&self.stats.runs_finished);
            log_run_operation("finish", run.run_id, run.status.as_str(), completed.map(|s| s.as_str()));
            self.progress
                .react(run.thread_ts.as_deref(), progress::CHECK_MARK)
                .await;
            return Ok(StepOutcome::Finished);
        };

        let context = match Self::context_for(next, next_context) {
            Ok(context) => context,
            Err(e) => {
                *run = previous;
                return Err(e);
            }
        };
        let payload = ContinuationPayload::new(run.run_id, context);
        self.commit_and_dispatch(run, previous, next, payload, delay).await?;
        Ok(StepOutcome::Advanced)
    }

    /// Re-dispatch the current step without advancing
    pub async fn requeue_task(
        &self,
        run: &mut PipelineRun,
        context: ResumeContext,
        delay: Duration,
    ) -> Result<StepOutcome> {
        let Some(current) = run.requeue() else {
            warn!(run_id = %run.run_id, "Requeue requested for a run without a current step");
            return Ok(StepOutcome::Dropped);
        };
        if context.step() != current {
            return Err(SyndicationError::OrchestrationError(format!(
                "cannot requeue step '{current}' with a '{}' context",
                context.step()
            )));
        }

        let previous = run.clone();
        let payload = ContinuationPayload::new(run.run_id, context);
        self.commit_and_dispatch(run, previous, current, payload, delay).await?;
        Ok(StepOutcome::Requeued)
    }

    /// The current step is waiting on a backend operation. Re-dispatch it
    /// with backoff, or dead-letter the run once the policy gives up.
    pub async fn defer(
        &self,
        run: &mut PipelineRun,
        previous_attempts: u32,
        context: ResumeContext,
    ) -> Result<StepOutcome> {
        let step = context.step();
        if run.current != Some(step) {
            return Err(SyndicationError::OrchestrationError(format!(
                "cannot defer a '{step}' context while run {} is at '{}'",
                run.run_id,
                run.current.map_or("nothing", |current| current.as_str())
            )));
        }

        match self.policy.decide(previous_attempts) {
            DeferralDecision::Retry { attempt, delay } => {
                OrchestratorStats::bump(&self.stats.deferred);
                log_step_operation(
                    "defer",
                    Some(run.run_id),
                    Some(step.as_str()),
                    None,
                    "waiting",
                    Some(&format!("attempt {attempt}, retry in {}s", delay.as_secs())),
                );
                let previous = run.clone();
                let payload = ContinuationPayload::new(run.run_id, context).with_attempt(attempt);
                self.commit_and_dispatch(run, previous, step, payload, delay).await?;
                Ok(StepOutcome::Deferred)
            }
            DeferralDecision::DeadLetter { attempts } => {
                run.dead_letter();
                self.runs.save(run).await?;
                OrchestratorStats::bump(&self.stats.dead_lettered);

                let message = format!(
                    "- {step} gave up after {attempts} deferrals :{}:",
                    progress::CROSS_MARK
                );
                error!(run_id = %run.run_id, step = %step, attempts, "Run dead-lettered");
                log_run_operation("dead_letter", run.run_id, run.status.as_str(), Some(&message));
                self.progress.alert(run.thread_ts.as_deref(), &message).await;
                Ok(StepOutcome::DeadLettered)
            }
        }
    }

    /// Jump to `step` and dispatch it
    pub async fn skip_to_task(
        &self,
        run: &mut PipelineRun,
        step: StepName,
        context: Option<ResumeContext>,
        delay: Duration,
    ) -> Result<StepOutcome> {
        if !self.registry.contains(step) {
            return self.unknown_skip_target(run, step.as_str()).await;
        }

        let context = Self::context_for(step, context)?;
        let previous = run.clone();
        run.skip_to(Some(step));
        let payload = ContinuationPayload::new(run.run_id, context);
        self.commit_and_dispatch(run, previous, step, payload, delay).await?;
        Ok(StepOutcome::Skipped)
    }

    /// Jump by string name. Unknown names clear the current step and
    /// dispatch nothing.
    pub async fn skip_to_task_named(
        &self,
        run: &mut PipelineRun,
        name: &str,
        context: Option<ResumeContext>,
        delay: Duration,
    ) -> Result<StepOutcome> {
        match self.registry.lookup(name) {
            Some(step) => self.skip_to_task(run, step, context, delay).await,
            None => self.unknown_skip_target(run, name).await,
        }
    }

    /// Count and log a continuation that could not be acted on
    pub fn record_dropped_payload(&self, step: StepName, reason: &str) -> StepOutcome {
        OrchestratorStats::bump(&self.stats.dropped_payloads);
        warn!(step = %step, reason = %reason, "Continuation dropped");
        StepOutcome::Dropped
    }

    pub async fn send_progress_message(&self, run: &PipelineRun, text: &str) {
        self.progress.post(run.thread_ts.as_deref(), text).await;
    }

    pub async fn send_progress_reaction(&self, run: &PipelineRun, reaction: &str) {
        self.progress.react(run.thread_ts.as_deref(), reaction).await;
    }

    async fn unknown_skip_target(&self, run: &mut PipelineRun, name: &str) -> Result<StepOutcome> {
        run.skip_to(None);
        self.runs.save(run).await?;
        OrchestratorStats::bump(&self.stats.unknown_skip_targets);
        warn!(run_id = %run.run_id, target = %name, "Skip target is not registered; nothing dispatched");
        Ok(StepOutcome::Dropped)
    }

    fn context_for(step: StepName, context: Option<ResumeContext>) -> Result<ResumeContext> {
        match context {
            Some(context) if context.step() == step => Ok(context),
            Some(context) => Err(SyndicationError::OrchestrationError(format!(
                "a '{}' context cannot resume step '{step}'",
                context.step()
            ))),
            None => ResumeContext::initial_for(step).ok_or_else(|| {
                SyndicationError::OrchestrationError(format!(
                    "step '{step}' cannot start without a resume context"
                ))
            }),
        }
    }

    fn queue_id(&self, queue: QueueKind) -> &str {
        match queue {
            QueueKind::Syndication => &self.queues.syndication_queue_id,
            QueueKind::Tagging => &self.queues.tagging_queue_id,
        }
    }

    /// Stamp `payload` with the run's next sequence, save the run, then
    /// enqueue. When the queue refuses the dispatch the run is restored to
    /// `previous`, so the continuation being handled stays the expected one.
    async fn commit_and_dispatch(
        &self,
        run: &mut PipelineRun,
        previous: PipelineRun,
        step: StepName,
        payload: ContinuationPayload,
        delay: Duration,
    ) -> Result<()> {
        let payload = payload.with_sequence(run.next_dispatch());
        if let Err(e) = self.runs.save(run).await {
            *run = previous;
            return Err(e);
        }

        if let Err(e) = self.dispatch(run, step, payload, delay).await {
            warn!(run_id = %run.run_id, step = %step, error = %e, "Dispatch failed; restoring run");
            *run = previous;
            if let Err(restore_error) = self.runs.save(run).await {
                error!(run_id = %run.run_id, error = %restore_error, "Could not restore run after failed dispatch");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        run: &PipelineRun,
        step: StepName,
        payload: ContinuationPayload,
        delay: Duration,
    ) -> Result<()> {
        let node = self.registry.node(step).ok_or_else(|| {
            SyndicationError::OrchestrationError(format!("step '{step}' is not registered"))
        })?;

        let (relative_uri, body) = match node.method {
            HttpMethod::Post => (node.endpoint.clone(), Some(payload.encode())),
            HttpMethod::Get => (
                format!(
                    "{}?{}={}",
                    node.endpoint,
                    dispatch::CONTEXT_QUERY_PARAM,
                    payload.encode_for_query()
                ),
                None,
            ),
        };

        let request = DispatchRequest::new(
            self.queue_id(node.queue),
            node.method,
            relative_uri,
            body,
            delay,
        )?;
        self.queue.dispatch(request).await?;

        OrchestratorStats::bump(&self.stats.dispatched);
        log_step_operation(
            "dispatch",
            Some(run.run_id),
            Some(step.as_str()),
            None,
            "scheduled",
            Some(&format!(
                "#{} attempt {} in {}s",
                payload.sequence,
                payload.attempt,
                delay.as_secs()
            )),
        );
        info!(run_id = %run.run_id, step = %step, sequence = payload.sequence, "Step dispatched");
        Ok(())
    }
}
