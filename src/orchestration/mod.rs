//! # Orchestration
//!
//! The pipeline chain and the orchestrator that walks it over the
//! continuation queue.
//!
//! - [`step`]: step names and their dispatch targets
//! - [`registry`]: the ordered chain and successor lookup
//! - [`run`]: `PipelineRun` state, its transitions and stores
//! - [`payload`]: the resume context carried by each continuation
//! - [`backoff`]: deferral policy for steps waiting on backend operations
//! - [`orchestrator`]: `TaskChainOrchestrator`

pub mod backoff;
pub mod orchestrator;
pub mod payload;
pub mod registry;
pub mod run;
pub mod step;

pub use backoff::{DeferralDecision, DeferralPolicy};
pub use orchestrator::{OrchestratorStatsSnapshot, StepOutcome, TaskChainOrchestrator};
pub use payload::{ContinuationPayload, PayloadError, ResumeContext};
pub use registry::{RegistryError, StepRegistry};
pub use run::{InMemoryRunStore, PgRunStore, PipelineRun, RunStatus, RunStore};
pub use step::{HttpMethod, QueueKind, StepName, StepNode};
