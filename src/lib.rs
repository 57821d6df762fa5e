#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Syndication Core
//!
//! Cross-environment data syndication for a multi-tenant feedback platform.
//!
//! ## Overview
//!
//! Every tenant runs its own deployment and database. A syndication run
//! exports the local rows of each source environment, imports them into
//! per-environment staging schemas of the shared target database, merges
//! them into the shared tables under a collision-free id space and finally
//! republishes the responses to the analytical warehouse.
//!
//! The backend operations involved (managed database exports and imports,
//! warehouse loads) complete out-of-band. The pipeline never blocks on them:
//! each step does one bounded unit of work and then schedules its own
//! continuation on a delayed-dispatch queue, deferring with backoff while an
//! instance is still busy.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - step chain, pipeline runs, continuation payloads, orchestrator
//! - [`syndication`] - step handlers, naming, id-space partitioning, migration
//! - [`tagging`] - tag filter state machine and bulk tagging
//! - [`messaging`] - continuation queue
//! - [`cloud`] - managed SQL, object storage and warehouse contracts
//! - [`progress`] - progress thread and audit log
//! - [`web`] - HTTP surface
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust
//! use syndication_core::orchestration::{PipelineRun, StepName, StepRegistry};
//!
//! let registry = StepRegistry::standard();
//! let mut run = PipelineRun::initiate(&registry);
//! assert_eq!(run.current, Some(StepName::Export));
//! assert_eq!(run.advance(&registry), Some(StepName::CreateSchemas));
//! ```

pub mod cloud;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod progress;
pub mod syndication;
pub mod tagging;
pub mod test_helpers;
pub mod web;

pub use config::{ConfigManager, SyndicationConfig};
pub use error::{Result, SyndicationError};
pub use orchestration::{
    ContinuationPayload, PipelineRun, ResumeContext, StepName, StepOutcome, StepRegistry,
    TaskChainOrchestrator,
};
pub use syndication::{IdSpacePartition, SyndicationSteps};
pub use tagging::{BulkTagService, TagFilterStatus};
