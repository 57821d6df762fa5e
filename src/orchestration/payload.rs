//! # Continuation Payloads
//!
//! Everything a step needs to resume after a process restart travels in the
//! payload of its continuation: the run it belongs to, the run's dispatch
//! sequence, how many times it has been deferred, and a step-specific
//! [`ResumeContext`]. On the wire the
//! payload is JSON wrapped in base64; POST steps receive it as the request
//! body, GET steps in the `context` query parameter.

use super::step::StepName;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Continuation payload is empty")]
    Empty,
    #[error("Continuation payload is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("Continuation payload is not a valid resume context: {0}")]
    InvalidContext(String),
    #[error("Continuation payload for step '{found}' delivered to step '{expected}'")]
    StepMismatch { expected: StepName, found: StepName },
}

/// Step-specific resume state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ResumeContext {
    Export {
        table_name: String,
        source_environments: Vec<String>,
    },
    CreateSchemas {
        #[serde(default)]
        last_source_environment: Option<String>,
    },
    Import {
        table_name: String,
        source_environments: Vec<String>,
        #[serde(default)]
        last_source_environment: Option<String>,
    },
    Migrate {
        #[serde(default)]
        last_source_environment: Option<String>,
    },
    WarehouseExport {
        #[serde(default)]
        with_tags: bool,
    },
    WarehouseLoad {
        #[serde(default)]
        with_tags: bool,
    },
    BulkTag,
}

impl ResumeContext {
    /// The step this context resumes
    pub fn step(&self) -> StepName {
        match self {
            Self::Export { .. } => StepName::Export,
            Self::CreateSchemas { .. } => StepName::CreateSchemas,
            Self::Import { .. } => StepName::Import,
            Self::Migrate { .. } => StepName::MigrateData,
            Self::WarehouseExport { with_tags: false } => StepName::WarehouseExport,
            Self::WarehouseExport { with_tags: true } => StepName::WarehouseExportWithTags,
            Self::WarehouseLoad { with_tags: false } => StepName::WarehouseLoad,
            Self::WarehouseLoad { with_tags: true } => StepName::WarehouseLoadWithTags,
            Self::BulkTag => StepName::BulkTag,
        }
    }

    /// Context a step starts from when it is entered without prior state
    pub fn initial_for(step: StepName) -> Option<Self> {
        match step {
            StepName::CreateSchemas => Some(Self::CreateSchemas {
                last_source_environment: None,
            }),
            StepName::MigrateData => Some(Self::Migrate {
                last_source_environment: None,
            }),
            StepName::WarehouseExport => Some(Self::WarehouseExport { with_tags: false }),
            StepName::WarehouseExportWithTags => Some(Self::WarehouseExport { with_tags: true }),
            StepName::WarehouseLoad => Some(Self::WarehouseLoad { with_tags: false }),
            StepName::WarehouseLoadWithTags => Some(Self::WarehouseLoad { with_tags: true }),
            StepName::BulkTag => Some(Self::BulkTag),
            // Per-table steps need a table and environment list
            StepName::Export | StepName::Import => None,
        }
    }
}

/// Envelope carried by every continuation dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationPayload {
    pub run_id: Uuid,
    /// Dispatch sequence of the run when this continuation was scheduled
    #[serde(default)]
    pub sequence: u64,
    /// Consecutive deferrals of the current step; 0 on first delivery
    #[serde(default)]
    pub attempt: u32,
    pub context: ResumeContext,
}

impl ContinuationPayload {
    pub fn new(run_id: Uuid, context: ResumeContext) -> Self {
        Self {
            run_id,
            sequence: 0,
            attempt: 0,
            context,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn step(&self) -> StepName {
        self.context.step()
    }

    /// Standard base64 of the JSON form, for request bodies
    pub fn encode(&self) -> String {
        STANDARD.encode(self.to_json())
    }

    /// URL-safe base64 of the JSON form, for query parameters
    pub fn encode_for_query(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_json())
    }

    fn to_json(&self) -> Vec<u8> {
        // Plain data with string keys; serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a payload in any of the forms a step may receive it: standard
    /// or URL-safe base64, or the bare JSON the queue delivers after
    /// unwrapping its own transport encoding.
    pub fn decode(raw: &str) -> Result<Self, PayloadError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PayloadError::Empty);
        }

        let json = if trimmed.starts_with('{') {
            trimmed.as_bytes().to_vec()
        } else {
            STANDARD
                .decode(trimmed)
                .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
                .map_err(|e| PayloadError::InvalidEncoding(e.to_string()))?
        };

        serde_json::from_slice(&json).map_err(|e| PayloadError::InvalidContext(e.to_string()))
    }

    /// Decode and check the payload belongs to `expected`
    pub fn decode_for(expected: StepName, raw: &str) -> Result<Self, PayloadError> {
        let payload = Self::decode(raw)?;
        let found = payload.step();
        if found != expected {
            return Err(PayloadError::StepMismatch { expected, found });
        }
        Ok(payload)
    }
}
