use std::fmt;

use thiserror::Error;

use crate::schema::SemanticType;

/// Errors that end a run (or, for `ResourceUnavailable`, one instant of it).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tax id of the wrong shape reached identity assignment; the upstream
    /// export changed format and the run must stop.
    #[error("invalid tax identifier {value:?} in field `{field}`")]
    IdentityPrecondition { field: String, value: String },

    #[error("resource unavailable at {address}: {reason}")]
    ResourceUnavailable { address: String, reason: String },
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::ResourceUnavailable { .. })
    }
}

/// A single field failed coercion, so its whole row is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field `{field}` ({ty}) rejected {raw:?}: {reason}")]
pub struct RowError {
    pub field: String,
    pub ty: SemanticType,
    pub raw: String,
    pub reason: String,
}

/// Why a row never made it out of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DropReason {
    /// A field failed coercion.
    Coercion,
    /// The delimited line itself could not be read.
    Malformed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Coercion => f.write_str("coercion"),
            DropReason::Malformed => f.write_str("malformed"),
        }
    }
}

/// Columns that did not line up with the schema for one row. Never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drift {
    /// Declared external names absent from the raw record.
    pub missing: Vec<String>,
    /// Raw record keys the schema does not declare.
    pub extra: Vec<String>,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}
