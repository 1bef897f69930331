//! Error taxonomy for the orchestrator.
//!
//! Errors are split by the layer that raises them. Only the crate-level
//! [`OrchestratorError`] crosses the public run API; the layer errors convert
//! into it through `#[from]`.
//!
//! Classification:
//! - configuration errors ([`PartitionError`], [`FormatError`], [`ConfigError`],
//!   source loading) abort a Run before anything is submitted
//! - [`SubmissionError`] is local to one Batch Unit and never aborts a Run
//! - [`JoinError`] is local to one unit; it becomes a fault in the run report
//!   and never reaches the caller
//! - [`PipelineError`] aborts a pipeline before its first stage, or before the
//!   stage whose input is missing

use thiserror::Error;

use crate::ids::{JobId, RunId};
use crate::inventory::JobStatus;

/// Errors raised while splitting records into Batch Units.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// Bounds are non-positive or `min > max`.
    #[error("invalid batch bounds: min={min}, max={max}")]
    InvalidBounds { min: usize, max: usize },
}

/// Errors raised while rendering records into backend request lines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// A record lacks a field the template or request shape needs.
    #[error("record {record_index} is missing field '{field}'")]
    MissingTemplateField { record_index: usize, field: String },

    /// The template id is not registered.
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    /// A text-generation model was requested without a template.
    #[error("model '{0}' requires a template")]
    TemplateRequired(String),

    /// No request shape handles this model id.
    #[error("unsupported model '{0}'")]
    UnsupportedModel(String),

    /// A template string could not be parsed.
    #[error("malformed template '{id}': {reason}")]
    MalformedTemplate { id: String, reason: String },
}

/// Errors raised by a [`BlobStore`](crate::blob::BlobStore).
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob location: {0}")]
    InvalidLocation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by an [`Inventory`](crate::inventory::Inventory).
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// A record with this key already exists.
    #[error("job already recorded: {0}")]
    DuplicateJob(JobId),

    /// Compare-and-set lost: the stored status is not the expected one.
    #[error("stale status for job {job_id}: expected {expected}, found {actual}")]
    StaleStatus {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// The requested transition moves backwards or leaves a terminal state.
    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// A run cannot be closed while some of its jobs are still live.
    #[error("run {run_id} still has {live} non-terminal jobs")]
    RunNotTerminal { run_id: RunId, live: usize },

    #[error("journal error: {0}")]
    Journal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous rejection of a submission by the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// The backend validated the input and refused it.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// The backend could not be reached or failed internally.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while joining outputs back to inputs.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The output for a unit does not line up with its input.
    #[error("unit {unit}: expected {expected} output lines, found {actual}")]
    CorrelationMismatch {
        unit: usize,
        expected: usize,
        actual: usize,
    },

    /// An output line references a record id that is not in the unit.
    #[error("unit {unit}: unknown record id '{record_id}' in output")]
    UnknownRecordId { unit: usize, record_id: String },

    /// A completed job carries no output location.
    #[error("job {0} completed without an output location")]
    MissingOutput(JobId),

    #[error("unit {unit}: unparseable output line {line}: {reason}")]
    Parse {
        unit: usize,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("concurrency ceiling must be positive")]
    ZeroCeiling,

    #[error("config parse error: {0}")]
    Parse(String),
}

/// Errors raised while validating or chaining a multi-stage pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Every problem found in the pipeline definition.
    #[error("invalid pipeline: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// A stage reads the previous stage's output, but there is none.
    #[error("stage '{stage}': run {run_id} produced no joined output")]
    MissingPreviousOutput { stage: String, run_id: RunId },
}

/// Crate-level error returned by the run API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The source dataset could not be decoded.
    #[error("invalid source {location}: {reason}")]
    Source { location: String, reason: String },

    /// The run is still executing.
    #[error("run {0} is still in progress")]
    RunInProgress(RunId),

    /// The run's background task ended abnormally.
    #[error("run {0} aborted: {1}")]
    RunAborted(RunId, String),
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
