//! # Inventory Store
//!
//! The single source of truth for orchestration state: one [`JobRecord`] per
//! submitted Batch Unit and one [`RunRecord`] per Run.
//!
//! The scheduler and the completion listener never talk to each other
//! directly; everything they share goes through this store. Status changes are
//! only possible through [`Inventory::update_status`], an atomic
//! compare-and-set on the current status, so concurrent or duplicated
//! notifications cannot overwrite each other.
//!
//! Records are keyed by `(run_id, job_id)`. Job ids are unique across runs,
//! so lookups by job id alone are supported as well.
//!
//! ## Implementations
//!
//! - [`MemoryInventory`] - process-local
//! - [`JournalInventory`] - append-only JSON journal on disk, replayed on open
//!   (feature `journal`)

pub(crate) mod memory;

#[cfg_attr(docsrs, doc(cfg(feature = "journal")))]
#[cfg(feature = "journal")]
mod journal;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryInventory;

#[cfg(feature = "journal")]
pub use journal::JournalInventory;

use crate::error::InventoryError;
use crate::ids::{JobId, RunId};
use crate::partition::BatchBounds;
use crate::record::SourceDescriptor;

/// Lifecycle state of a job.
///
/// ```text
/// PENDING -> SUBMITTED -> IN_PROGRESS -> COMPLETED
///                 |             |    \-> FAILED
///                 |             \------> TIMED_OUT
///                 \--> COMPLETED | FAILED | TIMED_OUT
/// PENDING -> FAILED  (rejected at submission)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Submitted,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Submitted,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::TimedOut,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, InProgress)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (Submitted, TimedOut)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, TimedOut)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The Batch Unit a job was created for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub index: usize,
    pub start: usize,
    pub len: usize,
    /// Formatted request file.
    pub input_location: String,
    /// Where the backend was told to write output.
    pub output_prefix: String,
}

/// The orchestrator's view of one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub run_id: RunId,
    pub unit: UnitRef,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Time after which a non-terminal job is considered lost.
    pub deadline: DateTime<Utc>,
    /// Set only on success.
    pub output_location: Option<String>,
    /// Set only on failure or timeout.
    pub failure_reason: Option<String>,
}

impl JobRecord {
    /// A freshly accepted job.
    pub fn submitted(
        job_id: JobId,
        run_id: RunId,
        unit: UnitRef,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            run_id,
            unit,
            status: JobStatus::Submitted,
            submitted_at: now,
            updated_at: now,
            deadline,
            output_location: None,
            failure_reason: None,
        }
    }

    /// A unit the backend refused; it never occupies a slot.
    pub fn rejected(run_id: RunId, unit: UnitRef, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::local(),
            run_id,
            unit,
            status: JobStatus::Failed,
            submitted_at: now,
            updated_at: now,
            deadline: now,
            output_location: None,
            failure_reason: Some(reason),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Extra fields written alongside a status change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub output_location: Option<String>,
    pub failure_reason: Option<String>,
}

impl JobUpdate {
    pub fn output(location: impl Into<String>) -> Self {
        Self {
            output_location: Some(location.into()),
            failure_reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            output_location: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Metadata for one orchestrated Run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub source: SourceDescriptor,
    pub model_id: String,
    pub template_id: Option<String>,
    pub bounds: BatchBounds,
    pub ceiling: usize,
    pub unit_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once every job of the run is terminal.
    pub terminal: bool,
    /// Consolidated output, once joined.
    pub joined_location: Option<String>,
}

/// Durable keyed store of job and run records.
///
/// Implementations guarantee read-after-write consistency per key and make
/// [`update_status`](Inventory::update_status) atomic.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Insert a new job record. Fails if the job id is already known.
    async fn put(&self, record: JobRecord) -> Result<(), InventoryError>;

    /// Current record of `job_id`, or [`InventoryError::JobNotFound`].
    async fn get(&self, job_id: &JobId) -> Result<JobRecord, InventoryError>;

    /// Move `job_id` from `expected` to `next`, applying `update`.
    ///
    /// Fails with [`InventoryError::StaleStatus`] when the stored status is
    /// not `expected`, and with [`InventoryError::IllegalTransition`] when the
    /// state machine forbids the move. Returns the updated record.
    async fn update_status(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        next: JobStatus,
        update: JobUpdate,
    ) -> Result<JobRecord, InventoryError>;

    /// All jobs of a run, ordered by unit index.
    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<JobRecord>, InventoryError>;

    /// Occupied concurrency slots of a run.
    async fn count_non_terminal(&self, run_id: &RunId) -> Result<usize, InventoryError> {
        Ok(self
            .list_by_run(run_id)
            .await?
            .iter()
            .filter(|r| !r.is_terminal())
            .count())
    }

    /// Insert or replace a run record.
    async fn put_run(&self, run: RunRecord) -> Result<(), InventoryError>;

    /// Current record of `run_id`, or [`InventoryError::RunNotFound`].
    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, InventoryError>;

    /// Flag a run terminal and record its consolidated output location.
    ///
    /// Refused unless every job of the run is terminal.
    async fn mark_run_terminal(
        &self,
        run_id: &RunId,
        joined_location: Option<String>,
    ) -> Result<RunRecord, InventoryError>;
}
