//! # Inference Backend
//!
//! The seam to the batch inference service. A backend accepts a formatted
//! input location and returns a job id; progress is reported later, out of
//! band, as [`JobNotification`]s on an event channel consumed by the
//! [`CompletionListener`](crate::listener::CompletionListener).
//!
//! Delivery on the channel is at-least-once. Notifications may repeat or
//! arrive out of order; the listener's compare-and-set transitions absorb both.

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SubmissionError;
use crate::ids::JobId;
use crate::inventory::JobStatus;

/// Everything a backend needs to start one job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Deterministic name, `{run}-{index:04}`.
    pub job_name: String,
    pub model_id: String,
    /// Formatted request file.
    pub input_location: String,
    /// Prefix the backend writes its output under.
    pub output_prefix: String,
}

/// A batch inference service.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Start a job. A synchronous error means the job was never created.
    async fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmissionError>;
}

/// Job status as reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendStatus {
    Submitted,
    Validating,
    Scheduled,
    InProgress,
    Completed,
    PartiallyCompleted,
    Failed,
    Stopping,
    Stopped,
    Expired,
}

impl BackendStatus {
    /// The orchestrator state this status moves a job to, if any.
    ///
    /// Pre-execution statuses carry no information beyond the job being
    /// accepted. `Stopping` is treated as final because a stop is never
    /// undone.
    pub fn target(self) -> Option<JobStatus> {
        match self {
            Self::Submitted | Self::Validating | Self::Scheduled => None,
            Self::InProgress => Some(JobStatus::InProgress),
            Self::Completed | Self::PartiallyCompleted => Some(JobStatus::Completed),
            Self::Failed | Self::Stopping | Self::Stopped | Self::Expired => Some(JobStatus::Failed),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::Validating => "Validating",
            Self::Scheduled => "Scheduled",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::PartiallyCompleted => "PartiallyCompleted",
            Self::Failed => "Failed",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Expired => "Expired",
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "Submitted" => Self::Submitted,
            "Validating" => Self::Validating,
            "Scheduled" => Self::Scheduled,
            "InProgress" => Self::InProgress,
            "Completed" => Self::Completed,
            "PartiallyCompleted" => Self::PartiallyCompleted,
            "Failed" => Self::Failed,
            "Stopping" => Self::Stopping,
            "Stopped" => Self::Stopped,
            "Expired" => Self::Expired,
            other => return Err(format!("unknown backend status '{other}'")),
        };
        Ok(status)
    }
}

/// A status change reported by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub status: BackendStatus,
    /// Output file, for completed jobs.
    pub output_location: Option<String>,
    pub failure_reason: Option<String>,
}

impl JobNotification {
    pub fn new(job_id: JobId, status: BackendStatus) -> Self {
        Self {
            job_id,
            status,
            output_location: None,
            failure_reason: None,
        }
    }

    pub fn completed(job_id: JobId, output_location: impl Into<String>) -> Self {
        Self {
            output_location: Some(output_location.into()),
            ..Self::new(job_id, BackendStatus::Completed)
        }
    }

    pub fn failed(job_id: JobId, reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::new(job_id, BackendStatus::Failed)
        }
    }
}

pub type NotificationSender = mpsc::UnboundedSender<JobNotification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<JobNotification>;

/// Event channel between a backend and the completion listener.
pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    mpsc::unbounded_channel()
}
