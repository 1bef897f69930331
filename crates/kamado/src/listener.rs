//! # Completion Listener
//!
//! Applies backend notifications to the inventory and wakes the scheduler.
//!
//! Each notification becomes one compare-and-set on the job's current status.
//! A lost race re-reads the record and tries again; a notification that would
//! move a terminal job, or move a job backwards, is dropped. When a transition
//! lands in a terminal state the job's resumption handle is resolved, which
//! frees the concurrency slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{JobNotification, NotificationReceiver};
use crate::error::InventoryError;
use crate::ids::JobId;
use crate::inventory::{Inventory, JobRecord, JobStatus, JobUpdate};
use crate::resume::ResumptionRegistry;

/// What became of one notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// The job moved to this status.
    Applied(JobStatus),
    /// Duplicate, stale or out of order.
    Dropped,
    /// The job record does not exist yet; replayed once it does.
    Parked,
    /// The backend status carries no state change.
    Ignored,
}

pub struct CompletionListener {
    inventory: Arc<dyn Inventory>,
    registry: Arc<ResumptionRegistry>,
}

impl CompletionListener {
    pub fn new(inventory: Arc<dyn Inventory>, registry: Arc<ResumptionRegistry>) -> Self {
        Self { inventory, registry }
    }

    /// Apply one notification.
    pub async fn handle(&self, notification: JobNotification) -> Result<NotificationOutcome, InventoryError> {
        let Some(target) = notification.status.target() else {
            debug!(
                job_id = %notification.job_id,
                status = %notification.status,
                "ignoring pre-execution status"
            );
            return Ok(NotificationOutcome::Ignored);
        };

        let mut notification = notification;
        loop {
            let lookup = self.inventory.get(&notification.job_id).await;
            let current = match lookup {
                Ok(record) => record,
                Err(InventoryError::JobNotFound(_)) => match self.registry.park(notification).await {
                    Some(retry) => {
                        notification = retry;
                        continue;
                    }
                    None => return Ok(NotificationOutcome::Parked),
                },
                Err(e) => return Err(e),
            };

            if current.status == target || !current.status.can_transition_to(target) {
                debug!(
                    job_id = %current.job_id,
                    current = %current.status,
                    reported = %notification.status,
                    "dropping notification"
                );
                return Ok(NotificationOutcome::Dropped);
            }

            let update = match target {
                JobStatus::Completed => JobUpdate {
                    output_location: Some(
                        notification
                            .output_location
                            .clone()
                            .unwrap_or_else(|| default_output_location(&current)),
                    ),
                    failure_reason: None,
                },
                JobStatus::Failed => JobUpdate::failure(
                    notification
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("backend reported {}", notification.status)),
                ),
                _ => JobUpdate::default(),
            };

            match self
                .inventory
                .update_status(&current.job_id, current.status, target, update)
                .await
            {
                Ok(updated) => {
                    info!(
                        run_id = %updated.run_id,
                        job_id = %updated.job_id,
                        unit = updated.unit.index,
                        from = %current.status,
                        to = %updated.status,
                        "job transitioned"
                    );
                    if updated.is_terminal() {
                        self.registry.resolve(&updated.job_id, updated.clone()).await;
                    }
                    return Ok(NotificationOutcome::Applied(updated.status));
                }
                Err(InventoryError::StaleStatus { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark a job whose deadline passed as timed out.
    ///
    /// Returns the job's terminal record, whichever transition won.
    pub async fn expire(&self, job_id: &JobId) -> Result<JobRecord, InventoryError> {
        loop {
            let current = self.inventory.get(job_id).await?;
            if current.is_terminal() {
                return Ok(current);
            }

            match self
                .inventory
                .update_status(
                    job_id,
                    current.status,
                    JobStatus::TimedOut,
                    JobUpdate::failure("no terminal notification before deadline"),
                )
                .await
            {
                Ok(updated) => {
                    warn!(
                        run_id = %updated.run_id,
                        job_id = %job_id,
                        unit = updated.unit.index,
                        "job timed out"
                    );
                    return Ok(updated);
                }
                Err(InventoryError::StaleStatus { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume `events` on a background task until the channel closes or the
    /// returned handle is shut down or dropped.
    pub fn spawn(self: Arc<Self>, mut events: NotificationReceiver) -> ListenerHandle {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // fires on shutdown and when the handle is dropped
                    _ = &mut stopped => {
                        debug!(applied = counter.load(Ordering::Relaxed), "listener stopped");
                        break;
                    }
                    event = events.recv() => {
                        let Some(notification) = event else {
                            debug!("notification channel closed");
                            break;
                        };
                        let job_id = notification.job_id.clone();
                        match self.handle(notification).await {
                            Ok(NotificationOutcome::Applied(_)) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(_) => {}
                            Err(e) => error!(job_id = %job_id, error = %e, "failed to apply notification"),
                        }
                    }
                }
            }
        });

        ListenerHandle {
            stop: Some(stop),
            applied,
            task,
        }
    }
}

/// Owns the listener's background loop. Dropping it stops the loop.
pub struct ListenerHandle {
    /// `None` once shutdown has been requested.
    stop: Option<oneshot::Sender<()>>,
    applied: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Channel notifications that changed a job's status so far.
    ///
    /// Duplicates, stale reports and ignored statuses are not counted.
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop consuming notifications. Events still queued are left unapplied.
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Where a completed job's output lives when the backend did not say.
fn default_output_location(record: &JobRecord) -> String {
    let file = record
        .unit
        .input_location
        .rsplit('/')
        .next()
        .unwrap_or_default();
    format!("{}{file}.out", record.unit.output_prefix)
}
