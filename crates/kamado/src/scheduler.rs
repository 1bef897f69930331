//! # Job Submission Scheduler
//!
//! Submits a run's units in source order while at most `ceiling` of its jobs
//! are non-terminal. The free slot count is never stored: it is derived from
//! [`Inventory::count_non_terminal`] each time a unit is about to go out.
//!
//! When every slot is taken the scheduler suspends on the resumption handles
//! of its outstanding jobs. Each handle is raced against the job's deadline;
//! a job that hits its deadline is timed out through the
//! [`CompletionListener`], so terminal transitions of accepted jobs all go
//! through one place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot::error::RecvError;
use tokio::time::{Instant, error::Elapsed, timeout_at};
use tracing::{debug, error, info, warn};

use crate::backend::{InferenceBackend, SubmitRequest};
use crate::error::InventoryError;
use crate::ids::{JobId, RunId};
use crate::inventory::{Inventory, JobRecord, UnitRef};
use crate::listener::CompletionListener;
use crate::resume::ResumptionRegistry;

/// A formatted unit waiting to be submitted.
#[derive(Clone, Debug)]
pub struct ScheduledUnit {
    pub job_name: String,
    pub unit: UnitRef,
}

/// A job's id with either its terminal record or the deadline it missed.
type Settlement = (JobId, Result<Result<JobRecord, RecvError>, Elapsed>);

/// Submission loop for one run at a time.
///
/// A scheduler holds no per-run state of its own; everything it needs to
/// decide whether a slot is free lives in the inventory.
pub struct Scheduler {
    backend: Arc<dyn InferenceBackend>,
    inventory: Arc<dyn Inventory>,
    registry: Arc<ResumptionRegistry>,

    /// Applies replayed early notifications and times out late jobs.
    listener: Arc<CompletionListener>,

    /// How long an accepted job may stay non-terminal.
    job_deadline: Duration,
}

impl Scheduler {
    /// Create a scheduler.
    ///
    /// # Parameters
    ///
    /// * `registry` - Must be the registry `listener` resolves handles through
    /// * `job_deadline` - Time after submission at which a silent job is
    ///   marked `TIMED_OUT`
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        inventory: Arc<dyn Inventory>,
        registry: Arc<ResumptionRegistry>,
        listener: Arc<CompletionListener>,
        job_deadline: Duration,
    ) -> Self {
        Self {
            backend,
            inventory,
            registry,
            listener,
            job_deadline,
        }
    }

    /// Submit every unit and wait until all of them are terminal.
    ///
    /// Per-unit submission failures are recorded and do not stop the loop;
    /// only an inventory failure does. Even then every job already accepted
    /// is waited for, or timed out, before the error is returned, so no
    /// accepted job is left holding a slot.
    ///
    /// # Parameters
    ///
    /// * `ceiling` - Maximum number of non-terminal jobs of `run_id`
    /// * `units` - Formatted units, submitted in this order
    pub async fn run(
        &self,
        run_id: RunId,
        model_id: &str,
        ceiling: usize,
        units: Vec<ScheduledUnit>,
    ) -> Result<(), InventoryError> {
        let mut pending: FuturesUnordered<BoxFuture<'static, Settlement>> = FuturesUnordered::new();

        let submitted = self.submit_all(run_id, model_id, ceiling, units, &mut pending).await;
        if let Err(e) = &submitted {
            error!(run_id = %run_id, outstanding = pending.len(), error = %e, "submission stopped; draining accepted jobs");
        }

        let mut drained = Ok(());
        while let Some((job_id, outcome)) = pending.next().await {
            if let Err(e) = self.settle(job_id.clone(), outcome).await {
                error!(run_id = %run_id, job_id = %job_id, error = %e, "failed to settle job");
                if drained.is_ok() {
                    drained = Err(e);
                }
            }
        }
        debug!(run_id = %run_id, "all units settled");
        submitted.and(drained)
    }

    async fn submit_all(
        &self,
        run_id: RunId,
        model_id: &str,
        ceiling: usize,
        units: Vec<ScheduledUnit>,
        pending: &mut FuturesUnordered<BoxFuture<'static, Settlement>>,
    ) -> Result<(), InventoryError> {
        for scheduled in units {
            self.wait_for_slot(run_id, ceiling, pending).await?;
            self.submit(run_id, model_id, scheduled, pending).await?;
        }
        Ok(())
    }

    async fn wait_for_slot(
        &self,
        run_id: RunId,
        ceiling: usize,
        pending: &mut FuturesUnordered<BoxFuture<'static, Settlement>>,
    ) -> Result<(), InventoryError> {
        loop {
            let live = self.inventory.count_non_terminal(&run_id).await?;
            if live < ceiling {
                return Ok(());
            }

            debug!(run_id = %run_id, live, ceiling, "waiting for a free slot");
            match pending.next().await {
                Some((job_id, outcome)) => self.settle(job_id, outcome).await?,
                None => {
                    warn!(run_id = %run_id, live, ceiling, "slots full with nothing outstanding");
                    return Ok(());
                }
            }
        }
    }

    async fn submit(
        &self,
        run_id: RunId,
        model_id: &str,
        scheduled: ScheduledUnit,
        pending: &mut FuturesUnordered<BoxFuture<'static, Settlement>>,
    ) -> Result<(), InventoryError> {
        let ScheduledUnit { job_name, unit } = scheduled;
        let index = unit.index;
        let request = SubmitRequest {
            job_name,
            model_id: model_id.to_string(),
            input_location: unit.input_location.clone(),
            output_prefix: unit.output_prefix.clone(),
        };

        let (token, handle) = self.registry.register().await;
        let job_id = match self.backend.submit(request).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.registry.cancel(token).await;
                warn!(run_id = %run_id, unit = index, error = %e, "submission rejected");
                let record = JobRecord::rejected(run_id, unit, e.to_string(), Utc::now());
                return self.inventory.put(record).await;
            }
        };

        let now = Utc::now();
        let record = JobRecord::submitted(
            job_id.clone(),
            run_id,
            unit,
            now,
            wall_deadline(now, self.job_deadline),
        );
        if let Err(e) = self.inventory.put(record).await {
            self.registry.cancel(token).await;
            return Err(e);
        }
        info!(run_id = %run_id, job_id = %job_id, unit = index, "unit submitted");

        for early in self.registry.bind(token, &job_id).await {
            if let Err(e) = self.listener.handle(early).await {
                error!(job_id = %job_id, error = %e, "failed to replay parked notification");
            }
        }

        let deadline = timer_deadline(self.job_deadline);
        pending.push(
            async move {
                let outcome = timeout_at(deadline, handle).await;
                (job_id, outcome)
            }
            .boxed(),
        );
        Ok(())
    }

    async fn settle(
        &self,
        job_id: JobId,
        outcome: Result<Result<JobRecord, RecvError>, Elapsed>,
    ) -> Result<(), InventoryError> {
        match outcome {
            Ok(Ok(record)) => {
                debug!(job_id = %job_id, status = %record.status, "slot released");
            }
            Ok(Err(_)) | Err(_) => {
                self.listener.expire(&job_id).await?;
            }
        }
        self.registry.forget(&job_id).await;
        Ok(())
    }
}

fn wall_deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(after)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn timer_deadline(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, Submission};
    use crate::backend::{JobNotification, NotificationSender, notification_channel};
    use crate::inventory::memory::tests::{RefusingInventory, unit_ref};
    use crate::inventory::{JobStatus, MemoryInventory};
    use crate::listener::ListenerHandle;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;

    struct Harness {
        inventory: Arc<MemoryInventory>,
        submissions: UnboundedReceiver<Submission>,
        events: NotificationSender,
        task: JoinHandle<Result<(), InventoryError>>,
        _listener: ListenerHandle,
    }

    fn start(
        backend: MockBackend,
        submissions: UnboundedReceiver<Submission>,
        units: usize,
        ceiling: usize,
        deadline: Duration,
    ) -> (RunId, Harness) {
        let memory = Arc::new(MemoryInventory::new());
        start_with(backend, submissions, memory.clone(), memory, units, ceiling, deadline)
    }

    fn start_with(
        backend: MockBackend,
        submissions: UnboundedReceiver<Submission>,
        store: Arc<dyn Inventory>,
        inventory: Arc<MemoryInventory>,
        units: usize,
        ceiling: usize,
        deadline: Duration,
    ) -> (RunId, Harness) {
        let registry = Arc::new(ResumptionRegistry::new());
        let listener = Arc::new(CompletionListener::new(store.clone(), registry.clone()));
        let (events, rx) = notification_channel();
        let listening = listener.clone().spawn(rx);

        let scheduler = Scheduler::new(Arc::new(backend), store, registry, listener, deadline);
        let run_id = RunId::new();
        let scheduled: Vec<ScheduledUnit> = (0..units)
            .map(|i| ScheduledUnit {
                job_name: format!("{run_id}-{i:04}"),
                unit: unit_ref(i),
            })
            .collect();
        let task = tokio::spawn(async move { scheduler.run(run_id, "model", ceiling, scheduled).await });

        (
            run_id,
            Harness {
                inventory,
                submissions,
                events,
                task,
                _listener: listening,
            },
        )
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test]
    async fn third_unit_waits_for_a_free_slot() {
        let (backend, rx) = MockBackend::new();
        let (run_id, mut h) = start(backend, rx, 3, 2, DAY);

        let first = h.submissions.recv().await.unwrap();
        let second = h.submissions.recv().await.unwrap();
        assert_eq!((first.unit_index(), second.unit_index()), (0, 1));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.submissions.recv())
                .await
                .is_err()
        );
        assert_eq!(h.inventory.count_non_terminal(&run_id).await.unwrap(), 2);

        h.events
            .send(JobNotification::completed(second.job_id.clone(), "out"))
            .unwrap();
        let third = h.submissions.recv().await.unwrap();
        assert_eq!(third.unit_index(), 2);
        assert!(h.inventory.get(&second.job_id).await.unwrap().is_terminal());

        for job in [first, third] {
            h.events.send(JobNotification::completed(job.job_id, "out")).unwrap();
        }
        h.task.await.unwrap().unwrap();
        assert_eq!(h.inventory.count_non_terminal(&run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn live_jobs_never_exceed_ceiling() {
        let (backend, rx) = MockBackend::new();
        let (run_id, mut h) = start(backend, rx, 9, 3, DAY);

        let mut seen = 0;
        while seen < 9 {
            let submission = h.submissions.recv().await.unwrap();
            seen += 1;
            assert!(h.inventory.count_non_terminal(&run_id).await.unwrap() <= 3);
            // finish every other job immediately so slots open unevenly
            if seen % 2 == 0 || seen > 6 {
                h.events
                    .send(JobNotification::failed(submission.job_id, "nope"))
                    .unwrap();
            } else {
                let events = h.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let _ = events.send(JobNotification::completed(submission.job_id, "out"));
                });
            }
        }

        h.task.await.unwrap().unwrap();
        let records = h.inventory.list_by_run(&run_id).await.unwrap();
        assert_eq!(records.len(), 9);
        assert!(records.iter().all(|r| r.is_terminal()));
    }

    #[tokio::test]
    async fn rejected_units_fail_without_holding_a_slot() {
        let (backend, rx) = MockBackend::new();
        let backend = backend.reject_unit(0);
        let (run_id, mut h) = start(backend, rx, 2, 1, DAY);

        let accepted = h.submissions.recv().await.unwrap();
        assert_eq!(accepted.unit_index(), 1);
        h.events.send(JobNotification::completed(accepted.job_id, "out")).unwrap();
        h.task.await.unwrap().unwrap();

        let records = h.inventory.list_by_run(&run_id).await.unwrap();
        assert_eq!(records[0].status, JobStatus::Failed);
        assert!(records[0].job_id.as_str().starts_with("local-"));
        assert!(records[0].failure_reason.as_deref().unwrap().contains("rejected"));
        assert_eq!(records[1].status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_jobs_time_out_and_release_their_slot() {
        let (backend, rx) = MockBackend::new();
        let (run_id, mut h) = start(backend, rx, 2, 1, Duration::from_secs(60));

        let silent = h.submissions.recv().await.unwrap();
        let next = h.submissions.recv().await.unwrap();
        assert_eq!(next.unit_index(), 1);
        assert_eq!(
            h.inventory.get(&silent.job_id).await.unwrap().status,
            JobStatus::TimedOut
        );

        h.events.send(JobNotification::completed(next.job_id.clone(), "out")).unwrap();
        h.task.await.unwrap().unwrap();

        // a completion after the deadline is ignored
        h.events.send(JobNotification::completed(silent.job_id.clone(), "out")).unwrap();
        tokio::task::yield_now().await;
        let records = h.inventory.list_by_run(&run_id).await.unwrap();
        assert_eq!(records[0].status, JobStatus::TimedOut);
        assert_eq!(records[1].status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn inventory_failure_still_settles_accepted_jobs() {
        let (backend, rx) = MockBackend::new();
        let memory = Arc::new(MemoryInventory::new());
        let store = Arc::new(RefusingInventory::new(memory.clone(), 1));
        let (run_id, mut h) = start_with(backend, rx, store, memory, 3, 3, Duration::from_secs(60));

        let silent = h.submissions.recv().await.unwrap();
        let unrecorded = h.submissions.recv().await.unwrap();
        assert_eq!(unrecorded.unit_index(), 1);

        // the error only surfaces once the silent job has hit its deadline
        let err = (&mut h.task).await.unwrap().unwrap_err();
        assert!(matches!(err, InventoryError::Journal(_)));
        assert_eq!(
            h.inventory.get(&silent.job_id).await.unwrap().status,
            JobStatus::TimedOut
        );
        assert_eq!(h.inventory.count_non_terminal(&run_id).await.unwrap(), 0);
        assert!(h.submissions.try_recv().is_err());
    }
}
