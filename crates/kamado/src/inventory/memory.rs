use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Inventory, JobRecord, JobStatus, JobUpdate, RunRecord};
use crate::error::InventoryError;
use crate::ids::{JobId, RunId};

/// Record maps shared by the in-memory and journaled inventories.
///
/// Mutations are split into a `prepare_*` step that validates and builds the
/// new record and a `commit_*` step that stores it, so a journal can persist
/// the change in between.
#[derive(Default)]
pub(crate) struct InventoryState {
    jobs: HashMap<JobId, JobRecord>,
    by_run: HashMap<RunId, Vec<JobId>>,
    runs: HashMap<RunId, RunRecord>,
}

impl InventoryState {
    pub(crate) fn check_new_job(&self, record: &JobRecord) -> Result<(), InventoryError> {
        if self.jobs.contains_key(&record.job_id) {
            return Err(InventoryError::DuplicateJob(record.job_id.clone()));
        }
        Ok(())
    }

    pub(crate) fn commit_job(&mut self, record: JobRecord) {
        if !self.jobs.contains_key(&record.job_id) {
            self.by_run
                .entry(record.run_id)
                .or_default()
                .push(record.job_id.clone());
        }
        self.jobs.insert(record.job_id.clone(), record);
    }

    pub(crate) fn job(&self, job_id: &JobId) -> Result<&JobRecord, InventoryError> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| InventoryError::JobNotFound(job_id.clone()))
    }

    pub(crate) fn prepare_transition(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        next: JobStatus,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, InventoryError> {
        let current = self.job(job_id)?;
        if current.status != expected {
            return Err(InventoryError::StaleStatus {
                job_id: job_id.clone(),
                expected,
                actual: current.status,
            });
        }
        if !current.status.can_transition_to(next) {
            return Err(InventoryError::IllegalTransition {
                job_id: job_id.clone(),
                from: current.status,
                to: next,
            });
        }

        let mut record = current.clone();
        record.status = next;
        record.updated_at = now;
        if next == JobStatus::Completed {
            record.output_location = update.output_location;
        }
        if matches!(next, JobStatus::Failed | JobStatus::TimedOut) {
            record.failure_reason = update.failure_reason;
        }
        Ok(record)
    }

    pub(crate) fn jobs_for_run(&self, run_id: &RunId) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .by_run
            .get(run_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id).cloned())
            .collect();
        records.sort_by_key(|r| r.unit.index);
        records
    }

    pub(crate) fn commit_run(&mut self, run: RunRecord) {
        self.runs.insert(run.run_id, run);
    }

    pub(crate) fn run(&self, run_id: &RunId) -> Result<&RunRecord, InventoryError> {
        self.runs
            .get(run_id)
            .ok_or(InventoryError::RunNotFound(*run_id))
    }

    pub(crate) fn prepare_run_terminal(
        &self,
        run_id: &RunId,
        joined_location: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, InventoryError> {
        let mut run = self.run(run_id)?.clone();
        let live = self
            .jobs_for_run(run_id)
            .iter()
            .filter(|r| !r.is_terminal())
            .count();
        if live > 0 {
            return Err(InventoryError::RunNotTerminal {
                run_id: *run_id,
                live,
            });
        }
        run.terminal = true;
        run.joined_location = joined_location;
        run.updated_at = now;
        Ok(run)
    }
}

/// Inventory held in process memory behind a single async mutex.
#[derive(Default)]
pub struct MemoryInventory {
    state: Mutex<InventoryState>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn put(&self, record: JobRecord) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        state.check_new_job(&record)?;
        state.commit_job(record);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<JobRecord, InventoryError> {
        self.state.lock().await.job(job_id).cloned()
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        next: JobStatus,
        update: JobUpdate,
    ) -> Result<JobRecord, InventoryError> {
        let mut state = self.state.lock().await;
        let record = state.prepare_transition(job_id, expected, next, update, Utc::now())?;
        state.commit_job(record.clone());
        Ok(record)
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<JobRecord>, InventoryError> {
        Ok(self.state.lock().await.jobs_for_run(run_id))
    }

    async fn put_run(&self, run: RunRecord) -> Result<(), InventoryError> {
        self.state.lock().await.commit_run(run);
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, InventoryError> {
        self.state.lock().await.run(run_id).cloned()
    }

    async fn mark_run_terminal(
        &self,
        run_id: &RunId,
        joined_location: Option<String>,
    ) -> Result<RunRecord, InventoryError> {
        let mut state = self.state.lock().await;
        let run = state.prepare_run_terminal(run_id, joined_location, Utc::now())?;
        state.commit_run(run.clone());
        Ok(run)
    }
}
