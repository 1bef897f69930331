//! Run status snapshots and final reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{JobId, RunId};
use crate::inventory::{JobRecord, JobStatus, RunRecord};
use crate::join::{JoinFault, JoinOutcome};

/// Number of jobs per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub submitted: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl StatusCounts {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.add(record.status);
        }
        counts
    }

    /// Counts for a whole run: units with no job record yet are `pending`.
    pub fn for_run(run: &RunRecord, jobs: &[JobRecord]) -> Self {
        let mut counts = Self::from_records(jobs);
        counts.pending += run.unit_count.saturating_sub(jobs.len());
        counts
    }

    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Submitted => self.submitted += 1,
            JobStatus::InProgress => self.in_progress += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::TimedOut => self.timed_out += 1,
        }
    }

    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Submitted => self.submitted,
            JobStatus::InProgress => self.in_progress,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::TimedOut => self.timed_out,
        }
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.timed_out
    }
}

/// Point-in-time view of a run, read from the inventory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    /// Units not yet submitted count as `pending`.
    pub counts: StatusCounts,
    /// Units the run was split into.
    pub unit_count: usize,
    /// Every unit has a job and every job is terminal.
    pub overall_complete: bool,
    /// Raw outputs of completed jobs, by unit index.
    pub output_locations: Vec<String>,
    pub joined_location: Option<String>,
}

impl RunStatus {
    pub fn new(run: &RunRecord, jobs: &[JobRecord]) -> Self {
        let counts = StatusCounts::for_run(run, jobs);
        Self {
            run_id: run.run_id,
            counts,
            unit_count: run.unit_count,
            overall_complete: counts.pending == 0 && counts.terminal() == run.unit_count,
            output_locations: jobs
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .filter_map(|j| j.output_location.clone())
                .collect(),
            joined_location: run.joined_location.clone(),
        }
    }
}

/// Terminal state of one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub index: usize,
    pub job_id: JobId,
    pub status: JobStatus,
    /// Source offset of the unit's first record.
    pub start: usize,
    pub records: usize,
    pub output_location: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&JobRecord> for UnitOutcome {
    fn from(job: &JobRecord) -> Self {
        Self {
            index: job.unit.index,
            job_id: job.job_id.clone(),
            status: job.status,
            start: job.unit.start,
            records: job.unit.len,
            output_location: job.output_location.clone(),
            failure_reason: job.failure_reason.clone(),
        }
    }
}

/// Final account of a run: every unit's terminal status and the joined output.
///
/// The `failed` and `timed_out` lists are what a follow-up run would resubmit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub model_id: String,
    pub counts: StatusCounts,
    pub succeeded: Vec<UnitOutcome>,
    pub failed: Vec<UnitOutcome>,
    pub timed_out: Vec<UnitOutcome>,
    pub joined_location: Option<String>,
    pub records_joined: usize,
    /// Completed units whose output could not be joined.
    pub join_faults: Vec<JoinFault>,
}

impl RunReport {
    pub fn new(run: &RunRecord, jobs: &[JobRecord], join: Option<&JoinOutcome>) -> Self {
        let pick = |status: JobStatus| -> Vec<UnitOutcome> {
            jobs.iter()
                .filter(|j| j.status == status)
                .map(UnitOutcome::from)
                .collect()
        };

        Self {
            run_id: run.run_id,
            model_id: run.model_id.clone(),
            counts: StatusCounts::for_run(run, jobs),
            succeeded: pick(JobStatus::Completed),
            failed: pick(JobStatus::Failed),
            timed_out: pick(JobStatus::TimedOut),
            joined_location: join
                .and_then(|j| j.location.clone())
                .or_else(|| run.joined_location.clone()),
            records_joined: join.map(|j| j.records_written).unwrap_or_default(),
            join_faults: join.map(|j| j.faults.clone()).unwrap_or_default(),
        }
    }

    /// Units that did not produce joined output.
    pub fn unsuccessful(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.failed.iter().chain(self.timed_out.iter())
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty() && self.join_faults.is_empty()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.is_clean() { "completed" } else { "completed with failures" };
        writeln!(f, "Run {} ({}) {outcome}", self.run_id, self.model_id)?;
        writeln!(f)?;
        writeln!(f, "Summary:")?;
        writeln!(f, "- Units: {}", self.counts.total())?;
        writeln!(f, "- Succeeded: {}", self.counts.completed)?;
        writeln!(f, "- Failed: {}", self.counts.failed)?;
        writeln!(f, "- Timed out: {}", self.counts.timed_out)?;
        writeln!(f, "- Records joined: {}", self.records_joined)?;

        let mut units: Vec<&UnitOutcome> = self
            .succeeded
            .iter()
            .chain(self.failed.iter())
            .chain(self.timed_out.iter())
            .collect();
        units.sort_by_key(|u| u.index);

        writeln!(f)?;
        writeln!(f, "Units:")?;
        for unit in units {
            write!(f, "- #{:04} {} {} ({} records)", unit.index, unit.job_id, unit.status, unit.records)?;
            if let Some(reason) = &unit.failure_reason {
                write!(f, ": {reason}")?;
            }
            writeln!(f)?;
        }

        if !self.join_faults.is_empty() {
            writeln!(f)?;
            writeln!(f, "Join faults:")?;
            for fault in &self.join_faults {
                writeln!(f, "- #{:04} {}: {}", fault.unit, fault.job_id, fault.reason)?;
            }
        }

        writeln!(f)?;
        match &self.joined_location {
            Some(location) => write!(f, "Output: {location}"),
            None => write!(f, "Output: none"),
        }
    }
}
