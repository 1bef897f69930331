use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::memory::InventoryState;
use super::{Inventory, JobRecord, JobStatus, JobUpdate, RunRecord};
use crate::error::InventoryError;
use crate::ids::{JobId, RunId};

/// One appended change.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    PutJob {
        record: JobRecord,
    },
    Transition {
        job_id: JobId,
        expected: JobStatus,
        next: JobStatus,
        update: JobUpdate,
        at: DateTime<Utc>,
    },
    PutRun {
        run: RunRecord,
    },
    RunTerminal {
        run_id: RunId,
        joined_location: Option<String>,
        at: DateTime<Utc>,
    },
}

struct Journal {
    state: InventoryState,
    file: File,
}

/// Inventory persisted as an append-only JSON Lines journal.
///
/// Every accepted change is appended and flushed before it becomes visible,
/// so reopening the same path after a restart reproduces the last committed
/// state. A torn final line from an interrupted write is skipped on replay.
pub struct JournalInventory {
    path: PathBuf,
    inner: Mutex<Journal>,
}

impl JournalInventory {
    /// Open (or create) the journal at `path` and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref().to_path_buf();
        let mut state = InventoryState::default();

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = existing.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut replayed = 0;
        let mut torn = false;
        for (idx, line) in lines.iter().enumerate() {
            let entry: JournalEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) if idx + 1 == lines.len() => {
                    debug!(path = %path.display(), error = %e, "dropping torn journal tail");
                    torn = true;
                    continue;
                }
                Err(e) => {
                    return Err(InventoryError::Journal(format!("line {}: {e}", idx + 1)));
                }
            };
            apply(&mut state, entry)?;
            replayed += 1;
        }

        if torn {
            let mut kept = lines[..lines.len() - 1].join("\n");
            if !kept.is_empty() {
                kept.push('\n');
            }
            tokio::fs::write(&path, kept).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), entries = replayed, "opened inventory journal");
        Ok(Self {
            path,
            inner: Mutex::new(Journal { state, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn apply(state: &mut InventoryState, entry: JournalEntry) -> Result<(), InventoryError> {
    match entry {
        JournalEntry::PutJob { record } => state.commit_job(record),
        JournalEntry::Transition {
            job_id,
            expected,
            next,
            update,
            at,
        } => {
            let record = state.prepare_transition(&job_id, expected, next, update, at)?;
            state.commit_job(record);
        }
        JournalEntry::PutRun { run } => state.commit_run(run),
        JournalEntry::RunTerminal {
            run_id,
            joined_location,
            at,
        } => {
            let run = state.prepare_run_terminal(&run_id, joined_location, at)?;
            state.commit_run(run);
        }
    }
    Ok(())
}

impl Journal {
    async fn append(&mut self, entry: &JournalEntry) -> Result<(), InventoryError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| InventoryError::Journal(e.to_string()))?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Inventory for JournalInventory {
    async fn put(&self, record: JobRecord) -> Result<(), InventoryError> {
        let mut journal = self.inner.lock().await;
        journal.state.check_new_job(&record)?;
        journal
            .append(&JournalEntry::PutJob {
                record: record.clone(),
            })
            .await?;
        journal.state.commit_job(record);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<JobRecord, InventoryError> {
        self.inner.lock().await.state.job(job_id).cloned()
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        next: JobStatus,
        update: JobUpdate,
    ) -> Result<JobRecord, InventoryError> {
        let mut journal = self.inner.lock().await;
        let at = Utc::now();
        let record = journal
            .state
            .prepare_transition(job_id, expected, next, update.clone(), at)?;
        journal
            .append(&JournalEntry::Transition {
                job_id: job_id.clone(),
                expected,
                next,
                update,
                at,
            })
            .await?;
        journal.state.commit_job(record.clone());
        Ok(record)
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<JobRecord>, InventoryError> {
        Ok(self.inner.lock().await.state.jobs_for_run(run_id))
    }

    async fn put_run(&self, run: RunRecord) -> Result<(), InventoryError> {
        let mut journal = self.inner.lock().await;
        journal.append(&JournalEntry::PutRun { run: run.clone() }).await?;
        journal.state.commit_run(run);
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, InventoryError> {
        self.inner.lock().await.state.run(run_id).cloned()
    }

    async fn mark_run_terminal(
        &self,
        run_id: &RunId,
        joined_location: Option<String>,
    ) -> Result<RunRecord, InventoryError> {
        let mut journal = self.inner.lock().await;
        let at = Utc::now();
        let run = journal
            .state
            .prepare_run_terminal(run_id, joined_location.clone(), at)?;
        journal
            .append(&JournalEntry::RunTerminal {
                run_id: *run_id,
                joined_location,
                at,
            })
            .await?;
        journal.state.commit_run(run.clone());
        Ok(run)
    }
}
