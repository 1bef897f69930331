//! # Output Joiner
//!
//! Pairs every output line of a completed job with the input record it
//! answers and writes one consolidated JSON Lines file per run. Each joined
//! line is the original record plus one of:
//!
//! - `response`: generated text
//! - `embedding`: the vector
//! - `error`: the per-record error the backend reported
//!
//! Lines are correlated by `recordId` when every output line carries one and
//! the unit's input ids are distinct, and by position otherwise. A unit whose output cannot be correlated is left out
//! of the consolidated file and reported as a fault; the remaining units are
//! still joined.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::blob::{BlobStore, join_location};
use crate::error::JoinError;
use crate::format::{InputFormatter, ParsedLine, ResponsePayload};
use crate::ids::{JobId, RunId};
use crate::inventory::{JobRecord, JobStatus};
use crate::partition::BatchUnit;
use crate::pipeline::RESPONSE_FIELD;
use crate::record::{Record, encode_json_lines, record_id};

/// A unit excluded from the consolidated output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinFault {
    pub unit: usize,
    pub job_id: JobId,
    pub reason: String,
}

/// Result of joining one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinOutcome {
    /// Consolidated file, when at least one unit was joined.
    pub location: Option<String>,
    pub joined_units: Vec<usize>,
    pub records_written: usize,
    pub faults: Vec<JoinFault>,
}

pub struct OutputJoiner {
    blobs: Arc<dyn BlobStore>,
    joined_prefix: String,
}

impl OutputJoiner {
    pub fn new(blobs: Arc<dyn BlobStore>, joined_prefix: impl Into<String>) -> Self {
        Self {
            blobs,
            joined_prefix: joined_prefix.into(),
        }
    }

    /// Where the consolidated output of `run_id` is written.
    pub fn location(&self, run_id: RunId) -> String {
        join_location(&self.joined_prefix, &format!("{run_id}/joined.jsonl"))
    }

    /// Join every completed job of a run.
    ///
    /// `units` are the run's Batch Units by index; `jobs` its job records.
    /// Nothing here fails the run: a unit that cannot be joined, or a
    /// consolidated file that cannot be written, is reported as a fault.
    pub async fn join(
        &self,
        run_id: RunId,
        jobs: &[JobRecord],
        units: &[BatchUnit],
        formatter: &InputFormatter,
    ) -> JoinOutcome {
        let mut outcome = JoinOutcome::default();
        let mut joined: Vec<Record> = vec![];

        let completed = jobs.iter().filter(|j| j.status == JobStatus::Completed);
        for job in completed {
            let Some(unit) = units.iter().find(|u| u.index == job.unit.index) else {
                outcome.faults.push(JoinFault {
                    unit: job.unit.index,
                    job_id: job.job_id.clone(),
                    reason: "unit records unavailable".to_string(),
                });
                continue;
            };

            match self.join_unit(job, unit, formatter).await {
                Ok(records) => {
                    outcome.joined_units.push(unit.index);
                    joined.extend(records);
                }
                Err(e) => {
                    warn!(run_id = %run_id, job_id = %job.job_id, unit = unit.index, error = %e, "unit left out of joined output");
                    outcome.faults.push(JoinFault {
                        unit: unit.index,
                        job_id: job.job_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if outcome.joined_units.is_empty() {
            info!(run_id = %run_id, "no completed units to join");
            return outcome;
        }

        let location = self.location(run_id);
        if let Err(e) = self.blobs.write(&location, encode_json_lines(&joined)).await {
            error!(run_id = %run_id, location = %location, error = %e, "failed to write joined output");
            // nothing reached the consolidated file, so every joined unit is a fault
            for index in outcome.joined_units.drain(..) {
                let job_id = jobs
                    .iter()
                    .find(|j| j.unit.index == index)
                    .map(|j| j.job_id.clone())
                    .unwrap_or_else(JobId::local);
                outcome.faults.push(JoinFault {
                    unit: index,
                    job_id,
                    reason: format!("joined output not written: {e}"),
                });
            }
            outcome.faults.sort_by_key(|f| f.unit);
            return outcome;
        }

        info!(
            run_id = %run_id,
            location = %location,
            units = outcome.joined_units.len(),
            records = joined.len(),
            "wrote joined output"
        );
        outcome.records_written = joined.len();
        outcome.location = Some(location);
        outcome
    }

    /// Correlate one job's output with its unit's records, in input order.
    pub async fn join_unit(
        &self,
        job: &JobRecord,
        unit: &BatchUnit,
        formatter: &InputFormatter,
    ) -> Result<Vec<Record>, JoinError> {
        let location = job
            .output_location
            .as_deref()
            .ok_or_else(|| JoinError::MissingOutput(job.job_id.clone()))?;
        let bytes = self.blobs.read(location).await?;
        let text = String::from_utf8_lossy(&bytes);

        let parsed = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(line, raw)| {
                formatter.parse_line(raw).map_err(|reason| JoinError::Parse {
                    unit: unit.index,
                    line: line + 1,
                    reason,
                })
            })
            .collect::<Result<Vec<ParsedLine>, JoinError>>()?;

        if parsed.len() != unit.len() {
            return Err(JoinError::CorrelationMismatch {
                unit: unit.index,
                expected: unit.len(),
                actual: parsed.len(),
            });
        }

        let field = formatter.record_id_field();
        let ordered = if parsed.iter().all(|p| p.record_id.is_some()) && distinct_ids(unit, field) {
            by_record_id(unit, parsed, field)?
        } else {
            parsed.into_iter().map(|p| p.payload).collect()
        };

        Ok(unit
            .records
            .iter()
            .zip(ordered)
            .map(|(record, payload)| merge(record, payload))
            .collect())
    }
}

/// Whether every record of `unit` carries an id no other record shares.
fn distinct_ids(unit: &BatchUnit, field: &str) -> bool {
    let mut seen = HashSet::with_capacity(unit.len());
    unit.records
        .iter()
        .all(|record| record_id(record, field).is_some_and(|id| seen.insert(id)))
}

fn by_record_id(unit: &BatchUnit, parsed: Vec<ParsedLine>, field: &str) -> Result<Vec<ResponsePayload>, JoinError> {
    let mut by_id: HashMap<String, ResponsePayload> = HashMap::with_capacity(parsed.len());
    for line in parsed {
        if let Some(id) = line.record_id {
            by_id.insert(id, line.payload);
        }
    }

    unit.records
        .iter()
        .map(|record| {
            let id = record_id(record, field).unwrap_or_default();
            by_id.remove(&id).ok_or(JoinError::UnknownRecordId {
                unit: unit.index,
                record_id: id,
            })
        })
        .collect()
}

fn merge(record: &Record, payload: ResponsePayload) -> Record {
    let mut joined = record.clone();
    match payload {
        ResponsePayload::Text(text) => {
            joined.insert(RESPONSE_FIELD.to_string(), Value::String(text));
        }
        ResponsePayload::Embedding(vector) => {
            joined.insert("embedding".to_string(), Value::from(vector));
        }
        ResponsePayload::Error(error) => {
            joined.insert("error".to_string(), error);
        }
    }
    joined
}
