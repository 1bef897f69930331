//! # Run Coordinator
//!
//! Entry point for orchestrating a Run:
//!
//! 1. validate the model, template and bounds
//! 2. load the source and give every record a correlation id
//! 3. partition and format every unit, writing the request files
//! 4. submit under the concurrency ceiling and wait for every job
//! 5. join completed outputs and close the run
//!
//! Steps 1-3 run inside [`start_run`](RunCoordinator::start_run); any error
//! there aborts the run before a single job is submitted. Steps 4-5 run on a
//! background task, observed through [`status`](RunCoordinator::status) and
//! [`wait`](RunCoordinator::wait).
//!
//! Backend notifications are consumed by a [`CompletionListener`] that the
//! coordinator spawns on construction and stops when dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{InferenceBackend, NotificationReceiver};
use crate::blob::{BlobStore, join_location};
use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, OrchestratorError, PipelineError, Result};
use crate::format::{InputFormatter, TemplateRegistry};
use crate::ids::RunId;
use crate::inventory::{Inventory, JobRecord, JobStatus, RunRecord, UnitRef};
use crate::join::OutputJoiner;
use crate::listener::{CompletionListener, ListenerHandle};
use crate::partition::{BatchBounds, BatchUnit, partition};
use crate::pipeline::{ColumnMapping, PipelineConfig, PipelineReport, StageOutcome};
use crate::record::{Record, SourceDescriptor, SourceFormat, assign_record_ids, encode_json_lines};
use crate::report::{RunReport, RunStatus};
use crate::resume::ResumptionRegistry;
use crate::scheduler::{ScheduledUnit, Scheduler};

/// Parameters of one Run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    /// Where the records come from.
    pub source: SourceDescriptor,
    /// Backend model id; also selects the request shape.
    pub model_id: String,
    /// Required for text models, ignored for embedding models.
    pub template_id: Option<String>,
    /// Record count bounds of every Batch Unit.
    pub bounds: BatchBounds,
    /// Maximum number of simultaneously non-terminal jobs.
    pub ceiling: usize,
}

impl RunRequest {
    pub fn new(source: SourceDescriptor, model_id: impl Into<String>, bounds: BatchBounds, ceiling: usize) -> Self {
        Self {
            source,
            model_id: model_id.into(),
            template_id: None,
            bounds,
            ceiling,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }
}

enum RunState {
    Running(JoinHandle<Result<RunReport>>),
    /// Another caller is awaiting the task.
    Awaited,
    Finished(Box<RunReport>),
}

struct RunContext {
    units: Arc<Vec<BatchUnit>>,
    state: RunState,
}

struct Shared {
    backend: Arc<dyn InferenceBackend>,
    inventory: Arc<dyn Inventory>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<ResumptionRegistry>,
    listener: Arc<CompletionListener>,
    joiner: OutputJoiner,
    config: OrchestratorConfig,
}

impl Shared {
    async fn execute(
        &self,
        request: RunRequest,
        run_id: RunId,
        scheduled: Vec<ScheduledUnit>,
        units: Arc<Vec<BatchUnit>>,
        formatter: InputFormatter,
    ) -> Result<RunReport> {
        let scheduler = Scheduler::new(
            self.backend.clone(),
            self.inventory.clone(),
            self.registry.clone(),
            self.listener.clone(),
            self.config.job_deadline(),
        );
        let submitted = scheduler
            .run(run_id, &request.model_id, request.ceiling, scheduled)
            .await;
        let closed = self.close(run_id, &request.model_id, &units, &formatter).await;

        // a scheduler error outranks whatever closing the run reported
        submitted?;
        closed
    }

    /// Join the completed units and flag the run terminal.
    ///
    /// Runs whether or not submission finished cleanly, so a run whose jobs
    /// are all terminal is always closed.
    async fn close(
        &self,
        run_id: RunId,
        model_id: &str,
        units: &[BatchUnit],
        formatter: &InputFormatter,
    ) -> Result<RunReport> {
        let jobs = self.inventory.list_by_run(&run_id).await?;
        let join = self.joiner.join(run_id, &jobs, units, formatter).await;
        let run = self
            .inventory
            .mark_run_terminal(&run_id, join.location.clone())
            .await?;
        self.registry.evict_parked().await;

        let report = RunReport::new(&run, &jobs, Some(&join));
        info!(
            run_id = %run_id,
            model = %model_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            pending = report.counts.pending,
            join_faults = report.join_faults.len(),
            "run finished"
        );
        Ok(report)
    }
}

/// Runs Runs end to end: validation, partitioning, submission, joining.
///
/// One coordinator may drive several runs at once; they share the backend,
/// the inventory and one completion listener.
pub struct RunCoordinator {
    shared: Arc<Shared>,
    templates: TemplateRegistry,
    runs: Mutex<HashMap<RunId, RunContext>>,
    _listener: ListenerHandle,
}

impl RunCoordinator {
    /// Build a coordinator and start consuming `events`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        inventory: Arc<dyn Inventory>,
        blobs: Arc<dyn BlobStore>,
        templates: TemplateRegistry,
        config: OrchestratorConfig,
        events: NotificationReceiver,
    ) -> Self {
        let registry = Arc::new(ResumptionRegistry::new());
        let listener = Arc::new(CompletionListener::new(inventory.clone(), registry.clone()));
        let listening = listener.clone().spawn(events);
        let joiner = OutputJoiner::new(blobs.clone(), config.joined_prefix.clone());

        Self {
            shared: Arc::new(Shared {
                backend,
                inventory,
                blobs,
                registry,
                listener,
                joiner,
                config,
            }),
            templates,
            runs: Mutex::new(HashMap::new()),
            _listener: listening,
        }
    }

    /// The listener applying backend notifications, for callers that receive
    /// notifications outside the event channel.
    pub fn listener(&self) -> Arc<CompletionListener> {
        self.shared.listener.clone()
    }

    /// Configuration every run of this coordinator uses.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Validate, partition and format a run, then start submitting it.
    ///
    /// Returns once every request file is written; submission continues in
    /// the background.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunId> {
        let config = &self.shared.config;
        config.validate()?;
        if request.ceiling == 0 {
            return Err(ConfigError::ZeroCeiling.into());
        }

        let formatter = InputFormatter::new(
            &request.model_id,
            request.template_id.as_deref(),
            &self.templates,
            config,
        )?;

        let mut records = request.source.load(self.shared.blobs.as_ref()).await?;
        if records.is_empty() {
            return Err(OrchestratorError::Source {
                location: request.source.location.clone(),
                reason: "source contains no records".to_string(),
            });
        }
        let assigned = assign_record_ids(&mut records, formatter.record_id_field());
        let total = records.len();

        let mut units = partition(records, request.bounds);
        if let Some(cap) = config.max_units {
            if units.len() > cap {
                warn!(units = units.len(), cap, "unit cap reached; trailing units are not part of the run");
                units.truncate(cap);
            }
        }

        // render everything first so a bad record aborts before any write
        let rendered = units
            .iter()
            .map(|unit| formatter.render_unit(unit))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let run_id = RunId::new();
        let mut scheduled = Vec::with_capacity(units.len());
        for (unit, bytes) in units.iter().zip(rendered) {
            let input_location = join_location(&config.input_prefix, &format!("{run_id}/{:04}.jsonl", unit.index));
            self.shared.blobs.write(&input_location, bytes).await?;
            scheduled.push(ScheduledUnit {
                job_name: format!("{run_id}-{:04}", unit.index),
                unit: UnitRef {
                    index: unit.index,
                    start: unit.start,
                    len: unit.len(),
                    input_location,
                    output_prefix: join_location(&config.output_prefix, &format!("{run_id}/{:04}/", unit.index)),
                },
            });
        }

        let now = Utc::now();
        self.shared
            .inventory
            .put_run(RunRecord {
                run_id,
                source: request.source.clone(),
                model_id: request.model_id.clone(),
                template_id: request.template_id.clone(),
                bounds: request.bounds,
                ceiling: request.ceiling,
                unit_count: units.len(),
                created_at: now,
                updated_at: now,
                terminal: false,
                joined_location: None,
            })
            .await?;

        info!(
            run_id = %run_id,
            model = %request.model_id,
            records = total,
            generated_ids = assigned,
            units = units.len(),
            ceiling = request.ceiling,
            "run started"
        );

        let units = Arc::new(units);
        let shared = self.shared.clone();
        let task_units = units.clone();
        let handle = tokio::spawn(async move {
            shared
                .execute(request, run_id, scheduled, task_units, formatter)
                .await
        });

        self.runs.lock().await.insert(
            run_id,
            RunContext {
                units,
                state: RunState::Running(handle),
            },
        );
        Ok(run_id)
    }

    /// Current per-status job counts of a run.
    pub async fn status(&self, run_id: RunId) -> Result<RunStatus> {
        let run = self.shared.inventory.get_run(&run_id).await?;
        let jobs = self.shared.inventory.list_by_run(&run_id).await?;
        Ok(RunStatus::new(&run, &jobs))
    }

    /// Wait for a run to finish and return its report.
    pub async fn wait(&self, run_id: RunId) -> Result<RunReport> {
        let handle = {
            let mut runs = self.runs.lock().await;
            match runs.get_mut(&run_id) {
                Some(ctx) => match std::mem::replace(&mut ctx.state, RunState::Awaited) {
                    RunState::Running(handle) => Some(handle),
                    RunState::Finished(report) => {
                        let cloned = report.as_ref().clone();
                        ctx.state = RunState::Finished(report);
                        return Ok(cloned);
                    }
                    RunState::Awaited => None,
                },
                None => None,
            }
        };

        let Some(handle) = handle else {
            return self.report_from_inventory(run_id).await;
        };

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(OrchestratorError::RunAborted(run_id, e.to_string())),
        };

        let mut runs = self.runs.lock().await;
        if let Some(ctx) = runs.get_mut(&run_id) {
            ctx.state = match &result {
                Ok(report) => RunState::Finished(Box::new(report.clone())),
                Err(_) => RunState::Awaited,
            };
        }
        result
    }

    /// Start a run and wait for its report.
    pub async fn run_to_completion(&self, request: RunRequest) -> Result<RunReport> {
        let run_id = self.start_run(request).await?;
        self.wait(run_id).await
    }

    /// Resubmit the records of a finished run's failed and timed-out units as
    /// a new run with the same model, template, bounds and ceiling.
    ///
    /// Units this coordinator split but never submitted, because the run
    /// stopped early, are resubmitted too.
    ///
    /// # Returns
    ///
    /// The new run's id, or `None` when there is nothing to retry.
    pub async fn retry_failed(&self, run_id: RunId) -> Result<Option<RunId>> {
        let run = self.shared.inventory.get_run(&run_id).await?;
        if !run.terminal {
            return Err(OrchestratorError::RunInProgress(run_id));
        }

        let jobs = self.shared.inventory.list_by_run(&run_id).await?;
        let retry: Vec<&JobRecord> = jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Failed | JobStatus::TimedOut))
            .collect();
        let cached = self.cached_units(run_id).await;

        let records = match &cached {
            Some(units) => units
                .iter()
                .filter(|unit| {
                    jobs.iter()
                        .find(|j| j.unit.index == unit.index)
                        .is_none_or(|j| matches!(j.status, JobStatus::Failed | JobStatus::TimedOut))
                })
                .flat_map(|unit| unit.records.iter().cloned())
                .collect(),
            None => self.source_records(&run, &retry).await?,
        };
        if records.is_empty() {
            info!(run_id = %run_id, "nothing to retry");
            return Ok(None);
        }

        let location = join_location(&self.shared.config.input_prefix, &format!("{run_id}/retry.jsonl"));
        self.shared
            .blobs
            .write(&location, encode_json_lines(&records))
            .await?;
        info!(run_id = %run_id, units = retry.len(), records = records.len(), "retrying failed units");

        let mut request = RunRequest::new(
            SourceDescriptor::new(location).with_format(SourceFormat::JsonLines),
            run.model_id.clone(),
            run.bounds,
            run.ceiling,
        );
        request.template_id = run.template_id.clone();
        self.start_run(request).await.map(Some)
    }

    /// Run every stage of `pipeline` in order, each to completion.
    ///
    /// The whole definition is validated first. A stage that reads the
    /// previous output gets that stage's joined records, with its column
    /// mappings applied, as its source.
    pub async fn run_pipeline(&self, pipeline: &PipelineConfig) -> Result<PipelineReport> {
        pipeline.validate(&self.templates, &self.shared.config)?;

        let mut stages: Vec<StageOutcome> = Vec::with_capacity(pipeline.stages.len());
        for stage in &pipeline.stages {
            let source = match (&stage.source, stages.last()) {
                (Some(source), _) => source.clone(),
                (None, Some(previous)) => {
                    self.chain_source(previous.report.run_id, &stage.stage_name, &stage.column_mappings)
                        .await?
                }
                (None, None) => {
                    return Err(PipelineError::Invalid(vec![format!(
                        "stage '{}': no input",
                        stage.stage_name
                    )])
                    .into());
                }
            };

            info!(
                pipeline = %pipeline.pipeline_name,
                stage = %stage.stage_name,
                model = %stage.model_id,
                source = %source.location,
                "starting stage"
            );
            let mut request = RunRequest::new(source, stage.model_id.clone(), stage.bounds, stage.ceiling);
            request.template_id = stage.template_id.clone();
            let report = self.run_to_completion(request).await?;
            stages.push(StageOutcome {
                stage_name: stage.stage_name.clone(),
                report,
            });
        }

        info!(pipeline = %pipeline.pipeline_name, stages = stages.len(), "pipeline finished");
        Ok(PipelineReport {
            pipeline_name: pipeline.pipeline_name.clone(),
            stages,
        })
    }

    /// Turn the joined output of a finished run into the source of a next
    /// stage, renaming fields through `mapping`.
    ///
    /// # Returns
    ///
    /// A JSON Lines source at
    /// `{input_prefix}/{previous}_to_{stage_name}/transformed.jsonl`.
    pub async fn chain_source(
        &self,
        previous: RunId,
        stage_name: &str,
        mapping: &ColumnMapping,
    ) -> Result<SourceDescriptor> {
        let run = self.shared.inventory.get_run(&previous).await?;
        if !run.terminal {
            return Err(OrchestratorError::RunInProgress(previous));
        }
        let joined = run
            .joined_location
            .ok_or_else(|| PipelineError::MissingPreviousOutput {
                stage: stage_name.to_string(),
                run_id: previous,
            })?;

        let mut records = SourceDescriptor::new(joined)
            .with_format(SourceFormat::JsonLines)
            .load(self.shared.blobs.as_ref())
            .await?;
        for record in records.iter_mut() {
            mapping.apply(record);
        }

        let location = join_location(
            &self.shared.config.input_prefix,
            &format!("{previous}_to_{stage_name}/transformed.jsonl"),
        );
        self.shared
            .blobs
            .write(&location, encode_json_lines(&records))
            .await?;
        debug!(run_id = %previous, stage = stage_name, records = records.len(), location = %location, "chained joined output");
        Ok(SourceDescriptor::new(location).with_format(SourceFormat::JsonLines))
    }

    async fn cached_units(&self, run_id: RunId) -> Option<Arc<Vec<BatchUnit>>> {
        self.runs.lock().await.get(&run_id).map(|ctx| ctx.units.clone())
    }

    /// Cut the ranges of `jobs` out of the run's source, for runs this
    /// coordinator did not start.
    async fn source_records(&self, run: &RunRecord, jobs: &[&JobRecord]) -> Result<Vec<Record>> {
        let source = run.source.load(self.shared.blobs.as_ref()).await?;
        let mut records = vec![];
        for job in jobs {
            let range = job.unit.start..job.unit.start + job.unit.len;
            let slice = source.get(range).ok_or_else(|| OrchestratorError::Source {
                location: run.source.location.clone(),
                reason: format!("unit {} lies outside the source", job.unit.index),
            })?;
            records.extend_from_slice(slice);
        }
        Ok(records)
    }

    async fn report_from_inventory(&self, run_id: RunId) -> Result<RunReport> {
        let run = self.shared.inventory.get_run(&run_id).await?;
        if !run.terminal {
            return Err(OrchestratorError::RunInProgress(run_id));
        }
        let jobs = self.shared.inventory.list_by_run(&run_id).await?;
        Ok(RunReport::new(&run, &jobs, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{self, MockBackend, Submission};
    use crate::backend::{BackendStatus, JobNotification, NotificationSender, notification_channel};
    use crate::blob::{MemoryBlobStore, RefusingBlobStore};
    use crate::error::FormatError;
    use crate::inventory::MemoryInventory;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const TEXT_MODEL: &str = "anthropic.claude-3-haiku-20240307-v1:0";
    const EMBED_MODEL: &str = "amazon.titan-embed-text-v2:0";

    struct Harness {
        coordinator: RunCoordinator,
        backend: Arc<MockBackend>,
        /// Everything the coordinator wrote, readable even when the
        /// coordinator's own store refuses writes.
        blobs: Arc<MemoryBlobStore>,
        inventory: Arc<MemoryInventory>,
        submissions: UnboundedReceiver<Submission>,
        events: NotificationSender,
    }

    impl Harness {
        fn new(backend: MockBackend, submissions: UnboundedReceiver<Submission>, config: OrchestratorConfig) -> Self {
            let blobs = Arc::new(MemoryBlobStore::new());
            Self::with_store(backend, submissions, config, blobs.clone(), blobs)
        }

        fn with_store(
            backend: MockBackend,
            submissions: UnboundedReceiver<Submission>,
            config: OrchestratorConfig,
            store: Arc<dyn BlobStore>,
            blobs: Arc<MemoryBlobStore>,
        ) -> Self {
            let backend = Arc::new(backend);
            let inventory = Arc::new(MemoryInventory::new());
            let templates = TemplateRegistry::new()
                .with_template("topic", "Write one line about {topic}")
                .unwrap()
                .with_template("rate", "Rate this joke: {joke}")
                .unwrap();
            let (events, rx) = notification_channel();
            let coordinator = RunCoordinator::new(
                backend.clone(),
                inventory.clone(),
                store,
                templates,
                config,
                rx,
            );
            Self {
                coordinator,
                backend,
                blobs,
                inventory,
                submissions,
                events,
            }
        }

        fn plain() -> Self {
            let (backend, rx) = MockBackend::new();
            Self::new(backend, rx, OrchestratorConfig::default())
        }

        async fn seed(&self, location: &str, records: &[Value]) -> SourceDescriptor {
            let lines: Vec<Record> = records.iter().map(|r| r.as_object().unwrap().clone()).collect();
            self.blobs.write(location, encode_json_lines(&lines)).await.unwrap();
            SourceDescriptor::new(location)
        }

        async fn topics(&self, n: usize) -> SourceDescriptor {
            let records: Vec<Value> = (0..n).map(|i| json!({ "topic": format!("topic {i}"), "n": i })).collect();
            self.seed("source.jsonl", &records).await
        }

        async fn next(&mut self) -> Submission {
            tokio::time::timeout(Duration::from_secs(5), self.submissions.recv())
                .await
                .expect("submission expected")
                .expect("backend alive")
        }

        async fn complete(&self, submission: &Submission) {
            mock::complete(self.blobs.as_ref(), &self.events, submission).await;
        }

        async fn joined(&self, report: &RunReport) -> Vec<Value> {
            let location = report.joined_location.as_deref().unwrap();
            let bytes = self.blobs.read(location).await.unwrap();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn text_request(source: SourceDescriptor, min: usize, max: usize, ceiling: usize) -> RunRequest {
        RunRequest::new(source, TEXT_MODEL, BatchBounds::new(min, max).unwrap(), ceiling).with_template("topic")
    }

    #[tokio::test]
    async fn partial_failure_joins_only_completed_units() {
        let mut h = Harness::plain();
        let source = h.topics(12).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 5, 5)).await.unwrap();

        // every unit fits under the ceiling, so all go out before any finishes
        let subs = [h.next().await, h.next().await, h.next().await];

        h.complete(&subs[0]).await;
        mock::fail(&h.events, &subs[1], "model error");
        h.complete(&subs[2]).await;

        let report = h.coordinator.wait(run_id).await.unwrap();
        let sizes: Vec<usize> = h
            .inventory
            .list_by_run(&run_id)
            .await
            .unwrap()
            .iter()
            .map(|j| j.unit.len)
            .collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert_eq!(report.succeeded.iter().map(|u| u.index).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].failure_reason.as_deref(), Some("model error"));
        assert!(report.timed_out.is_empty());

        let joined = h.joined(&report).await;
        assert_eq!(joined.len(), 7);
        let order: Vec<i64> = joined.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 10, 11]);
        assert_eq!(joined[0]["response"], "echo: Write one line about topic 0");
        assert!(joined[0]["record_id"].is_string());

        let status = h.coordinator.status(run_id).await.unwrap();
        assert!(status.overall_complete);
        assert_eq!(status.counts.completed, 2);
        assert_eq!(status.joined_location, report.joined_location);
    }

    #[tokio::test]
    async fn later_units_wait_for_the_ceiling() {
        let mut h = Harness::plain();
        let source = h.topics(6).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 2, 2)).await.unwrap();

        let first = h.next().await;
        let second = h.next().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.submissions.recv())
                .await
                .is_err()
        );

        let status = h.coordinator.status(run_id).await.unwrap();
        assert_eq!(status.counts.submitted, 2);
        assert_eq!(status.counts.pending, 1);
        assert!(!status.overall_complete);

        h.complete(&first).await;
        let third = h.next().await;
        assert_eq!(third.unit_index(), 2);

        h.complete(&second).await;
        h.complete(&third).await;
        let report = h.coordinator.wait(run_id).await.unwrap();
        assert_eq!(report.counts.completed, 3);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn duplicate_and_out_of_order_notifications_are_harmless() {
        let mut h = Harness::plain();
        let source = h.topics(2).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 2, 1)).await.unwrap();

        let job = h.next().await;
        h.events
            .send(JobNotification::new(job.job_id.clone(), BackendStatus::InProgress))
            .unwrap();
        h.complete(&job).await;
        h.complete(&job).await;
        h.events
            .send(JobNotification::new(job.job_id.clone(), BackendStatus::InProgress))
            .unwrap();
        mock::fail(&h.events, &job, "too late");

        let report = h.coordinator.wait(run_id).await.unwrap();
        assert_eq!(report.counts.completed, 1);
        assert_eq!(report.counts.total(), 1);
        assert_eq!(h.joined(&report).await.len(), 2);
    }

    #[tokio::test]
    async fn configuration_errors_abort_before_submission() {
        let h = Harness::plain();
        let source = h
            .seed("bad.jsonl", &[json!({"topic": "ok"}), json!({"subject": "missing topic"})])
            .await;

        let err = h
            .coordinator
            .start_run(text_request(source.clone(), 1, 10, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Format(FormatError::MissingTemplateField { record_index: 1, .. })
        ));

        let unknown = RunRequest::new(source.clone(), TEXT_MODEL, BatchBounds::new(1, 10).unwrap(), 1)
            .with_template("nope");
        assert!(matches!(
            h.coordinator.start_run(unknown).await,
            Err(OrchestratorError::Format(FormatError::UnknownTemplate(_)))
        ));

        let unsupported = RunRequest::new(source.clone(), "meta.llama3", BatchBounds::new(1, 10).unwrap(), 1);
        assert!(matches!(
            h.coordinator.start_run(unsupported).await,
            Err(OrchestratorError::Format(FormatError::UnsupportedModel(_)))
        ));

        let no_slots = text_request(source, 1, 10, 0);
        assert!(matches!(
            h.coordinator.start_run(no_slots).await,
            Err(OrchestratorError::Config(ConfigError::ZeroCeiling))
        ));

        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.blobs.locations().await, vec!["bad.jsonl".to_string()]);
    }

    #[tokio::test]
    async fn empty_or_missing_sources_are_rejected() {
        let h = Harness::plain();
        let empty = h.seed("empty.jsonl", &[]).await;

        assert!(matches!(
            h.coordinator.start_run(text_request(empty, 1, 10, 1)).await,
            Err(OrchestratorError::Source { .. })
        ));
        assert!(matches!(
            h.coordinator
                .start_run(text_request(SourceDescriptor::new("nowhere.jsonl"), 1, 10, 1))
                .await,
            Err(OrchestratorError::Blob(_))
        ));
    }

    #[tokio::test]
    async fn rejected_submission_is_reported_and_run_continues() {
        let (backend, rx) = MockBackend::new();
        let mut h = Harness::new(backend.reject_unit(0), rx, OrchestratorConfig::default());
        let source = h.topics(4).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 2, 1)).await.unwrap();

        let accepted = h.next().await;
        assert_eq!(accepted.unit_index(), 1);
        h.complete(&accepted).await;

        let report = h.coordinator.wait(run_id).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].job_id.as_str().starts_with("local-"));
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.records_joined, 2);
    }

    #[tokio::test]
    async fn correlation_mismatch_drops_only_that_unit() {
        let mut h = Harness::plain();
        let source = h.topics(4).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 2, 2)).await.unwrap();

        let good = h.next().await;
        let short = h.next().await;
        h.complete(&good).await;
        let one_line = b"{\"modelOutput\":{\"content\":[{\"text\":\"lonely\"}]}}\n".to_vec();
        mock::complete_with(h.blobs.as_ref(), &h.events, &short, one_line).await;

        let report = h.coordinator.wait(run_id).await.unwrap();
        assert_eq!(report.counts.completed, 2);
        assert_eq!(report.join_faults.len(), 1);
        assert_eq!(report.join_faults[0].unit, 1);
        assert!(report.join_faults[0].reason.contains("expected 2 output lines, found 1"));
        assert_eq!(h.joined(&report).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_times_out_units() {
        let (backend, rx) = MockBackend::new();
        let config = OrchestratorConfig::default().with_job_deadline(Duration::from_secs(600));
        let mut h = Harness::new(backend, rx, config);
        let source = h.topics(4).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 2, 2)).await.unwrap();

        let answered = h.next().await;
        let _silent = h.next().await;
        h.complete(&answered).await;

        let report = h.coordinator.wait(run_id).await.unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.timed_out.len(), 1);
        assert_eq!(report.timed_out[0].index, 1);
        assert!(h.coordinator.status(run_id).await.unwrap().overall_complete);
    }

    #[tokio::test]
    async fn retry_resubmits_failed_records_as_a_new_run() {
        let mut h = Harness::plain();
        let source = h.topics(6).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 3, 2)).await.unwrap();

        let ok = h.next().await;
        let bad = h.next().await;
        h.complete(&ok).await;
        mock::fail(&h.events, &bad, "throttled");
        h.coordinator.wait(run_id).await.unwrap();

        let original_ids: Vec<Value> = h
            .blobs
            .read(&bad.request.input_location)
            .await
            .map(|b| {
                String::from_utf8(b)
                    .unwrap()
                    .lines()
                    .map(|l| serde_json::from_str::<Value>(l).unwrap()["recordId"].clone())
                    .collect()
            })
            .unwrap();

        let retry_id = h.coordinator.retry_failed(run_id).await.unwrap().unwrap();
        assert_ne!(retry_id, run_id);

        let again = h.next().await;
        let resent: Vec<Value> = String::from_utf8(h.blobs.read(&again.request.input_location).await.unwrap())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["recordId"].clone())
            .collect();
        assert_eq!(resent, original_ids);

        h.complete(&again).await;
        let report = h.coordinator.wait(retry_id).await.unwrap();
        assert!(report.is_clean());
        let joined = h.joined(&report).await;
        assert_eq!(joined.iter().map(|r| r["n"].as_i64().unwrap()).collect::<Vec<_>>(), vec![3, 4, 5]);

        assert_eq!(h.coordinator.retry_failed(retry_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unwritable_joined_output_still_closes_the_run() {
        let (backend, rx) = MockBackend::new();
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(RefusingBlobStore::new(blobs.clone(), "joined.jsonl"));
        let mut h = Harness::with_store(backend, rx, OrchestratorConfig::default(), store, blobs);
        let source = h.topics(4).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 2, 2)).await.unwrap();

        let ok = h.next().await;
        let bad = h.next().await;
        h.complete(&ok).await;
        mock::fail(&h.events, &bad, "model error");

        let report = h.coordinator.wait(run_id).await.unwrap();
        assert!(report.joined_location.is_none());
        assert_eq!(report.records_joined, 0);
        assert_eq!(report.join_faults.len(), 1);
        assert_eq!(report.join_faults[0].unit, 0);
        assert!(!report.is_clean());

        let run = h.inventory.get_run(&run_id).await.unwrap();
        assert!(run.terminal);
        assert_eq!(h.coordinator.wait(run_id).await.unwrap(), report);
        assert!(h.coordinator.status(run_id).await.unwrap().overall_complete);

        let retry = h.coordinator.retry_failed(run_id).await.unwrap();
        assert!(retry.is_some());
        assert_eq!(h.next().await.unit_index(), 0);
    }

    #[tokio::test]
    async fn unit_cap_limits_the_run() {
        let (backend, rx) = MockBackend::new();
        let mut h = Harness::new(backend, rx, OrchestratorConfig::default().with_max_units(1));
        let source = h.topics(10).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 4, 3)).await.unwrap();

        let only = h.next().await;
        h.complete(&only).await;
        let report = h.coordinator.wait(run_id).await.unwrap();

        assert_eq!(report.counts.total(), 1);
        assert_eq!(h.coordinator.status(run_id).await.unwrap().unit_count, 1);
        assert_eq!(h.backend.calls(), 1);
    }

    #[tokio::test]
    async fn embedding_runs_attach_vectors() {
        let mut h = Harness::plain();
        let source = h
            .seed("docs.jsonl", &[json!({"input_text": "abc"}), json!({"input_text": "hello"})])
            .await;
        let request = RunRequest::new(source, EMBED_MODEL, BatchBounds::new(1, 10).unwrap(), 1);
        let run_id = h.coordinator.start_run(request).await.unwrap();

        let job = h.next().await;
        h.complete(&job).await;
        let report = h.coordinator.wait(run_id).await.unwrap();

        let joined = h.joined(&report).await;
        assert_eq!(joined[0]["embedding"], json!([3.0, 0.5]));
        assert_eq!(joined[1]["embedding"], json!([5.0, 0.5]));
    }

    #[tokio::test]
    async fn waiting_again_returns_the_same_report() {
        let mut h = Harness::plain();
        let source = h.topics(1).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 1, 1)).await.unwrap();
        let job = h.next().await;
        h.complete(&job).await;

        let first = h.coordinator.wait(run_id).await.unwrap();
        let second = h.coordinator.wait(run_id).await.unwrap();
        assert_eq!(first, second);

        assert!(matches!(
            h.coordinator.wait(RunId::new()).await,
            Err(OrchestratorError::Inventory(_))
        ));
    }

    #[tokio::test]
    async fn deterministic_locations_and_job_names() {
        let mut h = Harness::plain();
        let source = h.topics(3).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 2, 2)).await.unwrap();

        let first = h.next().await;
        assert_eq!(first.request.job_name, format!("{run_id}-0000"));
        assert_eq!(first.request.input_location, format!("batch_inputs_json/{run_id}/0000.jsonl"));
        assert_eq!(first.request.output_prefix, format!("batch_outputs_json/{run_id}/0000/"));

        let second = h.next().await;
        h.complete(&first).await;
        h.complete(&second).await;
        let report = h.coordinator.wait(run_id).await.unwrap();
        assert_eq!(
            report.joined_location,
            Some(format!("batch_outputs_joined/{run_id}/joined.jsonl"))
        );
    }

    #[tokio::test]
    async fn pipeline_feeds_joined_output_into_the_next_stage() {
        let mut h = Harness::plain();
        h.blobs
            .write("topics.csv", b"topic\nchickens\nrain\n".to_vec())
            .await
            .unwrap();
        let pipeline = PipelineConfig {
            pipeline_name: "jokes".to_string(),
            stages: vec![
                crate::pipeline::StageConfig {
                    stage_name: "draft".to_string(),
                    model_id: TEXT_MODEL.to_string(),
                    template_id: Some("topic".to_string()),
                    source: Some(SourceDescriptor::new("topics.csv")),
                    use_previous_output: false,
                    column_mappings: ColumnMapping::new(),
                    bounds: BatchBounds::new(1, 10).unwrap(),
                    ceiling: 1,
                },
                crate::pipeline::StageConfig {
                    stage_name: "rate".to_string(),
                    model_id: TEXT_MODEL.to_string(),
                    template_id: Some("rate".to_string()),
                    source: None,
                    use_previous_output: true,
                    column_mappings: ColumnMapping::new().with("joke", "response"),
                    bounds: BatchBounds::new(1, 10).unwrap(),
                    ceiling: 1,
                },
            ],
        };

        let coordinator = &h.coordinator;
        let submissions = &mut h.submissions;
        let (blobs, events) = (h.blobs.clone(), h.events.clone());
        let backend = async move {
            for _ in 0..2 {
                let submission = submissions.recv().await.unwrap();
                mock::complete(blobs.as_ref(), &events, &submission).await;
            }
        };
        let (report, ()) = tokio::join!(coordinator.run_pipeline(&pipeline), backend);
        let report = report.unwrap();

        assert_eq!(report.stages.len(), 2);
        let draft = &report.stages[0].report;
        let rate = &report.stages[1].report;
        assert!(draft.is_clean() && rate.is_clean());
        assert_eq!(report.final_output(), rate.joined_location.as_deref());

        let joined = h.joined(rate).await;
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0]["joke"], "echo: Write one line about chickens");
        assert_eq!(joined[0]["response"], "echo: Rate this joke: echo: Write one line about chickens");
        assert_eq!(joined[1]["topic"], "rain");
    }

    #[tokio::test]
    async fn invalid_pipeline_submits_nothing() {
        let h = Harness::plain();
        let pipeline = PipelineConfig {
            pipeline_name: "broken".to_string(),
            stages: vec![crate::pipeline::StageConfig {
                stage_name: "only".to_string(),
                model_id: TEXT_MODEL.to_string(),
                template_id: Some("rate".to_string()),
                source: None,
                use_previous_output: true,
                column_mappings: ColumnMapping::new(),
                bounds: BatchBounds::new(1, 10).unwrap(),
                ceiling: 1,
            }],
        };

        assert!(matches!(
            h.coordinator.run_pipeline(&pipeline).await,
            Err(OrchestratorError::Pipeline(PipelineError::Invalid(_)))
        ));
        assert_eq!(h.backend.calls(), 0);
    }

    #[tokio::test]
    async fn chaining_a_run_without_joined_output_fails() {
        let mut h = Harness::plain();
        let source = h.topics(1).await;
        let run_id = h.coordinator.start_run(text_request(source, 1, 1, 1)).await.unwrap();
        let job = h.next().await;
        mock::fail(&h.events, &job, "boom");
        h.coordinator.wait(run_id).await.unwrap();

        let err = h
            .coordinator
            .chain_source(run_id, "next", &ColumnMapping::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Pipeline(PipelineError::MissingPreviousOutput { .. })
        ));
    }

    #[cfg(all(feature = "journal", feature = "local-blob"))]
    #[tokio::test]
    async fn runs_against_disk_backed_collaborators() {
        use crate::blob::LocalBlobStore;
        use crate::inventory::JournalInventory;

        let dir = tempfile::TempDir::new().unwrap();
        let journal = dir.path().join("inventory.jsonl");
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("blobs")));
        let inventory = Arc::new(JournalInventory::open(&journal).await.unwrap());
        let (backend, mut submissions) = MockBackend::new();
        let (events, rx) = notification_channel();
        let templates = TemplateRegistry::new().with_template("topic", "About {topic}").unwrap();
        let coordinator = RunCoordinator::new(
            Arc::new(backend),
            inventory,
            blobs.clone(),
            templates,
            OrchestratorConfig::default(),
            rx,
        );

        blobs
            .write("in.json", br#"[{"topic":"a"},{"topic":"b"}]"#.to_vec())
            .await
            .unwrap();
        let request = RunRequest::new(SourceDescriptor::new("in.json"), TEXT_MODEL, BatchBounds::new(1, 1).unwrap(), 2)
            .with_template("topic");
        let run_id = coordinator.start_run(request).await.unwrap();

        for _ in 0..2 {
            let submission = submissions.recv().await.unwrap();
            mock::complete(blobs.as_ref(), &events, &submission).await;
        }
        let report = coordinator.wait(run_id).await.unwrap();
        assert_eq!(report.records_joined, 2);

        let reopened = JournalInventory::open(&journal).await.unwrap();
        let run = reopened.get_run(&run_id).await.unwrap();
        assert!(run.terminal);
        assert_eq!(run.joined_location, report.joined_location);
        assert_eq!(reopened.count_non_terminal(&run_id).await.unwrap(), 0);
    }
}
