//! # Kamado
//!
//! Asynchronous orchestration of large batch inference jobs.
//!
//! ## Overview
//!
//! A *Run* takes a dataset of JSON records, splits it into size-bounded
//! *Batch Units*, renders each unit into the request file a batch inference
//! backend expects, and submits one job per unit while keeping at most
//! `ceiling` jobs in flight. Completion is event driven: the backend reports
//! status changes on a channel, and a listener applies them to the inventory.
//! Once every job has settled, completed outputs are joined back to their
//! input records into a single consolidated file.
//!
//! ```text
//! source -> partition -> format -> schedule (<= ceiling live jobs)
//!                                     |            ^
//!                                  backend ---- notifications -> listener
//!                                     |
//!                          all terminal -> join -> report
//! ```
//!
//! ## Architecture
//!
//! ### Inventory
//!
//! The [`Inventory`](inventory::Inventory) holds one record per job and one
//! per run. It is the only shared mutable state, and every status change is a
//! compare-and-set, so duplicate or reordered notifications are harmless. The
//! number of free concurrency slots is derived from it rather than counted.
//!
//! ### Resumption
//!
//! The scheduler never polls. Each submitted job owns a
//! [`ResumptionHandle`](resume::ResumptionHandle) that the listener resolves
//! when the job turns terminal. A handle that outlives the job deadline marks
//! the job `TIMED_OUT`.
//!
//! ### Collaborators
//!
//! Backends, blob storage and the inventory are `async` traits, so a run can be
//! driven entirely in memory for tests or against real services.
//!
//! ### Pipelines
//!
//! A [`PipelineConfig`](pipeline::PipelineConfig) chains runs: each stage can
//! read the joined output of the stage before it, with fields renamed through
//! a [`ColumnMapping`](pipeline::ColumnMapping).
//!
//! ## Features
//!
//! - **journal** - Enables [`JournalInventory`](inventory::JournalInventory), a
//!   file-backed inventory
//! - **local-blob** - Enables [`LocalBlobStore`](blob::LocalBlobStore), rooted at
//!   a directory
//!
//! ## Example
//!
//! ```ignore
//! let (events_tx, events_rx) = notification_channel();
//! let coordinator = RunCoordinator::new(backend, inventory, blobs, templates, config, events_rx);
//!
//! let request = RunRequest::new(
//!     SourceDescriptor::new("datasets/reviews.jsonl"),
//!     "anthropic.claude-3-haiku-20240307-v1:0",
//!     BatchBounds::new(1_000, 50_000)?,
//!     5,
//! )
//! .with_template("summarize");
//!
//! let report = coordinator.run_to_completion(request).await?;
//! println!("{report}");
//! ```

pub mod backend;
pub mod blob;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod ids;
pub mod inventory;
pub mod join;
pub mod listener;
pub mod partition;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod resume;
pub mod scheduler;

pub use backend::{BackendStatus, InferenceBackend, JobNotification, SubmitRequest, notification_channel};
pub use blob::{BlobStore, MemoryBlobStore};
pub use config::OrchestratorConfig;
pub use coordinator::{RunCoordinator, RunRequest};
pub use error::{OrchestratorError, Result};
pub use format::{InputFormatter, PromptTemplate, RequestShape, TemplateRegistry};
pub use ids::{JobId, RunId};
pub use inventory::{Inventory, JobRecord, JobStatus, MemoryInventory, RunRecord};
pub use partition::{BatchBounds, BatchUnit, partition};
pub use pipeline::{ColumnMapping, PipelineConfig, PipelineReport, StageConfig};
pub use record::{Record, SourceDescriptor, SourceFormat};
pub use report::{RunReport, RunStatus, StatusCounts};
