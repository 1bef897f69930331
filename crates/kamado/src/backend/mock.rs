//! Scripted backend for tests.
//!
//! Accepted submissions are pushed onto a channel so a test can decide when
//! and how each job finishes. Output files mimic what a real batch service
//! writes: one line per request, echoing `recordId` and `modelInput`.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{InferenceBackend, JobNotification, NotificationSender, SubmitRequest};
use crate::blob::BlobStore;
use crate::error::SubmissionError;
use crate::ids::JobId;

/// An accepted job, as seen by the test.
#[derive(Clone, Debug)]
pub(crate) struct Submission {
    pub job_id: JobId,
    pub request: SubmitRequest,
}

impl Submission {
    /// Unit index, parsed from the `{run}-{index:04}` job name.
    pub fn unit_index(&self) -> usize {
        unit_index(&self.request.job_name).unwrap_or(usize::MAX)
    }

    /// Where the mock writes this job's output.
    pub fn output_location(&self) -> String {
        let file = self
            .request
            .input_location
            .rsplit('/')
            .next()
            .unwrap_or("input.jsonl");
        format!("{}{file}.out", self.request.output_prefix)
    }
}

fn unit_index(job_name: &str) -> Option<usize> {
    job_name.rsplit('-').next()?.parse().ok()
}

pub(crate) struct MockBackend {
    calls: AtomicUsize,
    rejected: Mutex<HashSet<usize>>,
    submissions: mpsc::UnboundedSender<Submission>,
}

impl MockBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Submission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Self {
            calls: AtomicUsize::new(0),
            rejected: Mutex::new(HashSet::new()),
            submissions: tx,
        };
        (backend, rx)
    }

    /// Refuse the submission of unit `index` synchronously.
    pub fn reject_unit(self, index: usize) -> Self {
        self.rejected.lock().unwrap().insert(index);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmissionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = unit_index(&request.job_name);
        if index.is_some_and(|i| self.rejected.lock().unwrap().contains(&i)) {
            return Err(SubmissionError::Validation(format!(
                "input {} rejected",
                request.input_location
            )));
        }

        let job_id = JobId::new(format!("job-{n}"));
        let _ = self.submissions.send(Submission {
            job_id: job_id.clone(),
            request,
        });
        Ok(job_id)
    }
}

/// Build an output file answering every request line of `input`.
pub(crate) fn echo_output(input: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(input);
    let mut out = String::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let request: Value = serde_json::from_str(line).unwrap();
        let model_input = &request["modelInput"];
        let model_output = if let Some(input_text) = model_input.get("inputText") {
            let len = input_text.as_str().map(str::len).unwrap_or(0);
            json!({ "embedding": [len as f64, 0.5] })
        } else {
            let prompt = model_input
                .pointer("/messages/0/content/0/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            json!({ "content": [ { "type": "text", "text": format!("echo: {prompt}") } ] })
        };
        let answer = json!({
            "recordId": request["recordId"],
            "modelInput": model_input,
            "modelOutput": model_output,
        });
        out.push_str(&answer.to_string());
        out.push('\n');
    }
    out.into_bytes()
}

/// Write an echo output for `submission` and notify completion.
pub(crate) async fn complete(blobs: &dyn BlobStore, events: &NotificationSender, submission: &Submission) {
    let input = blobs.read(&submission.request.input_location).await.unwrap();
    let location = submission.output_location();
    blobs.write(&location, echo_output(&input)).await.unwrap();
    events
        .send(JobNotification::completed(submission.job_id.clone(), location))
        .unwrap();
}

/// Write `output` verbatim for `submission` and notify completion.
pub(crate) async fn complete_with(
    blobs: &dyn BlobStore,
    events: &NotificationSender,
    submission: &Submission,
    output: Vec<u8>,
) {
    let location = submission.output_location();
    blobs.write(&location, output).await.unwrap();
    events
        .send(JobNotification::completed(submission.job_id.clone(), location))
        .unwrap();
}

pub(crate) fn fail(events: &NotificationSender, submission: &Submission, reason: &str) {
    events
        .send(JobNotification::failed(submission.job_id.clone(), reason))
        .unwrap();
}
