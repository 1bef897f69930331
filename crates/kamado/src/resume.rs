//! # Resumption Handles
//!
//! The scheduler suspends on one [`ResumptionHandle`] per submitted job and the
//! completion listener wakes it when the job reaches a terminal state. The
//! handle is a future over a oneshot receiver; nothing polls the inventory.
//!
//! A job id only exists once the backend accepts the submission, so a handle
//! is registered under an anonymous [`ResumptionToken`] first and bound to the
//! job id after its record has been written. Two races are covered here:
//!
//! - a notification for a job whose record is not written yet is parked and
//!   handed back by [`bind`](ResumptionRegistry::bind) for replay
//! - a terminal transition that lands between the record write and the bind is
//!   kept and delivered as soon as the handle is bound
//!
//! Parked notifications for jobs that never get a record, such as jobs of
//! another coordinator sharing the event channel, are evicted once they are
//! older than the park TTL.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::JobNotification;
use crate::ids::JobId;
use crate::inventory::JobRecord;

/// Anonymous key of a handle that is not yet bound to a job id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResumptionToken(u64);

/// Resolves with the job's terminal record.
pub struct ResumptionHandle {
    receiver: oneshot::Receiver<JobRecord>,
}

impl Future for ResumptionHandle {
    type Output = Result<JobRecord, oneshot::error::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver).poll(cx)
    }
}

/// How long a notification for an unrecorded job is kept by default.
pub const DEFAULT_PARK_TTL: Duration = Duration::from_secs(15 * 60);

struct Parked {
    since: Instant,
    notifications: Vec<JobNotification>,
}

#[derive(Default)]
struct Slots {
    waiting: HashMap<ResumptionToken, oneshot::Sender<JobRecord>>,
    bound: HashMap<JobId, oneshot::Sender<JobRecord>>,
    /// Jobs whose record is known to be written.
    known: HashSet<JobId>,
    parked: HashMap<JobId, Parked>,
    settled: HashMap<JobId, JobRecord>,
}

impl Slots {
    fn evict_parked(&mut self, ttl: Duration) -> usize {
        let before = self.parked.len();
        self.parked.retain(|_, parked| parked.since.elapsed() < ttl);
        before - self.parked.len()
    }
}

/// Hands out resumption handles and routes terminal records to them.
pub struct ResumptionRegistry {
    next: AtomicU64,
    slots: Mutex<Slots>,
    park_ttl: Duration,
}

impl Default for ResumptionRegistry {
    fn default() -> Self {
        Self::with_park_ttl(DEFAULT_PARK_TTL)
    }
}

impl ResumptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that drops parked notifications older than `park_ttl`.
    pub fn with_park_ttl(park_ttl: Duration) -> Self {
        Self {
            next: AtomicU64::new(0),
            slots: Mutex::new(Slots::default()),
            park_ttl,
        }
    }

    /// Create a handle ahead of a submission.
    pub async fn register(&self) -> (ResumptionToken, ResumptionHandle) {
        let token = ResumptionToken(self.next.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.slots.lock().await.waiting.insert(token, tx);
        (token, ResumptionHandle { receiver: rx })
    }

    /// Attach `token` to `job_id`. Call only after the job record is written.
    ///
    /// Returns the notifications that arrived before the record existed; the
    /// caller must replay them through the listener.
    pub async fn bind(&self, token: ResumptionToken, job_id: &JobId) -> Vec<JobNotification> {
        let mut slots = self.slots.lock().await;
        slots.known.insert(job_id.clone());
        let parked = slots
            .parked
            .remove(job_id)
            .map(|p| p.notifications)
            .unwrap_or_default();

        let Some(sender) = slots.waiting.remove(&token) else {
            return parked;
        };
        match slots.settled.remove(job_id) {
            Some(record) => {
                debug!(job_id = %job_id, "job settled before bind");
                let _ = sender.send(record);
            }
            None => {
                slots.bound.insert(job_id.clone(), sender);
            }
        }
        parked
    }

    /// Drop a handle whose submission was refused.
    pub async fn cancel(&self, token: ResumptionToken) {
        self.slots.lock().await.waiting.remove(&token);
    }

    /// Wake the handle of `job_id` with its terminal record.
    ///
    /// Returns `false` when no handle was waiting yet; the record is then kept
    /// for a later bind.
    pub async fn resolve(&self, job_id: &JobId, record: JobRecord) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.bound.remove(job_id) {
            Some(sender) => sender.send(record).is_ok(),
            None => {
                slots.settled.insert(job_id.clone(), record);
                false
            }
        }
    }

    /// Hold a notification for a job with no record.
    ///
    /// Returns the notification back when the record has been written in the
    /// meantime, so the caller can retry it.
    pub async fn park(&self, notification: JobNotification) -> Option<JobNotification> {
        let mut slots = self.slots.lock().await;
        if slots.known.contains(&notification.job_id) {
            return Some(notification);
        }
        slots.evict_parked(self.park_ttl);
        slots
            .parked
            .entry(notification.job_id.clone())
            .or_insert_with(|| Parked {
                since: Instant::now(),
                notifications: vec![],
            })
            .notifications
            .push(notification);
        None
    }

    /// Drop parked notifications older than the park TTL.
    ///
    /// Returns how many jobs' notifications were dropped.
    pub async fn evict_parked(&self) -> usize {
        let evicted = self.slots.lock().await.evict_parked(self.park_ttl);
        if evicted > 0 {
            warn!(jobs = evicted, "dropped notifications for jobs that were never recorded");
        }
        evicted
    }

    /// Jobs with parked notifications.
    pub async fn parked(&self) -> usize {
        self.slots.lock().await.parked.len()
    }

    /// Release every trace of `job_id` once its wait is over.
    pub async fn forget(&self, job_id: &JobId) {
        let mut slots = self.slots.lock().await;
        slots.bound.remove(job_id);
        slots.settled.remove(job_id);
        slots.known.remove(job_id);
    }

    /// Handles not yet resolved.
    pub async fn outstanding(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.waiting.len() + slots.bound.len()
    }
}
