//! Schedule providers: turn job specifications into timed poll firings.
//!
//! A job carries a [`PollTask`] value rather than a closure; when it fires the
//! provider hands the task back to the owning service, which turns it into an
//! inbound `IN` message.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use dashmap::DashMap;
use hub_core::{ModuleError, ModuleResult};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::trigger::Trigger;

/// Opaque identifier of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(Uuid);

impl JobHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// What a fired job asks the service to do: poll `sensor_id` with `configuration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTask {
    pub sensor_id: String,
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub trigger: Trigger,
    /// Upper bound, in seconds, of the random delay added to each firing.
    pub jitter_secs: u64,
    pub task: PollTask,
}

/// A job firing delivered to the owning service.
#[derive(Debug, Clone)]
pub struct FiredJob {
    pub handle: JobHandle,
    pub task: PollTask,
}

pub trait ScheduleProvider: Send + Sync {
    fn add(&self, job: JobSpec) -> ModuleResult<JobHandle>;
    fn remove(&self, handle: &JobHandle) -> ModuleResult<()>;
    fn list(&self) -> Vec<JobHandle>;
}

// ─── Tokio Scheduler ────────────────────────────────────────────────────

struct JobEntry {
    kind: &'static str,
    task: tokio::task::JoinHandle<()>,
}

/// Timer-backed provider. Each job is a tokio task; firings are sent on an
/// unbounded channel returned by [`TokioScheduler::new`].
pub struct TokioScheduler {
    jobs: Arc<DashMap<JobHandle, JobEntry>>,
    fired: mpsc::UnboundedSender<FiredJob>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredJob>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        (
            Self {
                jobs: Arc::new(DashMap::new()),
                fired,
            },
            receiver,
        )
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

impl ScheduleProvider for TokioScheduler {
    fn add(&self, job: JobSpec) -> ModuleResult<JobHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ModuleError::Scheduling(format!("no async runtime: {e}")))?;
        job.trigger.validate()?;

        let handle = JobHandle::new();
        let kind = job.trigger.kind();
        let (armed_tx, armed_rx) = oneshot::channel();
        let task = runtime.spawn(run_job(
            handle,
            job,
            armed_rx,
            self.jobs.clone(),
            self.fired.clone(),
        ));
        self.jobs.insert(handle, JobEntry { kind, task });
        // The job only starts its timer once it is visible in the map, so a
        // one-shot that fires immediately still cleans up after itself.
        let _ = armed_tx.send(());

        debug!(job = %handle, kind, "job scheduled");
        Ok(handle)
    }

    fn remove(&self, handle: &JobHandle) -> ModuleResult<()> {
        let (_, entry) = self
            .jobs
            .remove(handle)
            .ok_or_else(|| ModuleError::Scheduling(format!("job {handle} not found")))?;
        entry.task.abort();
        debug!(job = %handle, kind = entry.kind, "job removed");
        Ok(())
    }

    fn list(&self) -> Vec<JobHandle> {
        self.jobs.iter().map(|e| *e.key()).collect()
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for entry in self.jobs.iter() {
            entry.value().task.abort();
        }
    }
}

async fn run_job(
    handle: JobHandle,
    job: JobSpec,
    armed: oneshot::Receiver<()>,
    jobs: Arc<DashMap<JobHandle, JobEntry>>,
    fired: mpsc::UnboundedSender<FiredJob>,
) {
    if armed.await.is_err() {
        return;
    }

    let mut previous = None;
    while let Some(next) = job.trigger.next_fire(previous, Local::now()) {
        let mut wait = (next - Local::now()).to_std().unwrap_or_default();
        if job.jitter_secs > 0 {
            let jitter_ms = rand::thread_rng().gen_range(0..=job.jitter_secs.saturating_mul(1000));
            wait += std::time::Duration::from_millis(jitter_ms);
        }
        tokio::time::sleep(wait).await;

        metrics::counter!("scheduler.jobs_fired").increment(1);
        let firing = FiredJob {
            handle,
            task: job.task.clone(),
        };
        if fired.send(firing).is_err() {
            warn!(job = %handle, "job receiver dropped, stopping job");
            break;
        }
        previous = Some(next);
    }

    jobs.remove(&handle);
    info!(job = %handle, sensor_id = %job.task.sensor_id, "job finished");
}

// ─── Memory Scheduler ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub handle: JobHandle,
    pub spec: JobSpec,
}

/// In-memory provider that never fires on its own. Tests drive it with
/// [`MemoryScheduler::fire`].
#[derive(Default)]
pub struct MemoryScheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    removed: Mutex<Vec<JobHandle>>,
    reject_adds: AtomicBool,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `add` calls fail, simulating a broken provider.
    pub fn reject_adds(&self, reject: bool) {
        self.reject_adds.store(reject, Ordering::Relaxed);
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().clone()
    }

    pub fn removed(&self) -> Vec<JobHandle> {
        self.removed.lock().clone()
    }

    /// Fire a job once. One-shot jobs are dropped after firing.
    pub fn fire(&self, handle: &JobHandle) -> Option<PollTask> {
        let mut jobs = self.jobs.lock();
        let index = jobs.iter().position(|j| j.handle == *handle)?;
        let task = jobs[index].spec.task.clone();
        if !jobs[index].spec.trigger.is_recurring() {
            jobs.remove(index);
        }
        Some(task)
    }
}

impl ScheduleProvider for MemoryScheduler {
    fn add(&self, job: JobSpec) -> ModuleResult<JobHandle> {
        if self.reject_adds.load(Ordering::Relaxed) {
            return Err(ModuleError::Scheduling("provider unavailable".into()));
        }
        job.trigger.validate()?;
        let handle = JobHandle::new();
        self.jobs.lock().push(ScheduledJob { handle, spec: job });
        Ok(handle)
    }

    fn remove(&self, handle: &JobHandle) -> ModuleResult<()> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|j| j.handle != *handle);
        if jobs.len() == before {
            return Err(ModuleError::Scheduling(format!("job {handle} not found")));
        }
        self.removed.lock().push(*handle);
        Ok(())
    }

    fn list(&self) -> Vec<JobHandle> {
        self.jobs.lock().iter().map(|j| j.handle).collect()
    }
}
