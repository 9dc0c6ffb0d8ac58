//! Single-flight notification dispatcher with a bounded FIFO backlog.
//!
//! At most one delivery runs per dispatcher. Submissions arriving while a
//! delivery is in flight are queued and drained, oldest first, by whichever
//! caller currently owns the in-flight slot.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hub_core::config::{BackpressurePolicy, NotificationConfig};
use hub_core::{ModuleError, ModuleResult, Severity};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, warn};

/// Delivery capability implemented by concrete notification modules
/// (speaker, chat bot, e-mail gateway, ...).
pub trait Deliverer: Send + Sync {
    fn deliver(&self, severity: Severity, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogEntry {
    pub severity: Severity,
    pub text: String,
}

#[derive(Debug, Default)]
struct DispatcherState {
    busy: bool,
    backlog: VecDeque<BacklogEntry>,
}

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The caller ran the deliveries itself, including `count - 1` drained backlog entries.
    Delivered { count: usize },
    /// Another caller is delivering; the entry sits at position `depth` of the backlog.
    Queued { depth: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub delivered: u64,
    pub failed: u64,
    pub queued: u64,
    pub rejected: u64,
    pub depth: usize,
}

pub struct NotificationDispatcher {
    deliverer: Arc<dyn Deliverer>,
    capacity: usize,
    policy: BackpressurePolicy,
    state: Mutex<DispatcherState>,
    space: Condvar,
    delivered: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
}

impl NotificationDispatcher {
    pub fn new(deliverer: Arc<dyn Deliverer>, config: &NotificationConfig) -> Self {
        Self {
            deliverer,
            capacity: config.backlog_capacity.max(1),
            policy: config.backlog_policy,
            state: Mutex::new(DispatcherState::default()),
            space: Condvar::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Deliver now, or queue behind the in-flight delivery.
    pub fn submit(&self, severity: Severity, text: &str) -> ModuleResult<SubmitOutcome> {
        let entry = BacklogEntry {
            severity,
            text: text.to_string(),
        };

        {
            let mut state = self.state.lock();
            while state.busy {
                if state.backlog.len() < self.capacity {
                    debug!(text, "queueing notification");
                    state.backlog.push_back(entry);
                    self.queued.fetch_add(1, Ordering::Relaxed);
                    return Ok(SubmitOutcome::Queued {
                        depth: state.backlog.len(),
                    });
                }
                match self.policy {
                    BackpressurePolicy::Reject => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("notifications.backlog_full").increment(1);
                        warn!(capacity = self.capacity, text, "notification backlog full");
                        return Err(ModuleError::BacklogFull {
                            capacity: self.capacity,
                        });
                    }
                    BackpressurePolicy::Block => self.space.wait(&mut state),
                }
            }
            state.busy = true;
        }

        let mut next = Some(entry);
        let mut count = 0;
        while let Some(current) = next {
            self.deliver_one(&current);
            count += 1;

            let mut state = self.state.lock();
            next = state.backlog.pop_front();
            if next.is_none() {
                state.busy = false;
                self.space.notify_all();
            } else {
                self.space.notify_one();
            }
        }
        Ok(SubmitOutcome::Delivered { count })
    }

    fn deliver_one(&self, entry: &BacklogEntry) {
        match self.attempt(entry) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("notifications.delivered").increment(1);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("notifications.failed").increment(1);
                error!(error = %e, severity = %entry.severity, "unable to notify");
            }
        }
    }

    fn attempt(&self, entry: &BacklogEntry) -> ModuleResult<()> {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.deliverer.deliver(entry.severity, &entry.text)
        }));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ModuleError::Delivery(format!("{e:#}"))),
            Err(_) => Err(ModuleError::Delivery("deliverer panicked".into())),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn backlog_depth(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            depth: self.backlog_depth(),
        }
    }
}
