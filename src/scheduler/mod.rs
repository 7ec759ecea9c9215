//! Keyed one-shot job scheduler.
//!
//! A thin register over `tokio::time`: jobs are submitted under a string key,
//! fire once at their due time, and can be cancelled or replaced by key.
//! Submitting under an existing key replaces the pending job, which is what
//! gives "at most one verification job per campaign".
//!
//! A semaphore bounds how many job bodies run at once, protecting against
//! fan-out when a recovery sweep re-queues a backlog. Late fires beyond the
//! misfire grace window are logged, never dropped.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

struct JobHandle {
    abort: AbortHandle,
    generation: u64,
}

/// Scheduler for keyed one-shot jobs.
pub struct JobScheduler {
    jobs: DashMap<String, JobHandle>,
    limiter: Arc<Semaphore>,
    misfire_grace: Duration,
    seq: AtomicU64,
}

impl JobScheduler {
    /// Create a scheduler bounding concurrently running job bodies to
    /// `max_concurrent`, logging fires later than `misfire_grace` as misfires.
    pub fn new(max_concurrent: usize, misfire_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            misfire_grace,
            seq: AtomicU64::new(0),
        })
    }

    /// Schedule a job at an absolute time. A time in the past fires
    /// immediately (and is logged when past the grace window).
    pub fn submit_at<F, Fut>(self: &Arc<Self>, key: &str, run_at: chrono::DateTime<chrono::Utc>, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = (run_at - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            let overdue = (chrono::Utc::now() - run_at).to_std().unwrap_or(Duration::ZERO);
            if overdue > self.misfire_grace {
                warn!(key, overdue_secs = overdue.as_secs(), "Job scheduled past due, firing now");
            }
        }
        self.submit_after(key, delay, job);
    }

    /// Schedule a job after a delay, replacing any pending job under the
    /// same key.
    pub fn submit_after<F, Fut>(self: &Arc<Self>, key: &str, delay: Duration, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.seq.fetch_add(1, Ordering::Relaxed);
        let key_owned = key.to_string();
        let sched = Arc::clone(self);

        // The task must not outrun its own registration: it waits for the
        // register insert below before it starts counting down.
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            if registered_rx.await.is_err() {
                return;
            }

            let due = Instant::now() + delay;
            tokio::time::sleep(delay).await;

            let overshoot = due.elapsed();
            if overshoot > sched.misfire_grace {
                warn!(
                    key = %key_owned,
                    late_secs = overshoot.as_secs(),
                    "Job fired past its misfire grace window"
                );
            }

            let Ok(_permit) = sched.limiter.acquire().await else {
                // Scheduler shut down while waiting for a slot.
                return;
            };

            debug!(key = %key_owned, "Running scheduled job");
            job().await;

            // Only remove our own registration; a replacement may have
            // already taken the key.
            sched
                .jobs
                .remove_if(&key_owned, |_, handle| handle.generation == generation);
        });

        if let Some(old) = self.jobs.insert(
            key.to_string(),
            JobHandle {
                abort: handle.abort_handle(),
                generation,
            },
        ) {
            debug!(key, "Replacing pending job");
            old.abort.abort();
        }
        let _ = registered_tx.send(());
    }

    /// Cancel a pending job. Returns false when no job holds the key.
    pub fn cancel(&self, key: &str) -> bool {
        match self.jobs.remove(key) {
            Some((_, handle)) => {
                handle.abort.abort();
                debug!(key, "Cancelled job");
                true
            }
            None => false,
        }
    }

    /// Whether a job is registered under the key.
    pub fn contains(&self, key: &str) -> bool {
        self.jobs.contains_key(key)
    }

    /// Number of registered jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Abort every pending job and refuse new job bodies.
    pub fn shutdown(&self) {
        self.limiter.close();
        for entry in self.jobs.iter() {
            entry.value().abort.abort();
        }
        self.jobs.clear();
    }
}
