//! Background execution of generation jobs.
//!
//! [`WorkerPool`] runs fire-and-forget triggers with bounded concurrency.
//! [`WorkerCycleRunner`] is the pollable sweep: it returns stale claims to
//! `pending`, then drives a bounded batch of runnable jobs oldest first.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

use gradplan_core::config::WorkerConfig;
use gradplan_core::domain::job::JobId;

use crate::service::{GenerationJobService, RunOutcome, ServiceError};

#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Queues `task` and returns immediately. Failures, panics and a missing
    /// runtime are logged; nothing reaches the caller.
    pub fn spawn<F>(&self, job_id: &JobId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(error) => {
                error!(
                    event_name = "worker.spawn.failed",
                    job_id = %job_id,
                    error = %error,
                    "no async runtime available to run the job"
                );
                return;
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);
        let job_id = job_id.clone();

        handle.spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => {
                    if let Err(join_error) = tokio::spawn(task).await {
                        if join_error.is_panic() {
                            error!(
                                event_name = "worker.task.panicked",
                                job_id = %job_id,
                                "generation driver panicked"
                            );
                        } else {
                            warn!(
                                event_name = "worker.task.aborted",
                                job_id = %job_id,
                                "generation driver was aborted"
                            );
                        }
                    }
                }
                Err(_) => warn!(
                    event_name = "worker.pool.closed",
                    job_id = %job_id,
                    "worker pool closed before the job could start"
                ),
            }

            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Resolves once no spawned task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCycleReport {
    pub processed: u32,
    pub recovered: u32,
}

pub struct WorkerCycleRunner {
    service: Arc<GenerationJobService>,
    config: WorkerConfig,
}

impl WorkerCycleRunner {
    pub fn new(service: Arc<GenerationJobService>, config: WorkerConfig) -> Self {
        Self { service, config }
    }

    pub async fn run_cycle(
        &self,
        requested_limit: Option<u32>,
    ) -> Result<WorkerCycleReport, ServiceError> {
        let limit = self.config.effective_limit(requested_limit);
        let recovered = self.service.recover_stale_claims(limit).await?;

        let mut processed = 0;
        for job in self.service.runnable_jobs(limit).await? {
            match self.service.run_job_to_step_boundary(&job.id).await {
                Ok(RunOutcome::Skipped { .. }) => {}
                Ok(_) => processed += 1,
                Err(error) => error!(
                    event_name = "worker.cycle.job_failed",
                    job_id = %job.id,
                    error = %error,
                    "driver run failed"
                ),
            }
        }

        info!(
            event_name = "worker.cycle.completed",
            limit,
            processed,
            recovered,
            "worker cycle finished"
        );
        Ok(WorkerCycleReport { processed, recovered })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use gradplan_core::domain::job::JobId;

    use super::WorkerPool;

    #[tokio::test]
    async fn pool_bounds_concurrency_and_drains() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for index in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(&JobId(format!("job-{index}")), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle().await;
        assert_eq!(pool.in_flight(), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panicking_task_is_contained() {
        let pool = WorkerPool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));

        pool.spawn(&JobId("job-panic".to_string()), async {
            panic!("driver exploded");
        });
        let after = Arc::clone(&finished);
        pool.spawn(&JobId("job-next".to_string()), async move {
            after.fetch_add(1, Ordering::SeqCst);
        });

        pool.wait_idle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawn_without_runtime_is_logged_not_propagated() {
        let pool = WorkerPool::new(1);
        pool.spawn(&JobId("job-orphan".to_string()), async {});
        assert_eq!(pool.in_flight(), 0);
    }
}
