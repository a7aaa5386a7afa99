//! Single-slot background worker for model operations
//!
//! Inference is heavy on accelerator memory, so at most one submitted operation runs at
//! a time regardless of how many callers are waiting. Work runs on tokio's blocking pool
//! and every job ends up in a bounded [`JobHistory`].

use crate::{
    config::EnhanceConfig,
    error::{EnhanceError, Result},
    services::progress::{Job, JobHistory, JobOutcome, JobRecord, NoOpProgressReporter, ProgressReporter},
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;

/// Serializing queue for operations that run a model
pub struct OperationQueue {
    permit: Arc<Semaphore>,
    history: Arc<Mutex<JobHistory>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("available", &self.permit.available_permits())
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self::with_reporter(history_capacity, Arc::new(NoOpProgressReporter))
    }

    /// Create a queue whose jobs report to `reporter`
    #[must_use]
    pub fn with_reporter(history_capacity: usize, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            history: Arc::new(Mutex::new(JobHistory::new(history_capacity))),
            reporter,
        }
    }

    #[must_use]
    pub fn from_config(config: &EnhanceConfig) -> Self {
        Self::new(config.history_capacity)
    }

    /// New job wired to this queue's reporter
    ///
    /// Keep a clone of the returned handle to observe progress or cancel.
    #[must_use]
    pub fn job<S: Into<String>>(&self, label: S) -> Arc<Job> {
        Arc::new(Job::with_reporter(label, Arc::clone(&self.reporter)))
    }

    /// Run `work` once no other submitted work is running
    ///
    /// `work` receives the job so it can report progress and poll cancellation. A job
    /// cancelled while waiting in line never starts. The job is concluded and recorded in
    /// the history whatever the outcome.
    ///
    /// # Errors
    /// - Whatever `work` returns
    /// - The worker task panicked or the queue was closed
    pub async fn submit<T, F>(&self, job: Arc<Job>, work: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Job) -> Result<Option<T>> + Send + 'static,
    {
        let waiting = self.permit.available_permits() == 0;
        if waiting {
            log::debug!("Job {} '{}' queued behind running work", job.id(), job.label());
        }
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| EnhanceError::internal("Operation queue closed"))?;

        if job.is_cancelled() {
            log::info!("Job {} '{}' cancelled before it started", job.id(), job.label());
            self.record(job.conclude(JobOutcome::Cancelled));
            return Ok(None);
        }

        let worker_job = Arc::clone(&job);
        let result = match tokio::task::spawn_blocking(move || work(&worker_job)).await {
            Ok(result) => result,
            Err(e) => Err(EnhanceError::internal(format!("Worker task failed: {e}"))),
        };

        let outcome = match &result {
            Ok(Some(_)) => JobOutcome::Completed,
            Ok(None) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e.to_string()),
        };
        self.record(job.conclude(outcome));
        result
    }

    /// Snapshot of finished jobs, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<JobRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn latest(&self) -> Option<JobRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .cloned()
    }

    /// Whether work is currently running
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    fn record(&self, record: JobRecord) {
        log::debug!("Job {} finished: {:?} in {}ms", record.id, record.outcome, record.duration_ms);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
