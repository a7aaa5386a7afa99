//! Progress reporting, cooperative cancellation and job history
//!
//! A [`Job`] is the observable handed to long-running work: the work declares how many
//! steps it has, advances as it goes, and polls the job's cancellation token between
//! steps. Reporting is delegated to a [`ProgressReporter`] so different frontends can
//! render progress their own way.

use chrono::{DateTime, Utc};
use instant::Instant;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of a job's progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Job identifier
    pub job_id: u64,
    /// Human-readable job label
    pub label: String,
    /// Steps completed so far
    pub completed: usize,
    /// Total steps announced by the work
    pub total: usize,
    /// Elapsed time since the job was created (milliseconds)
    pub elapsed_ms: u64,
}

impl ProgressUpdate {
    /// Progress percentage (0-100)
    #[must_use]
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed.min(self.total) * 100) / self.total) as u8
    }
}

/// Trait for reporting progress of enhancement jobs
pub trait ProgressReporter: Send + Sync {
    /// Report a progress update
    ///
    /// Called synchronously from the worker thread after every step.
    fn report_progress(&self, update: &ProgressUpdate);

    /// Report a finished job, whatever its outcome
    fn report_completion(&self, record: &JobRecord) {
        let _ = record;
    }

    /// Report an error during processing
    fn report_error(&self, label: &str, error: &str);
}

/// No-op progress reporter that discards all progress updates
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: &ProgressUpdate) {}

    fn report_error(&self, _label: &str, _error: &str) {}
}

/// Console progress reporter that logs progress through the `log` facade
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: &ProgressUpdate) {
        if self.verbose {
            log::info!(
                "[{}%] {} {}/{} ({}ms elapsed)",
                update.percentage(),
                update.label,
                update.completed,
                update.total,
                update.elapsed_ms
            );
        } else {
            log::debug!("[{}%] {}", update.percentage(), update.label);
        }
    }

    fn report_completion(&self, record: &JobRecord) {
        match &record.outcome {
            JobOutcome::Completed => {
                log::info!("✅ {} completed in {}ms", record.label, record.duration_ms);
            },
            JobOutcome::Cancelled => {
                log::info!(
                    "⏹️ {} cancelled after {}/{} steps",
                    record.label,
                    record.completed,
                    record.total
                );
            },
            JobOutcome::Failed(message) => {
                log::error!("❌ {} failed: {}", record.label, message);
            },
        }
    }

    fn report_error(&self, label: &str, error: &str) {
        log::error!("❌ Error during {}: {}", label, error);
    }
}

/// Observable state of one long-running operation
///
/// All counters are atomics so the job can be shared between the worker and the caller.
pub struct Job {
    id: u64,
    label: String,
    total: AtomicUsize,
    completed: AtomicUsize,
    done: AtomicBool,
    started: Instant,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    reporter: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("total", &self.total())
            .field("completed", &self.completed())
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Job {
    /// Create a job with a fresh cancellation token and no reporting
    #[must_use]
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self::with_reporter(label, Arc::new(NoOpProgressReporter))
    }

    /// Create a job reporting to the given reporter
    #[must_use]
    pub fn with_reporter<S: Into<String>>(label: S, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            started: Instant::now(),
            started_at: Utc::now(),
            token: CancellationToken::new(),
            reporter,
        }
    }

    /// Use an externally owned cancellation token
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Announce the number of steps and reset the completed count
    pub fn start(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.done.store(false, Ordering::SeqCst);
        self.reporter.report_progress(&self.snapshot());
    }

    /// Record completed steps and notify the reporter
    pub fn advance(&self, steps: usize) {
        self.completed.fetch_add(steps, Ordering::SeqCst);
        self.reporter.report_progress(&self.snapshot());
    }

    /// Mark the job finished
    pub fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Request cooperative cancellation; observed at the next step boundary
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Clone of the token, settable from any thread
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressUpdate {
        ProgressUpdate {
            job_id: self.id,
            label: self.label.clone(),
            completed: self.completed(),
            total: self.total(),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    /// Close the job and produce its history record
    pub fn conclude(&self, outcome: JobOutcome) -> JobRecord {
        self.finish();
        if let JobOutcome::Failed(message) = &outcome {
            self.reporter.report_error(&self.label, message);
        }
        let record = JobRecord {
            id: self.id,
            label: self.label.clone(),
            outcome,
            started_at: self.started_at,
            duration_ms: self.elapsed_ms(),
            completed: self.completed(),
            total: self.total(),
        };
        self.reporter.report_completion(&record);
        record
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Finished job entry kept in [`JobHistory`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub label: String,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub completed: usize,
    pub total: usize,
}

/// Bounded ring buffer of finished jobs, oldest evicted first
#[derive(Debug, Clone)]
pub struct JobHistory {
    capacity: usize,
    records: VecDeque<JobRecord>,
}

impl JobHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: JobRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    #[must_use]
    pub fn latest(&self) -> Option<&JobRecord> {
        self.records.back()
    }

    /// Records from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReporter {
        updates: Mutex<Vec<ProgressUpdate>>,
        errors: Mutex<Vec<String>>,
    }

    impl ProgressReporter for RecordingReporter {
        fn report_progress(&self, update: &ProgressUpdate) {
            self.updates.lock().unwrap().push(update.clone());
        }

        fn report_error(&self, _label: &str, error: &str) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    #[test]
    fn test_job_reports_each_step() {
        let reporter = Arc::new(RecordingReporter::default());
        let job = Job::with_reporter("tiles", reporter.clone());
        job.start(4);
        job.advance(1);
        job.advance(1);

        let updates = reporter.updates.lock().unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[2].completed, 2);
        assert_eq!(updates[2].total, 4);
        assert_eq!(updates[2].percentage(), 50);
    }

    #[test]
    fn test_cancellation_visible_through_token_clone() {
        let job = Job::new("cancel me");
        let token = job.cancellation_token();
        assert!(!job.is_cancelled());
        std::thread::spawn(move || token.cancel()).join().unwrap();
        assert!(job.is_cancelled());
    }

    #[test]
    fn test_conclude_marks_done_and_reports_failure() {
        let reporter = Arc::new(RecordingReporter::default());
        let job = Job::with_reporter("broken", reporter.clone());
        let record = job.conclude(JobOutcome::Failed("model crashed".into()));
        assert!(job.is_done());
        assert_eq!(record.outcome, JobOutcome::Failed("model crashed".into()));
        assert_eq!(reporter.errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = JobHistory::new(2);
        for label in ["a", "b", "c"] {
            history.push(Job::new(label).conclude(JobOutcome::Completed));
        }
        assert_eq!(history.len(), 2);
        let labels: Vec<&str> = history.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["b", "c"]);
        assert_eq!(history.latest().map(|r| r.label.as_str()), Some("c"));
    }

    #[test]
    fn test_zero_total_percentage() {
        let update = Job::new("empty").snapshot();
        assert_eq!(update.percentage(), 0);
    }
}
