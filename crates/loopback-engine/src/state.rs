use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Cancellation flags and job progress shared between a running loop and
/// whoever drives it. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    inner: Arc<RunStateInner>,
}

#[derive(Debug, Default)]
struct RunStateInner {
    interrupted: AtomicBool,
    skipped: AtomicBool,
    job_count: AtomicU64,
    job_no: AtomicU64,
    job: Mutex<String>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the run at the next iteration boundary.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    /// Skips the remainder of the current batch at the next iteration boundary.
    pub fn skip(&self) {
        self.inner.skipped.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    pub fn is_skipped(&self) -> bool {
        self.inner.skipped.load(Ordering::SeqCst)
    }

    pub fn should_stop(&self) -> bool {
        self.is_interrupted() || self.is_skipped()
    }

    pub fn set_job_count(&self, count: u64) {
        self.inner.job_count.store(count, Ordering::SeqCst);
        self.inner.job_no.store(0, Ordering::SeqCst);
    }

    pub fn job_count(&self) -> u64 {
        self.inner.job_count.load(Ordering::SeqCst)
    }

    /// Number of jobs started so far.
    pub fn job_no(&self) -> u64 {
        self.inner.job_no.load(Ordering::SeqCst)
    }

    pub fn begin_job(&self, label: String) {
        self.inner.job_no.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut job) = self.inner.job.lock() {
            *job = label;
        }
    }

    pub fn job(&self) -> String {
        self.inner
            .job
            .lock()
            .map(|job| job.clone())
            .unwrap_or_default()
    }
}
