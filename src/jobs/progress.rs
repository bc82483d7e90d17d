//! Rate-limited progress reporting.
//!
//! Every tick publishes an event so live consumers stay snappy; the job
//! row in the database is only flushed on the first and last tick or when
//! enough time has passed, keeping write volume bounded.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::jobs::{JobStatus, JobStore};
use crate::events::{AppEvent, EventBus};

const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

struct FlushState {
    last_flush: Option<Instant>,
    last_flushed_value: Option<u32>,
    current: u32,
}

/// Progress sink for one job run.
pub struct ProgressTracker {
    job: Option<(JobStore, String)>,
    job_type: String,
    events: EventBus,
    total: u32,
    state: Mutex<FlushState>,
}

impl ProgressTracker {
    pub fn new(
        job: Option<(JobStore, String)>,
        job_type: &str,
        events: EventBus,
        total: u32,
    ) -> Self {
        Self {
            job,
            job_type: job_type.to_string(),
            events,
            total,
            state: Mutex::new(FlushState {
                last_flush: None,
                last_flushed_value: None,
                current: 0,
            }),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Record progress. Publishes an event unconditionally and flushes the
    /// job row at bounded frequency.
    pub fn tick(&self, current: u32) {
        let job_id = self
            .job
            .as_ref()
            .map(|(_, id)| id.clone())
            .unwrap_or_default();
        self.events
            .publish(AppEvent::progress(&job_id, &self.job_type, current, self.total));

        let Some((jobs, job_id)) = &self.job else {
            return;
        };
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.current = current;

        let due = current == 0
            || current == self.total
            || state
                .last_flush
                .map_or(true, |at| at.elapsed() >= PROGRESS_FLUSH_INTERVAL);
        if due {
            let _ = jobs.update_progress(job_id, current, self.total);
            state.last_flush = Some(Instant::now());
            state.last_flushed_value = Some(current);
        }
    }

    /// Flush any progress the rate limiter was still holding back.
    pub fn finish(&self) {
        let Some((jobs, job_id)) = &self.job else {
            return;
        };
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.last_flushed_value != Some(state.current) {
            let _ = jobs.update_progress(job_id, state.current, self.total);
        }
    }
}

/// Cooperative cancellation: a job flipped to `failed` by an external
/// actor stops the bulk loop between games.
#[derive(Clone)]
pub struct CancelCheck {
    jobs: Option<(JobStore, String)>,
}

impl CancelCheck {
    pub fn new(jobs: Option<(JobStore, String)>) -> Self {
        Self { jobs }
    }

    pub fn never() -> Self {
        Self { jobs: None }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.jobs {
            Some((jobs, job_id)) => matches!(
                jobs.get_job(job_id),
                Ok(Some(job)) if job.status == JobStatus::Failed
            ),
            None => false,
        }
    }
}
