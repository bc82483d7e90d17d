//! In-process event bus for job progress and status updates.
//!
//! Built on a broadcast channel: publishing never blocks, and subscribers
//! that fall behind simply miss events. Payloads are serializable so an
//! outer surface (WebSocket, logs) can forward them verbatim.

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events observable by the outside world.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    #[serde(rename = "job.status_changed")]
    JobStatusChanged {
        job_id: String,
        job_type: String,
        status: String,
        error_message: Option<String>,
    },
    #[serde(rename = "job.progress_updated")]
    JobProgressUpdated {
        job_id: String,
        job_type: String,
        current: u32,
        total: u32,
        percent: u32,
    },
    #[serde(rename = "stats.updated")]
    StatsUpdated,
}

impl AppEvent {
    pub fn progress(job_id: &str, job_type: &str, current: u32, total: u32) -> Self {
        let percent = if total > 0 {
            current * 100 / total
        } else {
            0
        };
        AppEvent::JobProgressUpdated {
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            current,
            total,
            percent,
        }
    }

    pub fn status_changed(
        job_id: &str,
        job_type: &str,
        status: &str,
        error_message: Option<String>,
    ) -> Self {
        AppEvent::JobStatusChanged {
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            status: status.to_string(),
            error_message,
        }
    }
}

/// Clonable publish/subscribe handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A send with no subscribers is not an error.
    pub fn publish(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}
