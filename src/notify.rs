//! Progress notifications pushed to the caller while a job runs.
//!
//! The orchestrator calls [`NotificationSink::notify`] on every progress
//! update and terminal transition. Delivery failures are logged and
//! otherwise ignored; they never affect the job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::state_machine::{FinalResult, JobError, JobStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    /// Set when progress crossed 25, 50 or 75, or the status changed.
    pub milestone: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification receiver dropped")]
    Closed,

    #[error("notification failed: {0}")]
    Other(String),
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &JobEvent) -> Result<(), NotifyError>;
}

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { tx }
    }

    /// A sink and the receiver draining it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: &JobEvent) -> Result<(), NotifyError> {
        self.tx.send(event.clone()).map_err(|_| NotifyError::Closed)
    }
}

/// Logs milestone and terminal events; the default sink.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &JobEvent) -> Result<(), NotifyError> {
        if event.milestone || event.is_terminal() {
            info!(
                job_id = %event.job_id,
                status = %event.status,
                progress = event.progress,
                step = %event.current_step,
                "job progress"
            );
        }
        Ok(())
    }
}

/// Milestone thresholds on the 0-100 progress scale.
const MILESTONES: [u8; 3] = [25, 50, 75];

/// True when moving from `before` to `after` crosses a milestone threshold
/// or changes status.
pub(crate) fn is_milestone(
    before: (JobStatus, u8),
    after: (JobStatus, u8),
) -> bool {
    before.0 != after.0
        || MILESTONES
            .iter()
            .any(|&m| before.1 < m && after.1 >= m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: JobStatus, progress: u8) -> JobEvent {
        JobEvent {
            job_id: "job-1".into(),
            status,
            progress,
            current_step: "step".into(),
            milestone: false,
            error: None,
            final_result: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn milestones() {
        use JobStatus::Processing;
        assert!(is_milestone((Processing, 20), (Processing, 25)));
        assert!(is_milestone((Processing, 40), (Processing, 80)));
        assert!(!is_milestone((Processing, 25), (Processing, 40)));
        assert!(is_milestone((JobStatus::Analyzing, 15), (Processing, 15)));
    }

    #[tokio::test]
    async fn channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.notify(&event(JobStatus::Processing, 40)).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.progress, 40);
    }

    #[test]
    fn channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        assert!(matches!(
            sink.notify(&event(JobStatus::Completed, 100)),
            Err(NotifyError::Closed)
        ));
    }

    #[test]
    fn event_omits_empty_result() {
        let json = serde_json::to_value(event(JobStatus::Processing, 40)).unwrap();
        assert_eq!(json["status"], "processing");
        assert!(json.get("final_result").is_none());
    }
}
