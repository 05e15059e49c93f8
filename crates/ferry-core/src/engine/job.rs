//! Job entry - the live record of one download plus its running task
//!
//! The record sits behind a short-lived `parking_lot` lock so readers never
//! wait on I/O. Every mutation goes through a method here that enforces the
//! state machine and the byte-count invariants, and publishes the result
//! before the lock is released so the store sees changes in the order they
//! were made.

use crate::error::FerryError;
use crate::store::StatusPublisher;
use chrono::Utc;
use ferry_types::{DownloadJob, JobId, JobState};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to the single in-flight transfer of a job
#[derive(Debug)]
pub(crate) struct RunningTask {
    pub(crate) handle: JoinHandle<()>,
    pub(crate) cancel: CancellationToken,
    /// Fires when the task body returns, however it ended
    pub(crate) finished: CancellationToken,
}

impl RunningTask {
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to let go of its output
    pub(crate) async fn finish(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            debug!("Transfer task ended abnormally: {}", e);
        }
    }
}

/// A registered job
pub struct JobEntry {
    record: Mutex<DownloadJob>,
    publisher: StatusPublisher,
    /// Held by whoever is starting, stopping or cleaning up after the transfer
    pub(crate) running: Arc<tokio::sync::Mutex<Option<RunningTask>>>,
}

impl JobEntry {
    pub fn new(job: DownloadJob, publisher: StatusPublisher) -> Self {
        Self {
            record: Mutex::new(job),
            publisher,
            running: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn snapshot(&self) -> DownloadJob {
        self.record.lock().clone()
    }

    pub fn id(&self) -> JobId {
        self.record.lock().id
    }

    pub fn state(&self) -> JobState {
        self.record.lock().state
    }

    pub fn url(&self) -> String {
        self.record.lock().url.clone()
    }

    pub fn destination(&self) -> PathBuf {
        self.record.lock().destination.clone()
    }

    pub fn bytes_copied(&self) -> u64 {
        self.record.lock().bytes_copied
    }

    pub fn content_length(&self) -> Option<u64> {
        self.record.lock().content_length
    }

    pub fn is_downloading(&self) -> bool {
        self.state() == JobState::Downloading
    }

    /// Publish the current record as a state change
    pub fn publish(&self) -> DownloadJob {
        let job = self.record.lock();
        self.publisher.state_changed(&job);
        job.clone()
    }

    /// Move to `to` if the state machine allows it.
    ///
    /// Entering `Downloading` clears `notified_stopped` and any previous error
    /// and counts a new attempt.
    pub fn transition(&self, to: JobState) -> Result<DownloadJob, FerryError> {
        let mut job = self.record.lock();
        if !job.state.can_transition_to(to) {
            return Err(FerryError::InvalidTransition {
                id: job.id,
                from: job.state,
                to,
            });
        }

        debug!("Job {}: {} -> {}", job.id, job.state, to);
        job.state = to;
        if to == JobState::Downloading {
            job.notified_stopped = false;
            job.error = None;
            job.attempts += 1;
        }
        self.publisher.state_changed(&job);
        Ok(job.clone())
    }

    /// Count `n` more bytes. Returns `None` without counting when the job is
    /// no longer downloading, which is the copy loop's cue to stop.
    pub fn add_bytes(&self, n: u64) -> Option<DownloadJob> {
        let mut job = self.record.lock();
        if job.state != JobState::Downloading {
            return None;
        }
        job.bytes_copied += n;
        self.publisher.progress(&job);
        Some(job.clone())
    }

    /// Record the size announced by the server
    pub fn set_content_length(&self, length: Option<u64>) {
        let mut job = self.record.lock();
        if let Some(len) = length {
            job.content_length = Some(len);
        }
    }

    /// Mark a downloading job failed. Returns `None` if the job was already
    /// moved elsewhere (paused or cancelled) in the meantime.
    pub fn fail(&self, reason: String, reset_bytes: bool) -> Option<DownloadJob> {
        let mut job = self.record.lock();
        if job.state != JobState::Downloading {
            return None;
        }
        job.state = JobState::Failed;
        job.error = Some(reason);
        if reset_bytes {
            job.bytes_copied = 0;
        }
        self.publisher.state_changed(&job);
        Some(job.clone())
    }

    /// Record data loss on a paused or failed job: the partial output is gone
    pub fn fail_stopped(&self, reason: String) -> Result<DownloadJob, FerryError> {
        let mut job = self.record.lock();
        match job.state {
            JobState::Paused | JobState::Failed => {
                job.state = JobState::Failed;
                job.error = Some(reason);
                job.bytes_copied = 0;
                job.notified_stopped = false;
                self.publisher.state_changed(&job);
                Ok(job.clone())
            }
            from => Err(FerryError::InvalidTransition {
                id: job.id,
                from,
                to: JobState::Failed,
            }),
        }
    }

    /// Final size check after the body ends
    pub fn verify(&self) -> Option<Result<DownloadJob, (u64, u64)>> {
        let mut job = self.record.lock();
        if job.state != JobState::Downloading {
            return None;
        }

        let outcome = match job.content_length {
            Some(expected) if expected > 0 && job.bytes_copied < expected => {
                let actual = job.bytes_copied;
                job.state = JobState::Failed;
                job.error = Some(format!("expected {} bytes, got {}", expected, actual));
                Err((expected, actual))
            }
            _ => {
                if job.content_length.unwrap_or(0) == 0 {
                    job.content_length = Some(job.bytes_copied);
                }
                job.state = JobState::Completed;
                Ok(job.clone())
            }
        };
        self.publisher.state_changed(&job);
        Some(outcome)
    }

    /// Forget all progress so the next run starts from byte zero
    pub fn reset_progress(&self) {
        let mut job = self.record.lock();
        job.bytes_copied = 0;
        job.content_length = None;
    }

    /// Reuse this entry for a fresh attempt, keeping its identity and path.
    /// The attempt starts over at `Initiated` from any state, terminal ones
    /// included; this is not a state machine edge.
    pub fn reset_for_restart(&self, url: String) {
        let mut job = self.record.lock();
        job.url = url;
        job.state = JobState::Initiated;
        job.bytes_copied = 0;
        job.content_length = None;
        job.error = None;
        job.notified_stopped = false;
    }

    /// Record that the current stopped state has been reported. A job that
    /// is downloading again keeps its flag clear.
    pub fn mark_notified(&self) -> DownloadJob {
        let state = self.state();
        self.mark_notified_if(state).unwrap_or_else(|| self.snapshot())
    }

    /// Set `notified_stopped` only while the job is still in `state`, the
    /// state whose status was sent. Returns `None` if the job has moved on.
    pub fn mark_notified_if(&self, state: JobState) -> Option<DownloadJob> {
        let mut job = self.record.lock();
        if job.state != state || !state.is_stopped() {
            return None;
        }
        job.notified_stopped = true;
        job.last_notification_update = Some(Utc::now());
        Some(job.clone())
    }

    pub(crate) fn touch_notification(&self) {
        self.record.lock().last_notification_update = Some(Utc::now());
    }
}

impl std::fmt::Debug for JobEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEntry").field("record", &*self.record.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStatusStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn entry() -> (JobEntry, Arc<MemoryStatusStore>) {
        let store = Arc::new(MemoryStatusStore::new());
        let publisher = StatusPublisher::new(store.clone(), Duration::from_millis(750));
        let entry = JobEntry::new(
            DownloadJob::new(
                Uuid::new_v4(),
                1,
                "http://example.com/f".to_string(),
                PathBuf::from("/tmp/f"),
            ),
            publisher,
        );
        (entry, store)
    }

    #[test]
    fn downloading_clears_notified_flag() {
        let (entry, _) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.transition(JobState::Paused).unwrap();
        assert!(entry.mark_notified().notified_stopped);

        let job = entry.transition(JobState::Downloading).unwrap();
        assert!(!job.notified_stopped);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let (entry, _) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.transition(JobState::Cancelled).unwrap();

        let err = entry.transition(JobState::Downloading).unwrap_err();
        assert!(matches!(
            err,
            FerryError::InvalidTransition { from: JobState::Cancelled, to: JobState::Downloading, .. }
        ));
    }

    #[test]
    fn transitions_are_published_in_order() {
        let (entry, store) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.transition(JobState::Paused).unwrap();
        entry.transition(JobState::Cancelled).unwrap();

        let states: Vec<JobState> = store.updates().iter().map(|u| u.state).collect();
        assert_eq!(states, vec![JobState::Downloading, JobState::Paused, JobState::Cancelled]);
    }

    #[tokio::test]
    async fn bytes_only_count_while_downloading() {
        let (entry, _) = entry();
        assert!(entry.add_bytes(10).is_none());

        entry.transition(JobState::Downloading).unwrap();
        assert_eq!(entry.add_bytes(10).unwrap().bytes_copied, 10);
        assert_eq!(entry.add_bytes(5).unwrap().bytes_copied, 15);

        entry.transition(JobState::Paused).unwrap();
        assert!(entry.add_bytes(10).is_none());
        assert_eq!(entry.bytes_copied(), 15);
    }

    #[tokio::test]
    async fn verify_fills_unknown_length() {
        let (entry, _) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.add_bytes(537);

        let job = entry.verify().unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.content_length, Some(537));
    }

    #[tokio::test]
    async fn verify_fails_short_transfer() {
        let (entry, store) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.set_content_length(Some(1000));
        entry.add_bytes(400);

        assert_eq!(entry.verify().unwrap().unwrap_err(), (1000, 400));
        assert_eq!(entry.state(), JobState::Failed);
        assert_eq!(store.latest(entry.id()).unwrap().state, JobState::Failed);
    }

    #[test]
    fn verify_skips_stopped_jobs() {
        let (entry, _) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.transition(JobState::Paused).unwrap();
        assert!(entry.verify().is_none());
        assert_eq!(entry.state(), JobState::Paused);
    }

    #[tokio::test]
    async fn fail_resets_bytes_when_asked() {
        let (entry, _) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.add_bytes(400);

        let job = entry.fail("no content-range".into(), true).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.bytes_copied, 0);
        assert!(entry.fail("again".into(), true).is_none());
    }

    #[test]
    fn notified_flag_only_sticks_to_the_reported_state() {
        let (entry, _) = entry();
        entry.transition(JobState::Downloading).unwrap();
        entry.transition(JobState::Paused).unwrap();

        // Resumed after the paused status went out but before it was recorded
        entry.transition(JobState::Downloading).unwrap();
        assert!(entry.mark_notified_if(JobState::Paused).is_none());
        assert!(!entry.mark_notified().notified_stopped);
        assert!(!entry.snapshot().notified_stopped);

        entry.transition(JobState::Paused).unwrap();
        assert!(entry.mark_notified_if(JobState::Paused).unwrap().notified_stopped);
    }

    #[test]
    fn fail_stopped_requires_a_stopped_job() {
        let (entry, _) = entry();
        assert!(entry.fail_stopped("gone".into()).is_err());

        entry.transition(JobState::Downloading).unwrap();
        entry.transition(JobState::Paused).unwrap();
        let job = entry.fail_stopped("partial download missing".into()).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.bytes_copied, 0);
    }
}
