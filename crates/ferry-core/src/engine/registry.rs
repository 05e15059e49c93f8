//! Job registry - owns every active job and arbitrates control calls
//!
//! Membership lives in one `parking_lot::RwLock` map that is only ever held
//! for a lookup or an insert. Each job serializes its own control calls on
//! its running-task slot, so a slow pause or cancel on one job never blocks
//! another.

use crate::engine::job::{JobEntry, RunningTask};
use crate::engine::transfer::TransferEngine;
use crate::error::FerryError;
use crate::sink::{self, FsFileStore};
use crate::store::{StatusPublisher, StatusStore};
use crate::transport::ReqwestTransport;
use ferry_types::{DownloadJob, DownloadRequest, EngineConfig, JobId, JobState};
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of [`JobRegistry::remove`]
#[derive(Debug, Clone)]
pub struct Removal {
    pub job: DownloadJob,
    /// Nothing is left to report on; background polling can stop
    pub registry_empty: bool,
}

/// Concurrent map of jobs plus the engine that runs them
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    engine: Arc<TransferEngine>,
    next_notification_id: AtomicU32,
}

impl JobRegistry {
    pub fn new(engine: Arc<TransferEngine>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            engine,
            next_notification_id: AtomicU32::new(1),
        }
    }

    /// Registry over reqwest transports and the local filesystem
    pub fn with_defaults(config: &EngineConfig, store: Arc<dyn StatusStore>) -> Result<Self, FerryError> {
        let publisher = StatusPublisher::new(store, Duration::from_millis(config.progress_interval_ms));
        let engine = TransferEngine::new(
            config,
            Arc::new(ReqwestTransport::new(config)?),
            Arc::new(ReqwestTransport::fresh_connections(config)?),
            Arc::new(FsFileStore::new()),
            publisher,
        );
        Ok(Self::new(Arc::new(engine)))
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    /// Register and start a download.
    ///
    /// A request carrying the id of a known job restarts that job from byte
    /// zero, keeping its notification id and destination. A restart is a new
    /// attempt rather than a state transition: the record goes back to
    /// `Initiated` (published as such) before it starts downloading, which is
    /// how a completed or cancelled job is tried again. Restarting a job that
    /// is already downloading does nothing.
    pub async fn start(&self, request: DownloadRequest) -> Result<JobId, FerryError> {
        if let Some(existing) = request.id.and_then(|id| self.entry(id).ok()) {
            return self.restart(existing, request.url).await;
        }

        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let wanted = request.directory.join(request.resolved_file_name());
        let notification_id = self.next_notification_id.fetch_add(1, Ordering::Relaxed);

        // The destination is only claimed once it is re-checked under the
        // write lock; losing that race means picking another candidate.
        let entry = loop {
            let destination = sink::unique_path(&wanted, |candidate| self.destination_taken(candidate)).await;
            let job = DownloadJob::new(id, notification_id, request.url.clone(), destination.clone());
            let entry = Arc::new(JobEntry::new(job, self.engine.publisher().clone()));

            let raced = {
                let mut jobs = self.jobs.write();
                if let Some(existing) = jobs.get(&id) {
                    Some(Arc::clone(existing))
                } else if jobs.values().any(|other| other.destination() == destination) {
                    debug!("Destination {:?} was claimed concurrently, choosing again", destination);
                    continue;
                } else {
                    jobs.insert(id, Arc::clone(&entry));
                    None
                }
            };
            if let Some(existing) = raced {
                return self.restart(existing, request.url).await;
            }
            break entry;
        };

        info!("Starting job {}: {} -> {:?}", id, entry.url(), entry.destination());
        entry.publish();

        let mut running = entry.running.lock().await;
        entry.transition(JobState::Downloading)?;
        *running = Some(self.spawn_run(&entry));
        Ok(id)
    }

    async fn restart(&self, entry: Arc<JobEntry>, url: String) -> Result<JobId, FerryError> {
        let id = entry.id();
        let mut running = entry.running.lock().await;
        if entry.is_downloading() {
            debug!("Job {} is already downloading, ignoring restart", id);
            return Ok(id);
        }

        if let Some(previous) = running.take() {
            previous.finish().await;
        }

        info!("Restarting job {} from scratch", id);
        entry.reset_for_restart(url);
        entry.publish();
        entry.transition(JobState::Downloading)?;
        *running = Some(self.spawn_run(&entry));
        Ok(id)
    }

    /// Stop a downloading job, keeping its partial output
    pub async fn pause(&self, id: JobId) -> Result<DownloadJob, FerryError> {
        let entry = self.entry(id)?;
        let job = entry.transition(JobState::Paused)?;

        if let Some(task) = entry.running.lock().await.as_ref() {
            task.stop();
        }
        info!("Paused job {} at {} bytes", id, job.bytes_copied);
        Ok(job)
    }

    /// Continue a paused or failed job from its byte count. If the partial
    /// output has vanished the job fails instead and nothing is started.
    pub async fn resume(&self, id: JobId) -> Result<DownloadJob, FerryError> {
        let entry = self.entry(id)?;
        let mut running = entry.running.lock().await;

        let from = entry.state();
        if !matches!(from, JobState::Paused | JobState::Failed) {
            return Err(FerryError::InvalidTransition {
                id,
                from,
                to: JobState::Downloading,
            });
        }

        if let Some(previous) = running.take() {
            previous.finish().await;
        }

        let destination = entry.destination();
        if entry.bytes_copied() > 0 && !self.engine.files().exists(&destination).await? {
            warn!("Partial output for job {} is gone: {:?}", id, destination);
            return entry.fail_stopped("partial download missing".to_string());
        }

        let job = entry.transition(JobState::Downloading)?;
        *running = Some(self.spawn_run(&entry));
        info!("Resumed job {} from byte {}", id, job.bytes_copied);
        Ok(job)
    }

    /// Stop a job for good and delete its partial output once the transfer
    /// has let go of it
    pub async fn cancel(&self, id: JobId) -> Result<DownloadJob, FerryError> {
        let entry = self.entry(id)?;
        let job = entry.transition(JobState::Cancelled)?;
        info!("Cancelled job {}", id);
        self.schedule_cleanup(&entry).await;
        Ok(job)
    }

    /// Start a failed or paused job over from byte zero
    pub async fn retry(&self, id: JobId) -> Result<DownloadJob, FerryError> {
        let entry = self.entry(id)?;
        let mut running = entry.running.lock().await;

        let from = entry.state();
        if !matches!(from, JobState::Failed | JobState::Paused) {
            return Err(FerryError::InvalidTransition {
                id,
                from,
                to: JobState::Downloading,
            });
        }

        if let Some(previous) = running.take() {
            previous.finish().await;
        }

        entry.reset_progress();
        let job = entry.transition(JobState::Downloading)?;
        *running = Some(self.spawn_run(&entry));
        info!("Retrying job {} (attempt {})", id, job.attempts);
        Ok(job)
    }

    /// Drop a job from the registry. A job that has not finished is
    /// cancelled first, so its partial output is deleted.
    pub async fn remove(&self, id: JobId) -> Result<Removal, FerryError> {
        let entry = self.entry(id)?;

        if !entry.state().is_terminal() {
            match entry.transition(JobState::Cancelled) {
                Ok(_) => self.schedule_cleanup(&entry).await,
                Err(_) if entry.state().is_terminal() => {}
                Err(e) => return Err(e),
            }
        }

        // Waits out any cleanup still holding the slot
        if let Some(task) = entry.running.lock().await.take() {
            task.finish().await;
        }

        let registry_empty = {
            let mut jobs = self.jobs.write();
            jobs.remove(&id);
            jobs.is_empty()
        };
        self.engine.publisher().removed(id);
        info!("Removed job {}", id);

        Ok(Removal {
            job: entry.snapshot(),
            registry_empty,
        })
    }

    /// Wait until the job has no transfer or cleanup in flight
    pub async fn wait_idle(&self, id: JobId) -> Result<DownloadJob, FerryError> {
        let entry = self.entry(id)?;
        let finished = entry.running.lock().await.as_ref().map(|task| task.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
        Ok(entry.snapshot())
    }

    pub fn get(&self, id: JobId) -> Result<DownloadJob, FerryError> {
        Ok(self.entry(id)?.snapshot())
    }

    /// All jobs, oldest first
    pub fn list(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self.jobs.read().values().map(|entry| entry.snapshot()).collect();
        jobs.sort_by_key(|job| (job.created_at, job.notification_id));
        jobs
    }

    /// Record that a stopped status has been sent outward
    pub fn mark_notified(&self, id: JobId) -> Result<DownloadJob, FerryError> {
        Ok(self.entry(id)?.mark_notified())
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// Pause every downloading job, returning the ids that were paused
    pub async fn pause_all(&self) -> Vec<JobId> {
        let mut paused = Vec::new();
        for entry in self.entries() {
            if !entry.is_downloading() {
                continue;
            }
            let id = entry.id();
            match self.pause(id).await {
                Ok(_) => paused.push(id),
                Err(e) => debug!("Job {} not paused: {}", id, e),
            }
        }
        paused
    }

    /// Re-register persisted jobs. Jobs that were mid-transfer come back
    /// paused so they can be resumed from their byte count. Ids already
    /// present are left alone. Returns how many jobs were added.
    pub fn restore(&self, jobs: impl IntoIterator<Item = DownloadJob>) -> usize {
        let mut added = Vec::new();
        {
            let mut map = self.jobs.write();
            for mut job in jobs {
                self.next_notification_id
                    .fetch_max(job.notification_id.saturating_add(1), Ordering::Relaxed);

                if matches!(job.state, JobState::Initiated | JobState::Downloading) {
                    job.state = JobState::Paused;
                    job.notified_stopped = false;
                }

                if let Entry::Vacant(slot) = map.entry(job.id) {
                    let entry = Arc::new(JobEntry::new(job, self.engine.publisher().clone()));
                    slot.insert(Arc::clone(&entry));
                    added.push(entry);
                }
            }
        }

        for entry in &added {
            entry.publish();
        }
        info!("Restored {} jobs", added.len());
        added.len()
    }

    pub(crate) fn entries(&self) -> Vec<Arc<JobEntry>> {
        self.jobs.read().values().cloned().collect()
    }

    fn destination_taken(&self, path: &Path) -> bool {
        self.jobs.read().values().any(|entry| entry.destination() == path)
    }

    fn entry(&self, id: JobId) -> Result<Arc<JobEntry>, FerryError> {
        self.jobs.read().get(&id).cloned().ok_or(FerryError::NotFound(id))
    }

    /// Hand the slot to a task that waits for the transfer to stop, then
    /// deletes the output. Anyone needing the slot afterwards waits for it.
    async fn schedule_cleanup(&self, entry: &JobEntry) {
        let mut running = Arc::clone(&entry.running).lock_owned().await;
        let files = Arc::clone(self.engine.files());
        let destination = entry.destination();
        let id = entry.id();

        tokio::spawn(async move {
            if let Some(task) = running.take() {
                task.finish().await;
            }
            match files.delete(&destination).await {
                Ok(()) => debug!("Deleted output of job {}: {:?}", id, destination),
                Err(e) => warn!("Failed to delete output of job {}: {}", id, e),
            }
            drop(running);
        });
    }

    fn spawn_run(&self, entry: &Arc<JobEntry>) -> RunningTask {
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let token = cancel.clone();
        let done = finished.clone().drop_guard();
        let engine = Arc::clone(&self.engine);
        let job = Arc::clone(entry);

        let handle = tokio::spawn(async move {
            let _done = done;
            let run = AssertUnwindSafe(engine.run(&job, &token)).catch_unwind().await;
            if let Err(panic) = run {
                let reason = panic_message(panic.as_ref());
                error!("Transfer for {} panicked: {}", job.id(), reason);
                engine.fail(&job, format!("transfer panicked: {}", reason), false);
            }
        });

        RunningTask {
            handle,
            cancel,
            finished,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
