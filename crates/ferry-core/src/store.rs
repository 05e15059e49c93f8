//! Status store seam - the external system of record for job status

use crate::engine::Throttle;
use ferry_types::{DownloadJob, JobId, StatusUpdate};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Receives every meaningful state or byte change of a job
pub trait StatusStore: Send + Sync {
    fn publish(&self, update: StatusUpdate);

    /// Called when a job leaves the registry
    fn remove(&self, _job_id: JobId) {}
}

/// Keeps every update in memory, in publication order
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().clone()
    }

    pub fn updates_for(&self, job_id: JobId) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .iter()
            .filter(|u| u.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, job_id: JobId) -> Option<StatusUpdate> {
        self.updates
            .lock()
            .iter()
            .rev()
            .find(|u| u.job_id == job_id)
            .cloned()
    }
}

impl StatusStore for MemoryStatusStore {
    fn publish(&self, update: StatusUpdate) {
        self.updates.lock().push(update);
    }
}

/// Fans updates out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastStatusStore {
    tx: broadcast::Sender<StatusUpdate>,
}

impl BroadcastStatusStore {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }
}

impl StatusStore for BroadcastStatusStore {
    fn publish(&self, update: StatusUpdate) {
        // No subscribers is fine
        let _ = self.tx.send(update);
    }
}

/// Publishes to several stores in turn
#[derive(Default)]
pub struct FanoutStatusStore {
    stores: Vec<Arc<dyn StatusStore>>,
}

impl FanoutStatusStore {
    pub fn new(stores: Vec<Arc<dyn StatusStore>>) -> Self {
        Self { stores }
    }

    pub fn with(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.stores.push(store);
        self
    }
}

impl StatusStore for FanoutStatusStore {
    fn publish(&self, update: StatusUpdate) {
        for store in &self.stores {
            store.publish(update.clone());
        }
    }

    fn remove(&self, job_id: JobId) {
        for store in &self.stores {
            store.remove(job_id);
        }
    }
}

/// Front of a [`StatusStore`] used by the engine and registry.
///
/// Progress goes through a per-job throttle; state changes go out
/// immediately and replace any progress still waiting for its window.
#[derive(Clone)]
pub struct StatusPublisher {
    store: Arc<dyn StatusStore>,
    throttle: Throttle<JobId, StatusUpdate>,
}

impl StatusPublisher {
    pub fn new(store: Arc<dyn StatusStore>, interval: Duration) -> Self {
        let target = Arc::clone(&store);
        let throttle = Throttle::new(interval, move |_id: &JobId, update: StatusUpdate| {
            target.publish(update);
        });
        Self { store, throttle }
    }

    /// Byte progress, rate limited per job
    pub fn progress(&self, job: &DownloadJob) {
        trace!("Progress for {}: {} bytes", job.id, job.bytes_copied);
        self.throttle.emit(job.id, StatusUpdate::from(job));
    }

    pub fn state_changed(&self, job: &DownloadJob) {
        self.throttle.emit_now(job.id, StatusUpdate::from(job));
    }

    pub fn removed(&self, job_id: JobId) {
        self.throttle.forget(&job_id);
        self.store.remove(job_id);
    }
}
