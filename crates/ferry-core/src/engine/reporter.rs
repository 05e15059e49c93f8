//! Status reporter - periodic poll of the registry that pushes throttled
//! notifications outward
//!
//! Downloading jobs get a progress notification (rate limited per job) with
//! a smoothed speed and ETA. A job that has stopped gets exactly one
//! notification for its stopped state, after which it is marked notified.

use crate::engine::registry::JobRegistry;
use crate::engine::Throttle;
use crate::error::NotifyError;
use crate::notify::NotificationPort;
use chrono::Utc;
use ferry_types::{DownloadJob, EngineConfig, JobId, JobNotification, JobState, NotificationStatus};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Samples kept for the windowed average
const SPEED_WINDOW: usize = 10;
/// Weight of the newest windowed average in the moving average
const SPEED_ALPHA: f64 = 0.15;

/// Smoothed transfer speed of one job
#[derive(Debug)]
struct SpeedMeter {
    samples: VecDeque<f64>,
    last_bytes: u64,
    last_at: Instant,
    smoothed: f64,
}

impl SpeedMeter {
    fn new(bytes: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(SPEED_WINDOW),
            last_bytes: bytes,
            last_at: Instant::now(),
            smoothed: 0.0,
        }
    }

    /// Feed the current byte count, returning bytes per second
    fn sample(&mut self, bytes: u64) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return self.smoothed as u64;
        }

        let instant = bytes.saturating_sub(self.last_bytes) as f64 / elapsed;
        self.samples.push_back(instant);
        if self.samples.len() > SPEED_WINDOW {
            self.samples.pop_front();
        }

        let window = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.smoothed = SPEED_ALPHA * window + (1.0 - SPEED_ALPHA) * self.smoothed;
        self.last_bytes = bytes;
        self.last_at = now;
        self.smoothed as u64
    }
}

#[derive(Default)]
struct Tracking {
    meters: HashMap<JobId, SpeedMeter>,
    seen: HashSet<JobId>,
}

/// Drives outward notifications for every job in a registry
pub struct StatusReporter {
    registry: Arc<JobRegistry>,
    throttle: Throttle<JobId, JobNotification>,
    interval: Duration,
    tracking: Mutex<Tracking>,
}

impl StatusReporter {
    pub fn new(registry: Arc<JobRegistry>, notifier: Arc<dyn NotificationPort>, config: &EngineConfig) -> Self {
        let throttle = Throttle::new(
            Duration::from_millis(config.progress_interval_ms),
            move |id: &JobId, notification: JobNotification| match notifier.notify(&notification) {
                Ok(()) => {}
                Err(NotifyError::Closed) => debug!("Notification target for {} is closed", id),
                Err(e) => warn!("Failed to notify for {}: {}", id, e),
            },
        );

        Self {
            registry,
            throttle,
            interval: Duration::from_millis(config.report_interval_ms.max(1)),
            tracking: Mutex::new(Tracking::default()),
        }
    }

    /// One poll pass over the registry
    pub fn tick(&self) {
        let entries = self.registry.entries();
        let mut tracking = self.tracking.lock();

        let current: HashSet<JobId> = entries.iter().map(|entry| entry.id()).collect();
        for gone in tracking.seen.difference(&current) {
            self.throttle.forget(gone);
        }
        tracking.meters.retain(|id, _| current.contains(id));
        tracking.seen = current;

        for entry in entries {
            let job = entry.snapshot();
            match job.state {
                JobState::Initiated => {}
                JobState::Downloading => {
                    let meter = tracking
                        .meters
                        .entry(job.id)
                        .or_insert_with(|| SpeedMeter::new(job.bytes_copied));
                    let speed = meter.sample(job.bytes_copied);
                    let eta = match job.content_length {
                        Some(len) if speed > 0 => Some(len.saturating_sub(job.bytes_copied) / speed),
                        _ => None,
                    };

                    let status = NotificationStatus::Progress {
                        bytes_copied: job.bytes_copied,
                        content_length: job.content_length,
                        speed,
                        eta,
                    };
                    self.throttle.emit(job.id, notification(&job, status));
                    entry.touch_notification();
                }
                _ if job.notified_stopped => {}
                _ => {
                    tracking.meters.remove(&job.id);
                    if let Some(status) = stopped_status(&job) {
                        self.throttle.emit_now(job.id, notification(&job, status));
                        if entry.mark_notified_if(job.state).is_none() {
                            debug!("Job {} left {} while it was being reported", job.id, job.state);
                        }
                    }
                }
            }
        }
    }

    /// Poll until `shutdown` fires, then make one last pass
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Status reporter running every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(),
            }
        }

        self.tick();
        info!("Status reporter stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

fn stopped_status(job: &DownloadJob) -> Option<NotificationStatus> {
    match job.state {
        JobState::Paused => Some(NotificationStatus::Paused {
            bytes_copied: job.bytes_copied,
        }),
        JobState::Failed => Some(NotificationStatus::Failed {
            error: job.error.clone(),
        }),
        JobState::Cancelled => Some(NotificationStatus::Cancelled),
        JobState::Completed => Some(NotificationStatus::Completed {
            size: job.content_length.unwrap_or(job.bytes_copied),
        }),
        JobState::Initiated | JobState::Downloading => None,
    }
}

fn notification(job: &DownloadJob, status: NotificationStatus) -> JobNotification {
    JobNotification {
        job_id: job.id,
        notification_id: job.notification_id,
        file_name: job.file_name(),
        status,
        elapsed_secs: (Utc::now() - job.created_at).num_seconds().max(0) as u64,
    }
}
