//! Progress bars driven by job notifications

use crate::output::{format_bytes, format_eta, format_speed};
use console::style;
use ferry_core::{NotificationPort, NotifyError};
use ferry_types::{DownloadJob, JobId, JobNotification, NotificationStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Shows a progress bar for each watched job; notifications for other jobs
/// are ignored
pub struct ProgressNotifier {
    multi: MultiProgress,
    bars: Mutex<HashMap<JobId, ProgressBar>>,
    hidden: bool,
}

impl ProgressNotifier {
    pub fn new(hidden: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            hidden,
        }
    }

    /// Create a progress bar for a job
    pub fn watch(&self, job: &DownloadJob) -> ProgressBar {
        let pb = if self.hidden {
            ProgressBar::hidden()
        } else {
            self.multi.add(ProgressBar::new(job.content_length.unwrap_or(0)))
        };

        let bar_style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .map(|s| s.progress_chars("█▓▒░  "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(bar_style);
        pb.set_position(job.bytes_copied);
        pb.set_message(job.file_name());

        self.bars.lock().insert(job.id, pb.clone());
        pb
    }
}

impl NotificationPort for ProgressNotifier {
    fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        let bars = self.bars.lock();
        let Some(pb) = bars.get(&notification.job_id) else {
            return Ok(());
        };

        match &notification.status {
            NotificationStatus::Progress {
                bytes_copied,
                content_length,
                speed,
                eta,
            } => {
                if let Some(total) = content_length {
                    pb.set_length(*total);
                }
                pb.set_position(*bytes_copied);
                pb.set_message(format!(
                    "{} ({}, {})",
                    notification.file_name,
                    format_speed(*speed),
                    format_eta(eta.unwrap_or(0))
                ));
            }
            NotificationStatus::Paused { bytes_copied } => {
                pb.abandon_with_message(format!(
                    "{} Paused at {}",
                    style("⏸").yellow(),
                    format_bytes(*bytes_copied)
                ));
            }
            NotificationStatus::Failed { error } => {
                pb.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    error.as_deref().unwrap_or("Unknown error")
                ));
            }
            NotificationStatus::Cancelled => {
                pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
            }
            NotificationStatus::Completed { size } => {
                pb.set_length(*size);
                pb.set_position(*size);
                pb.finish_with_message(format!(
                    "{} {} complete",
                    style("✓").green().bold(),
                    notification.file_name
                ));
            }
        }
        Ok(())
    }
}
