//! Shared types for Ferry
//!
//! Plain data structures shared by the engine, the CLI and any status
//! consumer. Nothing in here performs I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Stable identifier of a download job
pub type JobId = Uuid;

// ============================================================================
// Job Types
// ============================================================================

/// State of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Initiated,
    Downloading,
    Paused,
    Failed,
    Cancelled,
    Completed,
}

impl JobState {
    /// No transition is permitted out of a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Completed)
    }

    /// States whose status is reported once and then marked as notified
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            JobState::Paused | JobState::Failed | JobState::Cancelled | JobState::Completed
        )
    }

    /// Whether `self -> next` is a legal state machine edge.
    ///
    /// `Paused -> Failed` is allowed so that a resume which finds its partial
    /// file gone can report the data loss directly.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Initiated, Downloading) => true,
            (Downloading, Paused | Failed | Cancelled | Completed) => true,
            (Paused, Downloading | Cancelled | Failed) => true,
            (Failed, Downloading | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Initiated => "initiated",
            JobState::Downloading => "downloading",
            JobState::Paused => "paused",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initiated" => Ok(JobState::Initiated),
            "downloading" => Ok(JobState::Downloading),
            "paused" => Ok(JobState::Paused),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            "completed" => Ok(JobState::Completed),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Mutable record of a single download attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    /// Grouping identity for outward notifications, kept across restarts
    pub notification_id: u32,
    pub url: String,
    /// Full path of the output file
    pub destination: PathBuf,
    pub state: JobState,
    pub bytes_copied: u64,
    /// Unknown until the first response, may stay unknown for chunked bodies
    pub content_length: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_notification_update: Option<DateTime<Utc>>,
    /// Set once a stopped status has been reported outward
    pub notified_stopped: bool,
    pub error: Option<String>,
    /// Number of transfer runs started for this job
    #[serde(default)]
    pub attempts: u32,
}

impl DownloadJob {
    pub fn new(id: JobId, notification_id: u32, url: String, destination: PathBuf) -> Self {
        Self {
            id,
            notification_id,
            url,
            destination,
            state: JobState::Initiated,
            bytes_copied: 0,
            content_length: None,
            created_at: Utc::now(),
            last_notification_update: None,
            notified_stopped: false,
            error: None,
            attempts: 0,
        }
    }

    /// Percentage in 0..=100, zero while the size is unknown
    pub fn progress(&self) -> f64 {
        match self.content_length {
            Some(len) if len > 0 => (self.bytes_copied as f64 / len as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// File name component of the destination
    pub fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string())
    }
}

/// A request to start (or restart) a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Reuse an existing job's identity instead of allocating a new one
    #[serde(default)]
    pub id: Option<JobId>,
    pub url: String,
    /// Directory the file is written into
    pub directory: PathBuf,
    /// Explicit file name, otherwise derived from the URL
    #[serde(default)]
    pub file_name: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            url: url.into(),
            directory: directory.into(),
            file_name: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// The explicit file name, or the last non-empty path segment of the URL.
    /// Only the final component of an explicit name is used, so the file
    /// always lands directly in `directory`.
    pub fn resolved_file_name(&self) -> String {
        let explicit = self
            .file_name
            .as_deref()
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_string_lossy().to_string());
        if let Some(name) = explicit {
            return name;
        }

        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|segments| segments.last().map(|s| s.to_string()))
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "download".to_string())
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// What a status store receives on every meaningful change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job_id: JobId,
    pub notification_id: u32,
    pub url: String,
    pub destination: PathBuf,
    pub state: JobState,
    pub bytes_copied: u64,
    pub content_length: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
}

impl From<&DownloadJob> for StatusUpdate {
    fn from(job: &DownloadJob) -> Self {
        Self {
            job_id: job.id,
            notification_id: job.notification_id,
            url: job.url.clone(),
            destination: job.destination.clone(),
            state: job.state,
            bytes_copied: job.bytes_copied,
            content_length: job.content_length,
            error: job.error.clone(),
            created_at: job.created_at,
            published_at: Utc::now(),
        }
    }
}

/// Outward notification payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub notification_id: u32,
    pub file_name: String,
    pub status: NotificationStatus,
    /// Seconds since the job was created
    pub elapsed_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotificationStatus {
    Progress {
        bytes_copied: u64,
        content_length: Option<u64>,
        /// Bytes per second
        speed: u64,
        /// Seconds
        eta: Option<u64>,
    },
    Paused {
        bytes_copied: u64,
    },
    Failed {
        error: Option<String>,
    },
    Cancelled,
    Completed {
        size: u64,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Read buffer size used by the copy loop
    pub chunk_size: usize,
    /// Minimum interval between status store updates per job
    pub progress_interval_ms: u64,
    /// How often the reporter polls the registry
    pub report_interval_ms: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Headers added to every transfer request
    pub extra_headers: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            progress_interval_ms: 750,
            report_interval_ms: 1000,
            user_agent: format!("Ferry/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            extra_headers: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        let all = [
            JobState::Initiated,
            JobState::Downloading,
            JobState::Paused,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Completed,
        ];
        for from in [JobState::Cancelled, JobState::Completed] {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn initiated_only_promotes_to_downloading() {
        assert!(JobState::Initiated.can_transition_to(JobState::Downloading));
        assert!(!JobState::Initiated.can_transition_to(JobState::Paused));
        assert!(!JobState::Initiated.can_transition_to(JobState::Completed));
    }

    #[test]
    fn paused_and_failed_can_restart_or_cancel() {
        for from in [JobState::Paused, JobState::Failed] {
            assert!(from.can_transition_to(JobState::Downloading));
            assert!(from.can_transition_to(JobState::Cancelled));
            assert!(!from.can_transition_to(JobState::Completed));
        }
    }

    #[test]
    fn file_name_comes_from_url_when_not_given() {
        let request = DownloadRequest::new("https://example.com/files/archive.tar.gz?x=1", "/tmp");
        assert_eq!(request.resolved_file_name(), "archive.tar.gz");

        let request = DownloadRequest::new("https://example.com/", "/tmp");
        assert_eq!(request.resolved_file_name(), "download");

        let request = DownloadRequest::new("https://example.com/a.bin", "/tmp").with_file_name("b.bin");
        assert_eq!(request.resolved_file_name(), "b.bin");
    }

    #[test]
    fn explicit_names_cannot_leave_the_directory() {
        let request = DownloadRequest::new("https://example.com/a.bin", "/tmp/dl").with_file_name("../x");
        assert_eq!(request.resolved_file_name(), "x");

        let request = DownloadRequest::new("https://example.com/a.bin", "/tmp/dl").with_file_name("/etc/passwd");
        assert_eq!(request.resolved_file_name(), "passwd");

        let request = DownloadRequest::new("https://example.com/a.bin", "/tmp/dl").with_file_name("..");
        assert_eq!(request.resolved_file_name(), "a.bin");
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in [JobState::Paused, JobState::Completed] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(serde_json::to_string(&JobState::Downloading).unwrap(), "\"downloading\"");
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"chunk_size": 1024}"#).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.progress_interval_ms, 750);
    }
}
