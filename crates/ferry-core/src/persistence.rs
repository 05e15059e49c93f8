//! SQLite-backed status store
//!
//! `publish` is called from the transfer path and must not block, so updates
//! are queued to a single writer task that applies them in order.

use crate::error::FerryError;
use crate::store::StatusStore;
use chrono::{DateTime, Utc};
use ferry_types::{DownloadJob, JobId, JobState, StatusUpdate};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

enum Command {
    Upsert(StatusUpdate),
    Delete(JobId),
    Flush(oneshot::Sender<()>),
}

/// Durable record of every job's latest status
#[derive(Clone, Debug)]
pub struct SqliteStatusStore {
    pool: SqlitePool,
    tx: mpsc::UnboundedSender<Command>,
}

impl SqliteStatusStore {
    /// Open (or create) the database and start its writer task
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, FerryError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                notification_id INTEGER NOT NULL,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                state TEXT NOT NULL,
                bytes_copied INTEGER NOT NULL DEFAULT 0,
                content_length INTEGER,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            "#,
        )
        .execute(&pool)
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(pool.clone(), rx));

        Ok(Self { pool, tx })
    }

    /// Wait until every update queued so far has been written
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Every stored job, oldest first
    pub async fn load_jobs(&self) -> Result<Vec<DownloadJob>, FerryError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn load_job(&self, id: JobId) -> Result<Option<DownloadJob>, FerryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_job).transpose()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("Status writer has stopped; update dropped");
        }
    }
}

impl StatusStore for SqliteStatusStore {
    fn publish(&self, update: StatusUpdate) {
        self.send(Command::Upsert(update));
    }

    fn remove(&self, job_id: JobId) {
        self.send(Command::Delete(job_id));
    }
}

async fn write_loop(pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        let result = match command {
            Command::Upsert(update) => upsert(&pool, &update).await,
            Command::Delete(id) => delete(&pool, id).await,
            Command::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Failed to write job status: {}", e);
        }
    }
    debug!("Status writer finished");
}

async fn upsert(pool: &SqlitePool, update: &StatusUpdate) -> Result<(), FerryError> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, notification_id, url, destination, state, bytes_copied,
            content_length, error, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            notification_id = excluded.notification_id,
            url = excluded.url,
            destination = excluded.destination,
            state = excluded.state,
            bytes_copied = excluded.bytes_copied,
            content_length = excluded.content_length,
            error = excluded.error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(update.job_id.to_string())
    .bind(update.notification_id as i64)
    .bind(&update.url)
    .bind(update.destination.to_string_lossy().to_string())
    .bind(update.state.as_str())
    .bind(update.bytes_copied as i64)
    .bind(update.content_length.map(|len| len as i64))
    .bind(update.error.as_ref())
    .bind(update.created_at.to_rfc3339())
    .bind(update.published_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

async fn delete(pool: &SqlitePool, id: JobId) -> Result<(), FerryError> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_job(row: SqliteRow) -> Result<DownloadJob, FerryError> {
    let id: String = row.get("id");
    let id = Uuid::parse_str(&id).map_err(|e| FerryError::Unknown(format!("bad job id {}: {}", id, e)))?;

    let state: String = row.get("state");
    let state: JobState = state.parse().map_err(FerryError::Unknown)?;

    let created_at: String = row.get("created_at");
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| FerryError::Unknown(format!("bad timestamp {}: {}", created_at, e)))?;

    let destination: String = row.get("destination");

    Ok(DownloadJob {
        id,
        notification_id: row.get::<i64, _>("notification_id") as u32,
        url: row.get("url"),
        destination: PathBuf::from(destination),
        state,
        bytes_copied: row.get::<i64, _>("bytes_copied") as u64,
        content_length: row.get::<Option<i64>, _>("content_length").map(|len| len as u64),
        created_at,
        last_notification_update: None,
        notified_stopped: false,
        error: row.get("error"),
        attempts: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: JobId, state: JobState, bytes: u64) -> StatusUpdate {
        let mut job = DownloadJob::new(id, 4, "http://example.com/x.iso".to_string(), PathBuf::from("/tmp/x.iso"));
        job.state = state;
        job.bytes_copied = bytes;
        job.content_length = Some(1000);
        StatusUpdate::from(&job)
    }

    #[tokio::test]
    async fn latest_update_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStatusStore::open(dir.path().join("ferry.db")).await.unwrap();
        let id = Uuid::new_v4();

        store.publish(update(id, JobState::Downloading, 100));
        store.publish(update(id, JobState::Downloading, 400));
        store.publish(update(id, JobState::Paused, 400));
        store.flush().await;

        let job = store.load_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Paused);
        assert_eq!(job.bytes_copied, 400);
        assert_eq!(job.content_length, Some(1000));
        assert_eq!(job.notification_id, 4);
    }

    #[tokio::test]
    async fn removed_jobs_are_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStatusStore::open(dir.path().join("ferry.db")).await.unwrap();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();

        store.publish(update(kept, JobState::Completed, 1000));
        store.publish(update(dropped, JobState::Failed, 0));
        store.remove(dropped);
        store.flush().await;

        let jobs = store.load_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, kept);
    }

    #[tokio::test]
    async fn reopened_store_keeps_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.db");
        let id = Uuid::new_v4();
        {
            let store = SqliteStatusStore::open(&path).await.unwrap();
            store.publish(update(id, JobState::Downloading, 250));
            store.flush().await;
        }

        let store = SqliteStatusStore::open(&path).await.unwrap();
        let job = store.load_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Downloading);
        assert_eq!(job.bytes_copied, 250);
    }
}
