//! CLI command implementations

use crate::output::{print_done, print_job, print_jobs};
use crate::progress::ProgressNotifier;
use crate::OutputFormat;
use anyhow::{anyhow, bail, Context, Result};
use ferry_core::{JobRegistry, SqliteStatusStore, StatusReporter};
use ferry_types::{DownloadJob, DownloadRequest, EngineConfig, JobId, JobState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DB_FILE: &str = "ferry.db";

/// Registry backed by the on-disk job database, with every stored job
/// restored into it
struct Session {
    store: SqliteStatusStore,
    registry: Arc<JobRegistry>,
    config: EngineConfig,
}

impl Session {
    async fn open(data_dir: &Path, config: EngineConfig) -> Result<Self> {
        let store = open_store(data_dir).await?;
        let registry = Arc::new(JobRegistry::with_defaults(&config, Arc::new(store.clone()))?);
        registry.restore(store.load_jobs().await?);
        Ok(Self { store, registry, config })
    }

    fn resolve(&self, id: &str) -> Result<JobId> {
        resolve_id(&self.registry.list(), id)
    }

    async fn close(self) {
        self.store.flush().await;
    }
}

async fn open_store(data_dir: &Path) -> Result<SqliteStatusStore> {
    let path = data_dir.join(DB_FILE);
    SqliteStatusStore::open(&path)
        .await
        .with_context(|| format!("cannot open job database {}", path.display()))
}

/// Accept a full job id or an unambiguous prefix of one
fn resolve_id(jobs: &[DownloadJob], id: &str) -> Result<JobId> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let prefix = id.to_lowercase();
    let mut matches = jobs.iter().filter(|job| job.id.to_string().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(job), None) => Ok(job.id),
        (Some(_), Some(_)) => bail!("Job id '{}' is ambiguous", id),
        (None, _) => Err(anyhow!("No job matches '{}'", id)),
    }
}

/// Show progress until the job stops. Ctrl-C pauses it so it can be resumed
/// by a later run.
async fn follow(session: &Session, id: JobId, format: OutputFormat) -> Result<DownloadJob> {
    let notifier = Arc::new(ProgressNotifier::new(format == OutputFormat::Json));
    notifier.watch(&session.registry.get(id)?);

    let shutdown = CancellationToken::new();
    let reporter = StatusReporter::new(Arc::clone(&session.registry), notifier, &session.config).spawn(shutdown.clone());

    let job = tokio::select! {
        job = session.registry.wait_idle(id) => job?,
        _ = tokio::signal::ctrl_c() => {
            tracing::debug!("Interrupted, pausing downloads");
            session.registry.pause_all().await;
            session.registry.wait_idle(id).await?
        }
    };

    shutdown.cancel();
    if let Err(e) = reporter.await {
        tracing::warn!("Status reporter ended abnormally: {}", e);
    }
    Ok(job)
}

fn finish(job: DownloadJob, format: OutputFormat) -> Result<()> {
    match job.state {
        JobState::Completed => print_done("Downloaded", &job, format),
        JobState::Paused => print_done("Paused", &job, format),
        JobState::Failed => {
            if format != OutputFormat::Human {
                print_job(&job, format)?;
            }
            bail!("Download failed: {}", job.error.as_deref().unwrap_or("unknown error"))
        }
        _ => print_job(&job, format),
    }
}

// ============================================================================
// Transfer Commands
// ============================================================================

pub async fn get(
    data_dir: &Path,
    config: EngineConfig,
    url: &str,
    dir: Option<PathBuf>,
    name: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("invalid URL '{}'", url))?;
    let directory = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };

    let mut request = DownloadRequest::new(url, directory);
    if let Some(name) = name {
        request = request.with_file_name(name);
    }

    let session = Session::open(data_dir, config).await?;
    let result = async {
        let id = session.registry.start(request).await?;
        follow(&session, id, format).await
    }
    .await;
    session.close().await;

    finish(result?, format)
}

pub async fn resume(data_dir: &Path, config: EngineConfig, id: &str, format: OutputFormat) -> Result<()> {
    let session = Session::open(data_dir, config).await?;
    let result = async {
        let id = session.resolve(id)?;
        session.registry.resume(id).await?;
        follow(&session, id, format).await
    }
    .await;
    session.close().await;

    finish(result?, format)
}

pub async fn retry(data_dir: &Path, config: EngineConfig, id: &str, format: OutputFormat) -> Result<()> {
    let session = Session::open(data_dir, config).await?;
    let result = async {
        let id = session.resolve(id)?;
        session.registry.retry(id).await?;
        follow(&session, id, format).await
    }
    .await;
    session.close().await;

    finish(result?, format)
}

pub async fn cancel(data_dir: &Path, config: EngineConfig, id: &str, format: OutputFormat) -> Result<()> {
    let session = Session::open(data_dir, config).await?;
    let result = async {
        let id = session.resolve(id)?;
        session.registry.cancel(id).await?;
        // Partial output is deleted once the job goes idle
        Ok::<_, anyhow::Error>(session.registry.wait_idle(id).await?)
    }
    .await;
    session.close().await;

    print_done("Cancelled", &result?, format)
}

pub async fn remove(data_dir: &Path, config: EngineConfig, id: &str, format: OutputFormat) -> Result<()> {
    let session = Session::open(data_dir, config).await?;
    let result = async {
        let id = session.resolve(id)?;
        Ok::<_, anyhow::Error>(session.registry.remove(id).await?)
    }
    .await;
    session.close().await;

    print_done("Removed", &result?.job, format)
}

// ============================================================================
// Query Commands
// ============================================================================

/// Read-only view of the job database; nothing is restored or started
pub async fn list(data_dir: &Path, state: Option<JobState>, format: OutputFormat) -> Result<()> {
    let store = open_store(data_dir).await?;
    let jobs: Vec<DownloadJob> = store
        .load_jobs()
        .await?
        .into_iter()
        .filter(|job| state.map_or(true, |s| job.state == s))
        .collect();

    print_jobs(&jobs, format)
}

pub async fn info(data_dir: &Path, id: &str, format: OutputFormat) -> Result<()> {
    let store = open_store(data_dir).await?;
    let id = resolve_id(&store.load_jobs().await?, id)?;
    let job = store
        .load_job(id)
        .await?
        .ok_or_else(|| anyhow!("Job not found: {}", id))?;

    print_job(&job, format)
}
