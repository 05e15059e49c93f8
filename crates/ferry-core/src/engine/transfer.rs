//! Transfer engine - one download's fetch and copy
//!
//! A run resumes from the job's byte count when it has one, validates that
//! the server honoured the range, streams the body to the output in fixed
//! size chunks and finally checks the size. A body that closes mid-copy is
//! retried once over the fallback transport from wherever it stopped.

use crate::engine::job::JobEntry;
use crate::error::FerryError;
use crate::sink::{FileStore, OutputWriter};
use crate::store::StatusPublisher;
use crate::transport::{FetchRequest, FetchResponse, Transport};
use ferry_types::{EngineConfig, JobState};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which transport a copy attempt went through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Primary,
    Fallback,
}

/// Runs transfers for registered jobs
pub struct TransferEngine {
    primary: Arc<dyn Transport>,
    fallback: Arc<dyn Transport>,
    files: Arc<dyn FileStore>,
    publisher: StatusPublisher,
    chunk_size: usize,
    extra_headers: HashMap<String, String>,
}

impl TransferEngine {
    pub fn new(
        config: &EngineConfig,
        primary: Arc<dyn Transport>,
        fallback: Arc<dyn Transport>,
        files: Arc<dyn FileStore>,
        publisher: StatusPublisher,
    ) -> Self {
        Self {
            primary,
            fallback,
            files,
            publisher,
            chunk_size: config.chunk_size.max(1),
            extra_headers: config.extra_headers.clone(),
        }
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub fn publisher(&self) -> &StatusPublisher {
        &self.publisher
    }

    /// Run one transfer to its end. Never returns an error: failures land in
    /// the job's state and are published.
    pub async fn run(&self, job: &JobEntry, cancel: &CancellationToken) {
        let id = job.id();
        match self.transfer(job, cancel).await {
            Ok(()) => {}
            Err(e) if e.is_stop() => {
                info!("Transfer for {} stopped at {} bytes ({})", id, job.bytes_copied(), job.state());
            }
            Err(e) => {
                let reset = matches!(e, FerryError::ResumeRejected(_));
                error!("Transfer for {} failed: {}", id, e);
                self.fail(job, e.to_string(), reset);
            }
        }
    }

    /// Mark a downloading job failed; a job stopped in the meantime keeps its state
    pub fn fail(&self, job: &JobEntry, reason: String, reset_bytes: bool) {
        if job.fail(reason, reset_bytes).is_none() {
            debug!("Job {} left downloading before its failure was recorded", job.id());
        }
    }

    async fn transfer(&self, job: &JobEntry, cancel: &CancellationToken) -> Result<(), FerryError> {
        let id = job.id();
        let copied = job.bytes_copied();
        let resuming = copied > 0;

        if resuming && job.content_length() == Some(copied) {
            info!("Job {} already has all {} bytes, verifying", id, copied);
        } else {
            match self.copy(job, cancel, Route::Primary).await {
                Ok(()) => {}
                Err(e) if e.is_stream_closure() => {
                    warn!(
                        "Stream for {} closed at {} bytes ({}), retrying once over fallback transport",
                        id,
                        job.bytes_copied(),
                        e
                    );
                    self.copy(job, cancel, Route::Fallback).await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.verify(job)
    }

    /// One request plus body copy, starting at the job's current byte count
    async fn copy(&self, job: &JobEntry, cancel: &CancellationToken, route: Route) -> Result<(), FerryError> {
        let id = job.id();
        let offset = job.bytes_copied();
        let resuming = offset > 0;

        let mut request = FetchRequest::new(job.url()).with_extra_headers(&self.extra_headers);
        if resuming {
            request = request.with_range_start(offset);
        }

        let transport = match route {
            Route::Primary => &self.primary,
            Route::Fallback => &self.fallback,
        };

        info!("Job {}: fetching {} from byte {} ({:?})", id, request.url, offset, route);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(stop_reason(job)),
            response = transport.fetch(request) => response?,
        };

        self.accept(job, &response, offset)?;

        let destination = job.destination();
        let mut writer = self.files.open_for_append(&destination, offset).await?;
        let result = self.copy_body(job, cancel, response, &mut writer, route).await;
        let closed = writer.shutdown().await;

        result?;
        closed?;
        Ok(())
    }

    /// Validate the response head and record the announced size
    fn accept(&self, job: &JobEntry, response: &FetchResponse, offset: u64) -> Result<(), FerryError> {
        let status = response.status;
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            if offset > 0 {
                return Err(FerryError::ResumeRejected(format!("unexpected status {}", status.as_u16())));
            }
            return Err(FerryError::ServerError { status: status.as_u16() });
        }

        if offset == 0 {
            let length = match response.content_range() {
                Some(range) if status == StatusCode::PARTIAL_CONTENT => range.total,
                _ => response.content_length(),
            };
            job.set_content_length(length);
            return Ok(());
        }

        if !response.has_content_range() {
            return Err(FerryError::ResumeRejected("response carried no Content-Range".to_string()));
        }

        match response.content_range() {
            Some(range) if range.start != offset => Err(FerryError::ResumeRejected(format!(
                "asked for byte {}, server started at {}",
                offset, range.start
            ))),
            Some(range) => {
                let length = range
                    .total
                    .or_else(|| response.content_length().map(|len| offset + len));
                job.set_content_length(length);
                Ok(())
            }
            // Unparseable but present; trust the existing size
            None => Ok(()),
        }
    }

    async fn copy_body(
        &self,
        job: &JobEntry,
        cancel: &CancellationToken,
        response: FetchResponse,
        writer: &mut OutputWriter,
        route: Route,
    ) -> Result<(), FerryError> {
        let mut reader = StreamReader::new(response.body);
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            if !job.is_downloading() {
                return Err(stop_reason(job));
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(stop_reason(job)),
                read = reader.read(&mut buffer) => read,
            };

            let n = match read {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => {
                    return Err(match route {
                        Route::Primary => FerryError::from_read(e),
                        Route::Fallback => FerryError::Io(e),
                    })
                }
            };

            let copied = job.bytes_copied();
            if let Some(expected) = job.content_length().filter(|len| *len > 0) {
                if copied + n as u64 > expected {
                    return Err(FerryError::SizeMismatch {
                        expected,
                        actual: copied + n as u64,
                    });
                }
            }

            writer.write_all(&buffer[..n]).await?;

            if job.add_bytes(n as u64).is_none() {
                return Err(stop_reason(job));
            }
        }
    }

    fn verify(&self, job: &JobEntry) -> Result<(), FerryError> {
        match job.verify() {
            None => Err(stop_reason(job)),
            Some(Ok(snapshot)) => {
                info!(
                    "Job {} completed: {} bytes to {:?}",
                    snapshot.id, snapshot.bytes_copied, snapshot.destination
                );
                Ok(())
            }
            Some(Err((expected, actual))) => {
                warn!("Job {} ended short: expected {} bytes, got {}", job.id(), expected, actual);
                Ok(())
            }
        }
    }
}

fn stop_reason(job: &JobEntry) -> FerryError {
    match job.state() {
        JobState::Cancelled => FerryError::Cancelled,
        _ => FerryError::Paused,
    }
}
