#![allow(dead_code)]

use bytes::Bytes;
use ferry_core::{
    DownloadJob, EngineConfig, FerryError, FetchRequest, FetchResponse, FsFileStore, JobId, JobRegistry, JobState,
    MemoryStatusStore, StatusPublisher, TransferEngine, Transport,
};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type Chunk = io::Result<Bytes>;

enum Body {
    Chunks(Vec<Chunk>),
    Channel(mpsc::Receiver<Chunk>),
}

struct Scripted {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: Body,
}

/// Transport that replays scripted responses in order
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, status: u16, headers: &[(&'static str, &str)], chunks: Vec<Chunk>) {
        self.responses.lock().push_back(Scripted {
            status,
            headers: headers.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            body: Body::Chunks(chunks),
        });
    }

    /// Queue a response whose body is fed through the returned sender
    pub fn respond_streaming(&self, status: u16, headers: &[(&'static str, &str)]) -> mpsc::Sender<Chunk> {
        let (tx, rx) = mpsc::channel(16);
        self.responses.lock().push_back(Scripted {
            status,
            headers: headers.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            body: Body::Channel(rx),
        });
        tx
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn range_starts(&self) -> Vec<Option<u64>> {
        self.requests.lock().iter().map(|r| r.range_start).collect()
    }
}

impl Transport for MockTransport {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, Result<FetchResponse, FerryError>> {
        self.requests.lock().push(request);
        let next = self.responses.lock().pop_front();

        Box::pin(async move {
            let scripted = next.ok_or_else(|| FerryError::Unknown("no scripted response".to_string()))?;

            let mut headers = HeaderMap::new();
            for (name, value) in scripted.headers {
                headers.insert(HeaderName::from_static(name), HeaderValue::from_str(&value).unwrap());
            }

            let body = match scripted.body {
                Body::Chunks(chunks) => futures::stream::iter(chunks).boxed(),
                Body::Channel(rx) => ReceiverStream::new(rx).boxed(),
            };

            Ok(FetchResponse {
                status: StatusCode::from_u16(scripted.status).unwrap(),
                headers,
                body,
            })
        })
    }
}

/// Deterministic content: byte `i` of the file is `i % 251`
pub fn pattern(range: std::ops::Range<usize>) -> Bytes {
    Bytes::from(range.map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

pub fn closed() -> Chunk {
    Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))
}

pub struct Fixture {
    pub registry: Arc<JobRegistry>,
    pub primary: Arc<MockTransport>,
    pub fallback: Arc<MockTransport>,
    pub store: Arc<MemoryStatusStore>,
    pub dir: tempfile::TempDir,
}

pub fn config() -> EngineConfig {
    EngineConfig {
        chunk_size: 100,
        ..EngineConfig::default()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(MockTransport::new())
}

pub fn fixture_with(primary: Arc<MockTransport>) -> Fixture {
    let fallback = MockTransport::new();
    let store = Arc::new(MemoryStatusStore::new());
    let config = config();
    let engine = TransferEngine::new(
        &config,
        primary.clone(),
        fallback.clone(),
        Arc::new(FsFileStore::new()),
        StatusPublisher::new(store.clone(), Duration::from_millis(config.progress_interval_ms)),
    );

    Fixture {
        registry: Arc::new(JobRegistry::new(Arc::new(engine))),
        primary,
        fallback,
        store,
        dir: tempfile::tempdir().unwrap(),
    }
}

pub async fn wait_until(
    registry: &JobRegistry,
    id: JobId,
    what: &str,
    done: impl Fn(&DownloadJob) -> bool,
) -> DownloadJob {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = registry.get(id).unwrap();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    match polled {
        Ok(job) => job,
        Err(_) => panic!("timed out waiting for {}: {:?}", what, registry.get(id)),
    }
}

pub async fn wait_for_state(registry: &JobRegistry, id: JobId, state: JobState) -> DownloadJob {
    wait_until(registry, id, state.as_str(), |job| job.state == state).await
}

pub async fn wait_for_bytes(registry: &JobRegistry, id: JobId, bytes: u64) -> DownloadJob {
    wait_until(registry, id, "bytes", |job| job.bytes_copied >= bytes).await
}

pub async fn wait_for_missing(path: &std::path::Path) {
    let gone = tokio::time::timeout(Duration::from_secs(5), async {
        while tokio::fs::try_exists(path).await.unwrap_or(true) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "{:?} was never deleted", path);
}
