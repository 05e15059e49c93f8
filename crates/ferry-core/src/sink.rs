//! Output storage for transfers

use futures::future::BoxFuture;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWrite};
use tracing::debug;

/// Writable handle returned by [`FileStore::open_for_append`]. Closed on drop.
pub type OutputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where transfers write their bytes
pub trait FileStore: Send + Sync {
    /// Open `path` for appending at `offset`. Anything past `offset` is
    /// discarded, so bytes written but never counted do not survive a resume.
    /// An offset of zero starts the file over.
    fn open_for_append<'a>(&'a self, path: &'a Path, offset: u64) -> BoxFuture<'a, io::Result<OutputWriter>>;

    /// Delete `path`. Missing files are not an error.
    fn delete<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<()>>;

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<bool>>;
}

/// Local filesystem store
#[derive(Debug, Clone, Default)]
pub struct FsFileStore;

impl FsFileStore {
    pub fn new() -> Self {
        Self
    }
}

impl FileStore for FsFileStore {
    fn open_for_append<'a>(&'a self, path: &'a Path, offset: u64) -> BoxFuture<'a, io::Result<OutputWriter>> {
        Box::pin(async move {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)
                .await?;

            let existing = file.metadata().await?.len();
            if existing != offset {
                debug!("Trimming {:?} from {} to {} bytes", path, existing, offset);
                file.set_len(offset).await?;
            }
            file.seek(io::SeekFrom::Start(offset)).await?;

            Ok(Box::new(file) as OutputWriter)
        })
    }

    fn delete<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<bool>> {
        Box::pin(tokio::fs::try_exists(path))
    }
}

/// First of `path`, `stem (1).ext`, `stem (2).ext`, ... that neither exists
/// on disk nor is `reserved`
pub async fn unique_path(path: &Path, reserved: impl Fn(&Path) -> bool) -> PathBuf {
    let mut candidate = path.to_path_buf();
    let mut counter = 1;

    while reserved(&candidate) || tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        let stem = path.file_stem().unwrap_or_default().to_string_lossy();
        let new_name = match path.extension() {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext.to_string_lossy()),
            None => format!("{} ({})", stem, counter),
        };
        candidate = path.with_file_name(new_name);
        counter += 1;

        if counter > 10000 {
            break;
        }
    }

    candidate
}
