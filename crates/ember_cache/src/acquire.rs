//! Payload acquisition: resolving a payload's local source and copying it
//! into the working folder, or handing the transfer to the download
//! transport when no local source exists.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::consts::COPY_CHUNK_SIZE;

/// Progress of one payload transfer.
#[derive(Debug, Copy, Clone)]
pub struct CacheProgress<'a> {
    /// The payload being transferred.
    pub payload_id: &'a str,
    /// Bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total bytes expected, zero when unknown.
    pub bytes_total: u64,
}

/// The host application's answer to a progress callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgressResult {
    /// Keep going.
    Continue,
    /// Abort the whole apply.
    Cancel,
    /// Abort the whole apply (legacy alias of cancel).
    Stop,
    /// Keep going but stop reporting progress.
    Quiet,
}

/// Callback signature for transfer progress.
pub type ProgressCallback<'a> = &'a (dyn Fn(CacheProgress<'_>) -> ProgressResult + Send + Sync);

/// An error from the download transport.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No transport is configured.
    #[error("no download transport is available")]
    NoTransport,

    /// The user canceled the transfer.
    #[error("the download was canceled")]
    UserExit,

    /// The transport failed.
    #[error("download failed")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Writing the downloaded bytes failed.
    #[error("failed to write downloaded file")]
    Io(#[from] io::Error),
}

/// The seam to the download machinery. The engine decides *what* to fetch
/// and *where* to put it; the transport owns connections, resume and
/// authentication.
#[async_trait]
pub trait DownloadTransport: Send + Sync {
    /// Downloads `url` to `destination`, reporting progress.
    async fn download(
        &self,
        url: &Url,
        destination: &Path,
        expected_size: u64,
        progress: ProgressCallback<'_>,
        payload_id: &str,
    ) -> Result<(), DownloadError>;
}

/// A transport for hosts where downloading is disabled. Every download
/// fails, so only locally sourced payloads can be acquired.
#[derive(Debug, Default)]
pub struct NoDownloadTransport;

#[async_trait]
impl DownloadTransport for NoDownloadTransport {
    async fn download(
        &self,
        _url: &Url,
        _destination: &Path,
        _expected_size: u64,
        _progress: ProgressCallback<'_>,
        _payload_id: &str,
    ) -> Result<(), DownloadError> {
        Err(DownloadError::NoTransport)
    }
}

/// An error during payload acquisition.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// No local source was found and the payload has no download URL.
    #[error("payload '{0}' has no local source and no download url")]
    NoSource(String),

    /// The host application canceled the transfer.
    #[error("acquisition of payload '{0}' was canceled")]
    UserExit(String),

    /// The download transport failed.
    #[error("failed to download payload '{payload}'")]
    Download {
        /// The payload id.
        payload: String,
        /// The transport failure.
        #[source]
        source: DownloadError,
    },

    /// A local copy failed.
    #[error("failed to copy payload from local source")]
    Io(#[from] io::Error),
}

/// The ordered local directories probed for a relative payload source path:
/// the directory of the running bundle, the last-used source persisted by a
/// previous run, and the host-supplied layout directory. An absolute source
/// path skips the search entirely.
#[derive(Debug, Clone, Default)]
pub struct SourceSearch {
    /// Directory of the currently running bundle executable.
    pub bundle_directory: Option<PathBuf>,
    /// Last-used source directory persisted on a previous run.
    pub last_used_source: Option<PathBuf>,
    /// Host-supplied layout directory.
    pub layout_directory: Option<PathBuf>,
}

impl SourceSearch {
    /// Resolves `source_path` to an existing file, or `None` when no
    /// candidate exists.
    pub fn resolve(&self, source_path: &Path) -> Option<PathBuf> {
        if source_path.is_absolute() {
            return source_path.is_file().then(|| source_path.to_owned());
        }
        [
            &self.bundle_directory,
            &self.last_used_source,
            &self.layout_directory,
        ]
        .into_iter()
        .flatten()
        .map(|base| base.join(source_path))
        .find(|candidate| candidate.is_file())
    }
}

/// Copies `source` to `destination` in chunks, reporting progress. A
/// `Cancel` or `Stop` answer aborts the copy, removes the partial
/// destination and returns a user-exit error; `Quiet` suppresses further
/// callbacks without aborting.
pub(crate) async fn copy_with_progress(
    source: &Path,
    destination: &Path,
    payload_id: &str,
    progress: ProgressCallback<'_>,
) -> Result<(), AcquireError> {
    if let Some(parent) = destination.parent() {
        fs_err::tokio::create_dir_all(parent).await?;
    }

    let mut reader = fs_err::tokio::File::open(source).await?;
    let bytes_total = reader.metadata().await?.len();
    let mut writer = fs_err::tokio::File::create(destination).await?;

    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut bytes_transferred = 0u64;
    let mut quiet = false;

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        bytes_transferred += read as u64;

        if !quiet {
            match progress(CacheProgress {
                payload_id,
                bytes_transferred,
                bytes_total,
            }) {
                ProgressResult::Continue => {}
                ProgressResult::Quiet => quiet = true,
                ProgressResult::Cancel | ProgressResult::Stop => {
                    drop(writer);
                    crate::fsutil::remove_file(destination).await?;
                    return Err(AcquireError::UserExit(payload_id.to_owned()));
                }
            }
        }
    }

    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;

    use super::{copy_with_progress, AcquireError, ProgressResult, SourceSearch};

    #[test]
    fn test_source_search_order() {
        let temp = tempfile::tempdir().unwrap();
        let bundle_dir = temp.path().join("bundle");
        let last_used = temp.path().join("last");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::create_dir_all(&last_used).unwrap();
        std::fs::write(last_used.join("p.bin"), b"last").unwrap();

        let search = SourceSearch {
            bundle_directory: Some(bundle_dir.clone()),
            last_used_source: Some(last_used.clone()),
            layout_directory: None,
        };

        // Only the last-used source has the file.
        assert_eq!(
            search.resolve("p.bin".as_ref()),
            Some(last_used.join("p.bin"))
        );

        // The bundle directory wins once the file appears there.
        std::fs::write(bundle_dir.join("p.bin"), b"bundle").unwrap();
        assert_eq!(
            search.resolve("p.bin".as_ref()),
            Some(bundle_dir.join("p.bin"))
        );
    }

    #[test]
    fn test_absolute_source_skips_search() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("abs.bin");
        std::fs::write(&file, b"x").unwrap();

        let search = SourceSearch::default();
        assert_eq!(search.resolve(&file), Some(file.clone()));
        assert_eq!(search.resolve(&temp.path().join("missing.bin")), None);
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_file() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src.bin");
        std::fs::write(&source, vec![7u8; 256 * 1024]).unwrap();
        let destination = temp.path().join("dst.bin");

        let calls = AtomicU32::new(0);
        let result = copy_with_progress(&source, &destination, "p", &|_| {
            // Cancel on the second chunk.
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                ProgressResult::Continue
            } else {
                ProgressResult::Cancel
            }
        })
        .await;

        assert_matches!(result, Err(AcquireError::UserExit(_)));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_quiet_suppresses_callbacks() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src.bin");
        std::fs::write(&source, vec![7u8; 256 * 1024]).unwrap();
        let destination = temp.path().join("dst.bin");

        let calls = AtomicU32::new(0);
        copy_with_progress(&source, &destination, "p", &|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            ProgressResult::Quiet
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::metadata(&destination).unwrap().len(),
            256 * 1024
        );
    }
}
