//! Retrying filesystem primitives. Transient sharing violations and
//! antivirus interference make single-shot file operations unreliable on the
//! machines bundles run on, so every move/copy/delete retries a bounded
//! number of times with a fixed pause.

use std::io;
use std::path::Path;

use crate::consts::{FILE_OPERATION_RETRY_COUNT, FILE_OPERATION_RETRY_WAIT};

async fn with_retry<F, Fut, T>(mut operation: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = io::Result<T>>,
{
    let mut result = operation().await;
    for _ in 0..FILE_OPERATION_RETRY_COUNT {
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(error = %err, "file operation failed, retrying");
                tokio::time::sleep(FILE_OPERATION_RETRY_WAIT).await;
                result = operation().await;
            }
        }
    }
    result
}

async fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::tokio::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Moves a file, creating the destination's parent directories. Falls back
/// to copy-and-delete when a rename is not possible (different volumes).
pub(crate) async fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    with_retry(|| async {
        ensure_parent(destination).await?;
        match fs_err::tokio::rename(source, destination).await {
            Ok(()) => Ok(()),
            Err(_) => {
                fs_err::tokio::copy(source, destination).await?;
                fs_err::tokio::remove_file(source).await
            }
        }
    })
    .await
}

/// Copies a file, creating the destination's parent directories.
pub(crate) async fn copy_file(source: &Path, destination: &Path) -> io::Result<()> {
    with_retry(|| async {
        ensure_parent(destination).await?;
        fs_err::tokio::copy(source, destination).await.map(|_| ())
    })
    .await
}

/// Removes a file if it exists.
pub(crate) async fn remove_file(path: &Path) -> io::Result<()> {
    with_retry(|| async {
        match fs_err::tokio::remove_file(path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    })
    .await
}

/// Removes a directory tree if it exists.
pub(crate) async fn remove_dir_all(path: &Path) -> io::Result<()> {
    with_retry(|| async {
        match fs_err::tokio::remove_dir_all(path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::consts::FILE_OPERATION_RETRY_COUNT;

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        // A persistently failing operation runs the initial attempt plus at
        // most FILE_OPERATION_RETRY_COUNT retries.
        let attempts = AtomicU32::new(0);
        let result: std::io::Result<()> = super::with_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(std::io::Error::other("always fails")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1 + FILE_OPERATION_RETRY_COUNT);
    }

    #[tokio::test]
    async fn test_move_creates_parents() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src.bin");
        std::fs::write(&source, b"payload").unwrap();

        let destination = temp.path().join("a/b/dst.bin");
        super::move_file(&source, &destination).await.unwrap();

        assert!(!source.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let temp = tempfile::tempdir().unwrap();
        super::remove_file(&temp.path().join("nope")).await.unwrap();
        super::remove_dir_all(&temp.path().join("nope")).await.unwrap();
    }
}
