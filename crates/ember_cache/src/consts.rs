//! Constants shared by the cache engine.

use std::time::Duration;

/// The folder name of the completed cache under the per-user and per-machine
/// roots.
pub const PACKAGE_CACHE_FOLDER_NAME: &str = "Package Cache";

/// The staging folder under a cache root where files wait for verification.
pub const UNVERIFIED_FOLDER_NAME: &str = ".unverified";

/// How often a failed file move/copy/delete is retried before giving up.
pub const FILE_OPERATION_RETRY_COUNT: u32 = 3;

/// Pause between file operation retries.
pub const FILE_OPERATION_RETRY_WAIT: Duration = Duration::from_secs(2);

/// Chunk size for copies that report progress.
pub(crate) const COPY_CHUNK_SIZE: usize = 64 * 1024;
