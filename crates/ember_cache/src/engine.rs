//! The cache engine: materializes payloads and containers into the
//! completed per-machine or per-user cache, or into a host-supplied layout
//! directory, with content verified before final placement.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use ember_bundle_types::manifest::{Container, Payload};

use crate::{
    acquire::{
        copy_with_progress, AcquireError, DownloadTransport, NoDownloadTransport,
        ProgressCallback, SourceSearch,
    },
    fsutil,
    paths::{CacheLocations, WorkingFolder},
    verify::{
        verify_payload, SignatureBackend, UnsupportedSignatureBackend, VerificationError,
    },
};

/// The seam to the OS access-control primitives. Before a staged file is
/// verified its ACLs are reset so a partially-trusted acquirer cannot keep
/// control over what will become an elevated-executed file.
pub trait AclBackend: Send + Sync {
    /// Creates the cache root with the restrictive DACL if it does not exist
    /// yet. Idempotent.
    fn secure_cache_root(&self, root: &Path, per_machine: bool) -> io::Result<()>;

    /// Resets a staged file to inherited ACLs, reassigns ownership for the
    /// per-machine cache, and clears file attributes.
    fn reset_staged_file(&self, path: &Path, per_machine: bool) -> io::Result<()>;
}

/// An ACL backend for hosts without Windows security primitives. Creates
/// plain directories and leaves file modes alone.
#[derive(Debug, Default)]
pub struct NoopAclBackend;

impl AclBackend for NoopAclBackend {
    fn secure_cache_root(&self, root: &Path, _per_machine: bool) -> io::Result<()> {
        std::fs::create_dir_all(root)
    }

    fn reset_staged_file(&self, _path: &Path, _per_machine: bool) -> io::Result<()> {
        Ok(())
    }
}

/// An error from a cache engine operation.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Acquisition failed.
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    /// Verification failed; the offending file has been removed.
    #[error(transparent)]
    Verify(#[from] VerificationError),

    /// A filesystem operation failed after its retries.
    #[error("cache filesystem operation failed")]
    Io(#[from] io::Error),
}

/// How a payload reached its final location.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The verified file was already in place; nothing was moved or
    /// rewritten.
    AlreadyCached,
    /// The file was staged, verified and moved into place.
    Cached,
}

/// Where an acquired payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireSource {
    /// Copied from a local path.
    Local(PathBuf),
    /// Fetched by the download transport.
    Download(url::Url),
}

/// A builder to configure a [`CacheEngine`].
#[derive(Default)]
pub struct CacheEngineBuilder {
    locations: Option<CacheLocations>,
    working: Option<WorkingFolder>,
    source_search: SourceSearch,
    downloader: Option<Arc<dyn DownloadTransport>>,
    signatures: Option<Arc<dyn SignatureBackend>>,
    acl: Option<Arc<dyn AclBackend>>,
}

impl CacheEngineBuilder {
    /// Sets the cache roots. Defaults to the system locations.
    pub fn with_locations(mut self, locations: CacheLocations) -> Self {
        self.locations = Some(locations);
        self
    }

    /// Sets the working folder. Defaults to a fresh folder under the
    /// temporary directory.
    pub fn with_working_folder(mut self, working: WorkingFolder) -> Self {
        self.working = Some(working);
        self
    }

    /// Sets the local source search directories.
    pub fn with_source_search(mut self, source_search: SourceSearch) -> Self {
        self.source_search = source_search;
        self
    }

    /// Sets the download transport. Defaults to a transport that fails every
    /// download.
    pub fn with_download_transport(mut self, downloader: Arc<dyn DownloadTransport>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Sets the signature backend. Defaults to a backend that fails every
    /// signature and catalog check.
    pub fn with_signature_backend(mut self, signatures: Arc<dyn SignatureBackend>) -> Self {
        self.signatures = Some(signatures);
        self
    }

    /// Sets the ACL backend. Defaults to plain directory creation.
    pub fn with_acl_backend(mut self, acl: Arc<dyn AclBackend>) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Builds the engine.
    pub fn finish(self) -> CacheEngine {
        CacheEngine {
            locations: self
                .locations
                .unwrap_or_else(|| CacheLocations::from_system(None)),
            working: self.working.unwrap_or_default(),
            source_search: self.source_search,
            downloader: self
                .downloader
                .unwrap_or_else(|| Arc::new(NoDownloadTransport)),
            signatures: self
                .signatures
                .unwrap_or_else(|| Arc::new(UnsupportedSignatureBackend)),
            acl: self.acl.unwrap_or_else(|| Arc::new(NoopAclBackend)),
        }
    }
}

/// Materializes payloads into the completed cache or a layout directory.
/// See the crate documentation for the path model.
pub struct CacheEngine {
    locations: CacheLocations,
    working: WorkingFolder,
    source_search: SourceSearch,
    downloader: Arc<dyn DownloadTransport>,
    signatures: Arc<dyn SignatureBackend>,
    acl: Arc<dyn AclBackend>,
}

impl CacheEngine {
    /// Constructs a builder.
    pub fn builder() -> CacheEngineBuilder {
        CacheEngineBuilder::default()
    }

    /// The resolved cache locations.
    pub fn locations(&self) -> &CacheLocations {
        &self.locations
    }

    /// The per-run working folder.
    pub fn working_folder(&self) -> &WorkingFolder {
        &self.working
    }

    /// The deterministic working path of a payload.
    pub fn resolve_payload_working_path(&self, payload: &Payload) -> PathBuf {
        self.working.payload_path(&payload.id)
    }

    /// The deterministic working path of a container.
    pub fn resolve_container_working_path(&self, container: &Container) -> PathBuf {
        self.working.payload_path(&container.id)
    }

    /// The final cached path of a payload inside its package folder.
    pub fn completed_payload_path(
        &self,
        per_machine: bool,
        cache_id: &str,
        payload: &Payload,
    ) -> PathBuf {
        self.locations
            .completed_package_folder(per_machine, cache_id)
            .join(&payload.file_path)
    }

    /// Acquires a payload into `working_path`: from the local source search
    /// when the source resolves, otherwise through the download transport.
    pub async fn acquire_payload(
        &self,
        payload: &Payload,
        working_path: &Path,
        progress: ProgressCallback<'_>,
    ) -> Result<AcquireSource, CacheError> {
        self.working.ensure().await.map_err(AcquireError::Io)?;

        if let Some(local) = self.source_search.resolve(&payload.source_path) {
            tracing::debug!(payload = %payload.id, source = %local.display(), "acquiring payload from local source");
            copy_with_progress(&local, working_path, &payload.id, progress).await?;
            return Ok(AcquireSource::Local(local));
        }

        if let Some(url) = &payload.download_url {
            tracing::debug!(payload = %payload.id, url = %url, "acquiring payload by download");
            self.downloader
                .download(url, working_path, payload.size, progress, &payload.id)
                .await
                .map_err(|source| AcquireError::Download {
                    payload: payload.id.clone(),
                    source,
                })?;
            return Ok(AcquireSource::Download(url.clone()));
        }

        Err(AcquireError::NoSource(payload.id.clone()).into())
    }

    /// Acquires a detached container into `working_path`.
    pub async fn acquire_container(
        &self,
        container: &Container,
        working_path: &Path,
        progress: ProgressCallback<'_>,
    ) -> Result<AcquireSource, CacheError> {
        self.working.ensure().await.map_err(AcquireError::Io)?;

        if let Some(local) = self.source_search.resolve(&container.source_path) {
            tracing::debug!(container = %container.id, source = %local.display(), "acquiring container from local source");
            copy_with_progress(&local, working_path, &container.id, progress).await?;
            return Ok(AcquireSource::Local(local));
        }

        if let Some(url) = &container.download_url {
            tracing::debug!(container = %container.id, url = %url, "acquiring container by download");
            self.downloader
                .download(url, working_path, container.size, progress, &container.id)
                .await
                .map_err(|source| AcquireError::Download {
                    payload: container.id.clone(),
                    source,
                })?;
            return Ok(AcquireSource::Download(url.clone()));
        }

        Err(AcquireError::NoSource(container.id.clone()).into())
    }

    /// Verifies a payload at `path`, removing the file when verification
    /// fails so a corrupt file can never be picked up later.
    pub async fn verify_payload_at(
        &self,
        payload: &Payload,
        path: &Path,
        catalog_path: Option<&Path>,
    ) -> Result<(), CacheError> {
        match verify_payload(payload, path, catalog_path, self.signatures.as_ref()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(payload = %payload.id, path = %path.display(), error = %err, "payload failed verification, removing file");
                fsutil::remove_file(path).await?;
                Err(err.into())
            }
        }
    }

    /// Verifies a container's hash at `path`. Containers without a hash are
    /// accepted as-is.
    pub async fn verify_container_at(
        &self,
        container: &Container,
        path: &Path,
    ) -> Result<(), CacheError> {
        let Some(expected) = &container.hash else {
            return Ok(());
        };
        let path_owned = path.to_owned();
        let actual = tokio::task::spawn_blocking(move || {
            ember_digest::compute_file_digest::<ember_digest::Sha1>(&path_owned)
        })
        .await
        .map_err(io::Error::other)??;

        if &actual != expected {
            let err = VerificationError::HashMismatch {
                payload: container.id.clone(),
                expected: ember_digest::format_digest_hex::<ember_digest::Sha1>(expected),
                actual: ember_digest::format_digest_hex::<ember_digest::Sha1>(&actual),
            };
            tracing::warn!(container = %container.id, error = %err, "container failed verification, removing file");
            fsutil::remove_file(path).await?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Completes a payload into the package cache: verifies any existing
    /// cached copy first (idempotent hit), otherwise stages through the
    /// unverified area, resets ACLs, verifies, and moves into place.
    pub async fn complete_payload(
        &self,
        per_machine: bool,
        payload: &Payload,
        cache_id: &str,
        working_path: &Path,
        move_file: bool,
        catalog_path: Option<&Path>,
    ) -> Result<CacheOutcome, CacheError> {
        let final_path = self.completed_payload_path(per_machine, cache_id, payload);

        if final_path.is_file()
            && verify_payload(payload, &final_path, catalog_path, self.signatures.as_ref())
                .await
                .is_ok()
        {
            tracing::debug!(payload = %payload.id, "payload already cached and verified");
            if move_file {
                // The working copy is no longer needed.
                let _ = fsutil::remove_file(working_path).await;
            }
            return Ok(CacheOutcome::AlreadyCached);
        }

        let root = self.locations.root(per_machine).to_owned();
        self.acl.secure_cache_root(&root, per_machine)?;

        let unverified_path = self.locations.unverified_path(per_machine, &payload.id);
        if move_file {
            fsutil::move_file(working_path, &unverified_path).await?;
        } else {
            fsutil::copy_file(working_path, &unverified_path).await?;
        }
        self.acl.reset_staged_file(&unverified_path, per_machine)?;

        self.verify_payload_at(payload, &unverified_path, catalog_path)
            .await?;

        fsutil::move_file(&unverified_path, &final_path).await?;
        tracing::info!(payload = %payload.id, path = %final_path.display(), "payload cached");
        Ok(CacheOutcome::Cached)
    }

    /// Lays a payload out into a host-supplied directory, verifying before
    /// placement.
    pub async fn layout_payload(
        &self,
        payload: &Payload,
        layout_directory: &Path,
        working_path: &Path,
        move_file: bool,
        catalog_path: Option<&Path>,
    ) -> Result<CacheOutcome, CacheError> {
        let target = layout_directory.join(&payload.file_path);

        if target.is_file()
            && verify_payload(payload, &target, catalog_path, self.signatures.as_ref())
                .await
                .is_ok()
        {
            tracing::debug!(payload = %payload.id, "payload already laid out");
            if move_file {
                let _ = fsutil::remove_file(working_path).await;
            }
            return Ok(CacheOutcome::AlreadyCached);
        }

        self.verify_payload_at(payload, working_path, catalog_path)
            .await?;
        if move_file {
            fsutil::move_file(working_path, &target).await?;
        } else {
            fsutil::copy_file(working_path, &target).await?;
        }
        tracing::info!(payload = %payload.id, path = %target.display(), "payload laid out");
        Ok(CacheOutcome::Cached)
    }

    /// Lays a container out into a host-supplied directory.
    pub async fn layout_container(
        &self,
        container: &Container,
        layout_directory: &Path,
        working_path: &Path,
        move_file: bool,
    ) -> Result<CacheOutcome, CacheError> {
        let target = layout_directory.join(&container.file_path);

        self.verify_container_at(container, working_path).await?;
        if move_file {
            fsutil::move_file(working_path, &target).await?;
        } else {
            fsutil::copy_file(working_path, &target).await?;
        }
        tracing::info!(container = %container.id, path = %target.display(), "container laid out");
        Ok(CacheOutcome::Cached)
    }

    /// Caches the bundle executable and registration artifacts into the
    /// completed bundle folder.
    pub async fn complete_bundle(
        &self,
        per_machine: bool,
        bundle_id: &str,
        bundle_executable: &Path,
    ) -> Result<PathBuf, CacheError> {
        let root = self.locations.root(per_machine).to_owned();
        self.acl.secure_cache_root(&root, per_machine)?;

        let folder = self.locations.completed_bundle_folder(per_machine, bundle_id);
        let file_name = bundle_executable
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bundle path has no file name"))?;
        let target = folder.join(file_name);
        if target != bundle_executable {
            fsutil::copy_file(bundle_executable, &target).await?;
        }
        tracing::info!(bundle = bundle_id, path = %target.display(), "bundle cached");
        Ok(target)
    }

    /// Best-effort removal of a completed package folder. Retries
    /// internally; a failure is reported but should not fail the apply.
    pub async fn remove_package(
        &self,
        per_machine: bool,
        package_id: &str,
        cache_id: &str,
    ) -> Result<(), CacheError> {
        let folder = self.locations.completed_package_folder(per_machine, cache_id);
        tracing::info!(package = package_id, path = %folder.display(), "removing cached package");
        fsutil::remove_dir_all(&folder).await?;
        Ok(())
    }

    /// Best-effort recursive removal of the working folder.
    pub async fn remove_working_folder(&self) -> Result<(), CacheError> {
        fsutil::remove_dir_all(self.working.path()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use ember_bundle_types::manifest::Payload;
    use ember_bundle_types::state::Packaging;
    use ember_digest::{compute_bytes_digest, Sha1};

    use super::{CacheEngine, CacheError, CacheOutcome};
    use crate::acquire::{ProgressResult, SourceSearch};
    use crate::paths::{CacheLocations, WorkingFolder};
    use crate::verify::VerificationError;

    fn hashed_payload(id: &str, content: &[u8]) -> Payload {
        Payload {
            id: id.to_owned(),
            file_path: PathBuf::from(format!("{id}.bin")),
            source_path: PathBuf::from(format!("{id}.bin")),
            packaging: Packaging::External,
            container: None,
            hash: Some(compute_bytes_digest::<Sha1>(content)),
            size: content.len() as u64,
            download_url: None,
            catalog: None,
            certificate_root_public_key_id: None,
            certificate_thumbprint: None,
            layout_only: false,
        }
    }

    fn engine(temp: &tempfile::TempDir, bundle_dir: Option<PathBuf>) -> CacheEngine {
        CacheEngine::builder()
            .with_locations(CacheLocations::with_roots(
                temp.path().join("user-cache"),
                temp.path().join("machine-cache"),
            ))
            .with_working_folder(WorkingFolder::at(temp.path().join("working")))
            .with_source_search(SourceSearch {
                bundle_directory: bundle_dir,
                last_used_source: None,
                layout_directory: None,
            })
            .finish()
    }

    #[tokio::test]
    async fn test_acquire_and_complete() {
        let temp = tempfile::tempdir().unwrap();
        let bundle_dir = temp.path().join("bundle");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("p.bin"), b"payload data").unwrap();

        let engine = engine(&temp, Some(bundle_dir));
        let payload = hashed_payload("p", b"payload data");

        let working = engine.resolve_payload_working_path(&payload);
        engine
            .acquire_payload(&payload, &working, &|_| ProgressResult::Continue)
            .await
            .unwrap();
        assert!(working.is_file());

        let outcome = engine
            .complete_payload(false, &payload, "pkg-v1", &working, true, None)
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Cached);

        let final_path = engine.completed_payload_path(false, "pkg-v1", &payload);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"payload data");
        // The move consumed the working file.
        assert!(!working.exists());
        // Nothing lingers in the unverified area.
        assert!(!engine
            .locations()
            .unverified_path(false, "p")
            .exists());
    }

    #[tokio::test]
    async fn test_idempotent_cache_hit_does_not_rewrite() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine(&temp, None);
        let payload = hashed_payload("p", b"payload data");

        // Pre-populate the final cache location.
        let final_path = engine.completed_payload_path(false, "pkg-v1", &payload);
        std::fs::create_dir_all(final_path.parent().unwrap()).unwrap();
        std::fs::write(&final_path, b"payload data").unwrap();
        let modified_before = std::fs::metadata(&final_path).unwrap().modified().unwrap();

        // Completing again from a working copy must not touch the file.
        let working = temp.path().join("working-copy.bin");
        std::fs::write(&working, b"payload data").unwrap();
        let outcome = engine
            .complete_payload(false, &payload, "pkg-v1", &working, true, None)
            .await
            .unwrap();

        assert_eq!(outcome, CacheOutcome::AlreadyCached);
        let modified_after = std::fs::metadata(&final_path).unwrap().modified().unwrap();
        assert_eq!(modified_before, modified_after);
        // The redundant working copy was cleaned up because the caller asked
        // for a move.
        assert!(!working.exists());
    }

    #[tokio::test]
    async fn test_verification_failure_removes_staged_file() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine(&temp, None);
        // Hash in the manifest does not match the bytes on disk.
        let payload = hashed_payload("p", b"expected data");

        let working = temp.path().join("working-copy.bin");
        std::fs::write(&working, b"tampered data").unwrap();

        let result = engine
            .complete_payload(false, &payload, "pkg-v1", &working, true, None)
            .await;
        assert_matches!(
            result,
            Err(CacheError::Verify(VerificationError::HashMismatch { .. }))
        );

        // Neither the unverified copy nor the final file may exist.
        assert!(!engine.locations().unverified_path(false, "p").exists());
        assert!(!engine
            .completed_payload_path(false, "pkg-v1", &payload)
            .exists());
    }

    #[tokio::test]
    async fn test_layout_payload() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine(&temp, None);
        let payload = hashed_payload("p", b"bits");

        let working = temp.path().join("w.bin");
        std::fs::write(&working, b"bits").unwrap();
        let layout = temp.path().join("layout");

        let outcome = engine
            .layout_payload(&payload, &layout, &working, false, None)
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Cached);
        assert_eq!(std::fs::read(layout.join("p.bin")).unwrap(), b"bits");
        // Copy keeps the working file.
        assert!(working.exists());
    }

    #[tokio::test]
    async fn test_remove_package_is_recursive() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine(&temp, None);
        let folder = engine
            .locations()
            .completed_package_folder(true, "pkg-v1");
        std::fs::create_dir_all(folder.join("nested")).unwrap();
        std::fs::write(folder.join("nested/file.bin"), b"x").unwrap();

        engine.remove_package(true, "pkg", "pkg-v1").await.unwrap();
        assert!(!folder.exists());
    }
}
