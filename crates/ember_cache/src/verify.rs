//! Payload verification. A payload is trusted through exactly one of three
//! gates, in order of preference: an Authenticode signature whose chain
//! contains the pinned root public key, a signed catalog that vouches for the
//! file's hash, or a plain SHA-1 digest comparison. Signature and catalog
//! checks run against the OS through the [`SignatureBackend`] seam; the
//! digest comparison is done here.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ember_bundle_types::manifest::Payload;
use ember_digest::{compute_file_digest, format_digest_hex, Sha1};
use thiserror::Error;

/// How certificate revocation is checked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RevocationMode {
    /// Contact the revocation authority.
    Online,
    /// Use only locally cached revocation data.
    CacheOnly,
}

/// One certificate in an Authenticode signer chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCertificate {
    /// Hex SHA-1 identifier of the certificate's public key.
    pub public_key_id: String,
    /// Hex SHA-1 thumbprint of the whole certificate.
    pub thumbprint: String,
}

/// An error from the OS signature primitives.
#[derive(Debug, Error)]
pub enum SignatureBackendError {
    /// The host has no signature verification support.
    #[error("signature verification is not available on this host")]
    Unsupported,

    /// The file carries no signature.
    #[error("the file is not signed")]
    NotSigned,

    /// Revocation servers could not be reached.
    #[error("revocation status could not be determined online")]
    RevocationOffline,

    /// The signature is cryptographically invalid.
    #[error("the signature is invalid")]
    Invalid,

    /// An I/O error while reading the file.
    #[error("failed to read file for signature verification")]
    Io(#[from] io::Error),
}

/// The OS seam for Authenticode and catalog verification. The engine owns
/// the policy (which gate applies, online-then-cached retries, pinning);
/// implementations only answer the low-level questions.
#[async_trait]
pub trait SignatureBackend: Send + Sync {
    /// Verifies the embedded Authenticode signature of `path` and returns
    /// the signer chain, leaf first.
    async fn signer_chain(
        &self,
        path: &Path,
        revocation: RevocationMode,
    ) -> Result<Vec<ChainCertificate>, SignatureBackendError>;

    /// Verifies `file` against the signed catalog at `catalog`.
    async fn verify_catalog(
        &self,
        catalog: &Path,
        file: &Path,
        revocation: RevocationMode,
    ) -> Result<(), SignatureBackendError>;
}

/// A backend for hosts without signature support. Every signature or catalog
/// gated payload fails verification; hash-gated payloads are unaffected.
#[derive(Debug, Default)]
pub struct UnsupportedSignatureBackend;

#[async_trait]
impl SignatureBackend for UnsupportedSignatureBackend {
    async fn signer_chain(
        &self,
        _path: &Path,
        _revocation: RevocationMode,
    ) -> Result<Vec<ChainCertificate>, SignatureBackendError> {
        Err(SignatureBackendError::Unsupported)
    }

    async fn verify_catalog(
        &self,
        _catalog: &Path,
        _file: &Path,
        _revocation: RevocationMode,
    ) -> Result<(), SignatureBackendError> {
        Err(SignatureBackendError::Unsupported)
    }
}

/// An error explaining why a payload failed verification.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The payload declares no hash, catalog or certificate.
    #[error("payload '{0}' declares no verification method")]
    NoVerificationMethod(String),

    /// The signer chain carries no certificate with the pinned public key.
    #[error(
        "authenticode chain of payload '{payload}' contains no certificate with public key id '{expected}'"
    )]
    CertificateMismatch {
        /// The payload id.
        payload: String,
        /// The pinned public key id.
        expected: String,
    },

    /// The pinned certificate was found but its thumbprint differs.
    #[error("certificate thumbprint mismatch for payload '{payload}': expected '{expected}'")]
    ThumbprintMismatch {
        /// The payload id.
        payload: String,
        /// The pinned thumbprint.
        expected: String,
    },

    /// The payload references a catalog that is not cached yet.
    #[error("catalog '{0}' is not available for verification")]
    CatalogUnavailable(String),

    /// The file's digest does not match the manifest.
    #[error("hash mismatch for payload '{payload}': expected {expected}, actual {actual}")]
    HashMismatch {
        /// The payload id.
        payload: String,
        /// Digest from the manifest.
        expected: String,
        /// Digest of the file on disk.
        actual: String,
    },

    /// The OS signature primitives failed.
    #[error("signature verification failed")]
    Signature(#[from] SignatureBackendError),

    /// Reading the file failed.
    #[error("failed to read payload for verification")]
    Io(#[from] io::Error),
}

/// Runs a signature operation online first, falling back to cached-only
/// revocation when the authority cannot be reached.
async fn with_revocation_fallback<T, F, Fut>(operation: F) -> Result<T, SignatureBackendError>
where
    F: Fn(RevocationMode) -> Fut,
    Fut: std::future::Future<Output = Result<T, SignatureBackendError>>,
{
    match operation(RevocationMode::Online).await {
        Err(SignatureBackendError::RevocationOffline) => {
            tracing::debug!("revocation authority unreachable, retrying with cached data");
            operation(RevocationMode::CacheOnly).await
        }
        other => other,
    }
}

/// Verifies the file at `path` against the payload's declared trust gate.
///
/// `catalog_path` must be the cached location of the payload's catalog when
/// the payload declares one and no certificate pin applies.
pub async fn verify_payload(
    payload: &Payload,
    path: &Path,
    catalog_path: Option<&Path>,
    signatures: &dyn SignatureBackend,
) -> Result<(), VerificationError> {
    if let Some(expected_key_id) = &payload.certificate_root_public_key_id {
        let chain =
            with_revocation_fallback(|mode| signatures.signer_chain(path, mode)).await?;
        let matched = chain
            .iter()
            .find(|cert| cert.public_key_id.eq_ignore_ascii_case(expected_key_id))
            .ok_or_else(|| VerificationError::CertificateMismatch {
                payload: payload.id.clone(),
                expected: expected_key_id.clone(),
            })?;
        if let Some(expected_thumbprint) = &payload.certificate_thumbprint {
            if !matched.thumbprint.eq_ignore_ascii_case(expected_thumbprint) {
                return Err(VerificationError::ThumbprintMismatch {
                    payload: payload.id.clone(),
                    expected: expected_thumbprint.clone(),
                });
            }
        }
        tracing::debug!(payload = %payload.id, "payload verified by authenticode chain");
        return Ok(());
    }

    if let Some(catalog_id) = &payload.catalog {
        let catalog = catalog_path
            .ok_or_else(|| VerificationError::CatalogUnavailable(catalog_id.clone()))?;
        with_revocation_fallback(|mode| signatures.verify_catalog(catalog, path, mode)).await?;
        tracing::debug!(payload = %payload.id, "payload verified by catalog");
        return Ok(());
    }

    if let Some(expected) = &payload.hash {
        let actual = compute_digest(path.to_owned()).await?;
        if &actual != expected {
            return Err(VerificationError::HashMismatch {
                payload: payload.id.clone(),
                expected: format_digest_hex::<Sha1>(expected),
                actual: format_digest_hex::<Sha1>(&actual),
            });
        }
        tracing::debug!(payload = %payload.id, "payload verified by hash");
        return Ok(());
    }

    Err(VerificationError::NoVerificationMethod(payload.id.clone()))
}

async fn compute_digest(path: PathBuf) -> io::Result<ember_digest::Sha1Hash> {
    tokio::task::spawn_blocking(move || compute_file_digest::<Sha1>(&path))
        .await
        .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use ember_bundle_types::manifest::Payload;
    use ember_bundle_types::state::Packaging;
    use ember_digest::{compute_bytes_digest, Sha1};

    use super::{
        verify_payload, ChainCertificate, RevocationMode, SignatureBackend,
        SignatureBackendError, UnsupportedSignatureBackend, VerificationError,
    };

    fn payload(id: &str) -> Payload {
        Payload {
            id: id.to_owned(),
            file_path: PathBuf::from(format!("{id}.bin")),
            source_path: PathBuf::from(format!("{id}.bin")),
            packaging: Packaging::External,
            container: None,
            hash: None,
            size: 0,
            download_url: None,
            catalog: None,
            certificate_root_public_key_id: None,
            certificate_thumbprint: None,
            layout_only: false,
        }
    }

    struct ChainBackend {
        chain: Vec<ChainCertificate>,
    }

    #[async_trait]
    impl SignatureBackend for ChainBackend {
        async fn signer_chain(
            &self,
            _path: &Path,
            _revocation: RevocationMode,
        ) -> Result<Vec<ChainCertificate>, SignatureBackendError> {
            Ok(self.chain.clone())
        }

        async fn verify_catalog(
            &self,
            _catalog: &Path,
            _file: &Path,
            _revocation: RevocationMode,
        ) -> Result<(), SignatureBackendError> {
            Err(SignatureBackendError::NotSigned)
        }
    }

    #[tokio::test]
    async fn test_hash_verification() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("p.bin");
        std::fs::write(&path, b"payload bytes").unwrap();

        let mut p = payload("p");
        p.hash = Some(compute_bytes_digest::<Sha1>(b"payload bytes"));

        let backend = UnsupportedSignatureBackend;
        verify_payload(&p, &path, None, &backend).await.unwrap();

        // Corrupting a single byte must fail verification.
        std::fs::write(&path, b"payload Bytes").unwrap();
        assert_matches!(
            verify_payload(&p, &path, None, &backend).await,
            Err(VerificationError::HashMismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_certificate_pin_match() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("p.bin");
        std::fs::write(&path, b"signed").unwrap();

        let mut p = payload("p");
        p.certificate_root_public_key_id = Some("AABB".to_owned());

        let backend = ChainBackend {
            chain: vec![ChainCertificate {
                public_key_id: "aabb".to_owned(),
                thumbprint: "1234".to_owned(),
            }],
        };
        // Case-insensitive public key id match.
        verify_payload(&p, &path, None, &backend).await.unwrap();

        // With a thumbprint pin, the matched certificate must also carry it.
        p.certificate_thumbprint = Some("ffff".to_owned());
        assert_matches!(
            verify_payload(&p, &path, None, &backend).await,
            Err(VerificationError::ThumbprintMismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_certificate_pin_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("p.bin");
        std::fs::write(&path, b"signed").unwrap();

        let mut p = payload("p");
        p.certificate_root_public_key_id = Some("AABB".to_owned());

        let backend = ChainBackend {
            chain: vec![ChainCertificate {
                public_key_id: "0000".to_owned(),
                thumbprint: "1234".to_owned(),
            }],
        };
        assert_matches!(
            verify_payload(&p, &path, None, &backend).await,
            Err(VerificationError::CertificateMismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_catalog_preferred_over_hash() {
        // A payload declaring both a catalog and a hash verifies through the
        // catalog; the hash is not consulted.
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("p.bin");
        std::fs::write(&path, b"data").unwrap();
        let catalog = temp.path().join("cat.cat");
        std::fs::write(&catalog, b"catalog").unwrap();

        struct CatalogBackend;
        #[async_trait]
        impl SignatureBackend for CatalogBackend {
            async fn signer_chain(
                &self,
                _path: &Path,
                _revocation: RevocationMode,
            ) -> Result<Vec<ChainCertificate>, SignatureBackendError> {
                Err(SignatureBackendError::NotSigned)
            }
            async fn verify_catalog(
                &self,
                _catalog: &Path,
                _file: &Path,
                _revocation: RevocationMode,
            ) -> Result<(), SignatureBackendError> {
                Ok(())
            }
        }

        let mut p = payload("p");
        p.catalog = Some("cat".to_owned());
        // Deliberately wrong hash; it must not be consulted.
        p.hash = Some(compute_bytes_digest::<Sha1>(b"other data"));

        verify_payload(&p, &path, Some(&catalog), &CatalogBackend)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_catalog_is_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("p.bin");
        std::fs::write(&path, b"data").unwrap();

        let mut p = payload("p");
        p.catalog = Some("cat".to_owned());

        assert_matches!(
            verify_payload(&p, &path, None, &UnsupportedSignatureBackend).await,
            Err(VerificationError::CatalogUnavailable(_))
        );
    }

    #[tokio::test]
    async fn test_no_method_is_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("p.bin");
        std::fs::write(&path, b"data").unwrap();

        assert_matches!(
            verify_payload(&payload("p"), &path, None, &UnsupportedSignatureBackend).await,
            Err(VerificationError::NoVerificationMethod(_))
        );
    }
}
