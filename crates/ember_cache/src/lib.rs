#![deny(missing_docs)]

//! Content-addressed acquisition, verification and caching of bundle
//! payloads and containers.
//!
//! The cache engine materializes every payload a plan references into either
//! the per-machine or per-user completed cache, or a host-supplied layout
//! directory, with content verified before final placement. Files move
//! through three areas:
//!
//! 1. a one-shot per-run *working folder* under the temporary directory,
//!    where payloads are acquired (copied from a local source or
//!    downloaded);
//! 2. the *unverified* staging area under the cache root, where ACLs are
//!    reset and the content is verified;
//! 3. the *completed* per-package folder, reached by an atomic move so a
//!    payload is either fully cached or not cached at all.
//!
//! Verification prefers an Authenticode chain pin, then a signed catalog,
//! then a SHA-1 digest; the OS signature primitives sit behind the
//! [`SignatureBackend`] seam and the Windows ACL primitives behind
//! [`AclBackend`], so the policy in this crate is testable everywhere.

mod acquire;
pub mod consts;
mod engine;
mod fsutil;
mod paths;
mod verify;

pub use acquire::{
    AcquireError, CacheProgress, DownloadError, DownloadTransport, NoDownloadTransport,
    ProgressCallback, ProgressResult, SourceSearch,
};
pub use engine::{
    AclBackend, AcquireSource, CacheEngine, CacheEngineBuilder, CacheError, CacheOutcome,
    NoopAclBackend,
};
pub use paths::{CacheLocations, WorkingFolder};
pub use verify::{
    verify_payload, ChainCertificate, RevocationMode, SignatureBackend, SignatureBackendError,
    UnsupportedSignatureBackend, VerificationError,
};
