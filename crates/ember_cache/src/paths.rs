//! The cache path model: per-user and per-machine roots, the unverified
//! staging area, completed bundle and package folders, and the one-shot
//! per-bundle working folder.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::consts::{PACKAGE_CACHE_FOLDER_NAME, UNVERIFIED_FOLDER_NAME};

/// Resolved cache roots. The per-machine root may be redirected by
/// administrative policy; when it is, the default location is still consulted
/// for lookups so bundles cached before the redirect remain findable.
#[derive(Debug, Clone)]
pub struct CacheLocations {
    per_user_root: PathBuf,
    per_machine_root: PathBuf,
    per_machine_fallback_root: Option<PathBuf>,
}

impl CacheLocations {
    /// Resolves the roots from the running user's environment, honoring an
    /// optional policy redirect of the per-machine root.
    pub fn from_system(policy_redirect: Option<PathBuf>) -> Self {
        let per_user_base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        let per_machine_base = std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/cache"));

        let default_per_machine = per_machine_base.join(PACKAGE_CACHE_FOLDER_NAME);
        let (per_machine_root, per_machine_fallback_root) = match policy_redirect {
            Some(redirect) => (
                redirect.join(PACKAGE_CACHE_FOLDER_NAME),
                Some(default_per_machine),
            ),
            None => (default_per_machine, None),
        };

        Self {
            per_user_root: per_user_base.join(PACKAGE_CACHE_FOLDER_NAME),
            per_machine_root,
            per_machine_fallback_root,
        }
    }

    /// Builds locations with explicit roots. Used by tests and embedded
    /// hosts.
    pub fn with_roots(per_user_root: PathBuf, per_machine_root: PathBuf) -> Self {
        Self {
            per_user_root,
            per_machine_root,
            per_machine_fallback_root: None,
        }
    }

    /// The cache root for the given scope.
    pub fn root(&self, per_machine: bool) -> &Path {
        if per_machine {
            &self.per_machine_root
        } else {
            &self.per_user_root
        }
    }

    /// The staging folder where files wait for verification.
    pub fn unverified_folder(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join(UNVERIFIED_FOLDER_NAME)
    }

    /// The staging path of one payload, named by its id.
    pub fn unverified_path(&self, per_machine: bool, payload_id: &str) -> PathBuf {
        self.unverified_folder(per_machine).join(payload_id)
    }

    /// The completed folder of a package.
    pub fn completed_package_folder(&self, per_machine: bool, cache_id: &str) -> PathBuf {
        self.root(per_machine).join(cache_id)
    }

    /// The completed folder of the bundle itself, holding the bundle
    /// executable and external host-application payloads.
    pub fn completed_bundle_folder(&self, per_machine: bool, bundle_id: &str) -> PathBuf {
        self.root(per_machine).join(bundle_id)
    }

    /// Finds an existing completed package folder, consulting the redirected
    /// root first and falling back to the pre-redirect default so previously
    /// cached packages remain findable.
    pub fn find_completed_package_folder(
        &self,
        per_machine: bool,
        cache_id: &str,
    ) -> Option<PathBuf> {
        let primary = self.completed_package_folder(per_machine, cache_id);
        if primary.is_dir() {
            return Some(primary);
        }
        if per_machine {
            if let Some(fallback) = &self.per_machine_fallback_root {
                let candidate = fallback.join(cache_id);
                if candidate.is_dir() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// The one-shot scratch folder of a single engine run, created under the
/// temporary directory on first use and removed recursively when the apply
/// finishes.
#[derive(Debug)]
pub struct WorkingFolder {
    path: PathBuf,
}

impl Default for WorkingFolder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkingFolder {
    /// Picks a fresh working folder path. Nothing is created until
    /// [`WorkingFolder::ensure`] runs.
    pub fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(Uuid::new_v4().to_string()),
        }
    }

    /// A working folder at an explicit location.
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// The folder path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The working path of one payload inside this folder.
    pub fn payload_path(&self, payload_id: &str) -> PathBuf {
        self.path.join(payload_id)
    }

    /// Creates the folder if it does not exist yet.
    pub async fn ensure(&self) -> std::io::Result<&Path> {
        fs_err::tokio::create_dir_all(&self.path).await?;
        Ok(&self.path)
    }
}
