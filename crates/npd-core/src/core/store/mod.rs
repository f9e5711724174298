mod nar;
mod normalize;
mod tarball;
mod tarwriter;
mod zstd_writer;

use std::path::PathBuf;

use thiserror::Error;

pub use nar::hash_tree;
pub use normalize::normalize;
pub use tarball::write_archive;

pub(crate) use tarwriter::{GnuTarWriter, TarEntryInfo, TAR_TYPE_DIR, TAR_TYPE_FILE, TAR_TYPE_SYMLINK};
pub(crate) use zstd_writer::ZstdWriter;

/// Store layout version directories pnpm is known to create
/// (`v3` for pnpm 9.x, `v10` for pnpm 10.x).
pub(crate) const STORE_VERSION_DIRS: [&str; 2] = ["v3", "v10"];

/// Marker file name recording the fetcher version inside the hashed tree.
pub const VERSION_MARKER_NAME: &str = ".fetcher-version";

/// Name of the reproducible tarball emitted for fetcher version 3.
pub const STORE_TARBALL_NAME: &str = "pnpm-store.tar.zst";

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum StoreError {
    #[error("failed to clean up {path}")]
    FailedToCleanup {
        path: PathBuf,
        #[source]
        source: Option<Cause>,
    },
    #[error("failed to normalize JSON file {path}")]
    FailedToNormalizeJson {
        path: PathBuf,
        #[source]
        source: Option<Cause>,
    },
    #[error("failed to set permissions on {path}")]
    FailedToSetPermissions {
        path: PathBuf,
        #[source]
        source: Option<Cause>,
    },
    #[error("failed to hash {path}")]
    FailedToHash {
        path: PathBuf,
        #[source]
        source: Option<Cause>,
    },
    #[error("failed to create tarball for {path}")]
    FailedToCreateTarball {
        path: PathBuf,
        #[source]
        source: Option<Cause>,
    },
}

impl StoreError {
    pub(crate) fn cleanup(path: impl Into<PathBuf>, cause: impl Into<Cause>) -> Self {
        Self::FailedToCleanup {
            path: path.into(),
            source: Some(cause.into()),
        }
    }

    pub(crate) fn normalize_json(path: impl Into<PathBuf>, cause: impl Into<Cause>) -> Self {
        Self::FailedToNormalizeJson {
            path: path.into(),
            source: Some(cause.into()),
        }
    }

    pub(crate) fn permissions(path: impl Into<PathBuf>, cause: impl Into<Cause>) -> Self {
        Self::FailedToSetPermissions {
            path: path.into(),
            source: Some(cause.into()),
        }
    }

    pub(crate) fn hash(path: impl Into<PathBuf>, cause: impl Into<Cause>) -> Self {
        Self::FailedToHash {
            path: path.into(),
            source: Some(cause.into()),
        }
    }

    pub(crate) fn tarball(path: impl Into<PathBuf>, cause: impl Into<Cause>) -> Self {
        Self::FailedToCreateTarball {
            path: path.into(),
            source: Some(cause.into()),
        }
    }
}
