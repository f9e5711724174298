use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Hashing scheme selector surfaced to the caller.
///
/// Advancing the version changes the hash of unchanged inputs, so every
/// consumer pins one explicitly:
///
/// - `V1` hashes the normalized store as-is.
/// - `V2` adds a `.fetcher-version` marker and fixes permissions.
/// - `V3` wraps the store in a reproducible `pnpm-store.tar.zst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetcherVersion {
    V1,
    V2,
    V3,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{value:?} is not a valid fetcher version (expected 1, 2, or 3)")]
pub struct InvalidFetcherVersion {
    pub value: String,
}

impl FetcherVersion {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Whether a `.fetcher-version` marker participates in the hash.
    #[must_use]
    pub fn writes_marker(self) -> bool {
        self >= Self::V2
    }

    /// Whether the store's file and directory modes are forced to the
    /// fixed 0o555/0o444 layout before hashing.
    #[must_use]
    pub fn fixes_permissions(self) -> bool {
        self >= Self::V2
    }

    /// Whether the hashed tree is a sidecar directory holding a
    /// deterministic tarball instead of the store itself.
    #[must_use]
    pub fn wraps_tarball(self) -> bool {
        self == Self::V3
    }

    /// Marker file payload: the decimal version and a newline.
    #[must_use]
    pub fn marker_contents(self) -> String {
        format!("{}\n", self.as_u8())
    }
}

impl fmt::Display for FetcherVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl TryFrom<i64> for FetcherVersion {
    type Error = InvalidFetcherVersion;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(InvalidFetcherVersion {
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for FetcherVersion {
    type Err = InvalidFetcherVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s.trim().parse().map_err(|_| InvalidFetcherVersion {
            value: s.to_string(),
        })?;
        Self::try_from(value)
    }
}
