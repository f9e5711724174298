use serde::Deserialize;
use thiserror::Error;

use crate::semver::{major_version, VersionParseError};

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum LockfileError {
    #[error("pnpm-lock.yaml not found{}", fmt_detail(.message))]
    NotFound {
        message: String,
        #[source]
        source: Option<Cause>,
    },
    #[error("failed to load pnpm-lock.yaml{}", fmt_detail(.message))]
    FailedToLoad {
        message: String,
        #[source]
        source: Option<Cause>,
    },
    #[error("failed to parse pnpm-lock.yaml{}", fmt_detail(.message))]
    FailedToParse {
        message: String,
        #[source]
        source: Option<Cause>,
    },
}

fn fmt_detail(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {message}")
    }
}

impl LockfileError {
    pub fn not_found(message: impl Into<String>, source: Option<Cause>) -> Self {
        Self::NotFound {
            message: message.into(),
            source,
        }
    }

    pub fn failed_to_load(message: impl Into<String>, source: Option<Cause>) -> Self {
        Self::FailedToLoad {
            message: message.into(),
            source,
        }
    }

    pub fn failed_to_parse(message: impl Into<String>, source: Option<Cause>) -> Self {
        Self::FailedToParse {
            message: message.into(),
            source,
        }
    }
}

/// The single field of a pnpm lockfile this tool cares about. Everything
/// else (importers, packages, settings) is irrelevant to store hashing and
/// is left unparsed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub lockfile_version: String,
}

impl Lockfile {
    /// Parse lockfile bytes as YAML.
    ///
    /// # Errors
    ///
    /// Returns `FailedToParse` when the document is not valid YAML or the
    /// `lockfileVersion` key is missing.
    pub fn parse(data: &[u8]) -> Result<Self, LockfileError> {
        serde_yaml::from_slice(data)
            .map_err(|err| LockfileError::failed_to_parse("", Some(Box::new(err))))
    }

    /// Major component of `lockfileVersion`.
    ///
    /// # Errors
    ///
    /// Returns `FailedToParse` when the recorded version is not
    /// `major.minor[.patch]` shaped.
    pub fn major_version(&self) -> Result<u64, LockfileError> {
        major_version(&self.lockfile_version).map_err(|err: VersionParseError| {
            LockfileError::failed_to_parse(
                format!("invalid lockfile version format: {}", self.lockfile_version),
                Some(Box::new(err)),
            )
        })
    }
}
