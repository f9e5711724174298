use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use npd_domain::{major_version, FetcherVersion, Lockfile, LockfileError};

use crate::core::effects::{FileSystem, ScratchDir};
use crate::core::pnpm::{InstallOptions, Pnpm, PnpmError};
use crate::core::store::{
    hash_tree, normalize, write_archive, StoreError, STORE_TARBALL_NAME, VERSION_MARKER_NAME,
};
use crate::core::tooling::progress::StepReporter;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PrefetchError {
    #[error(transparent)]
    Lockfile(#[from] LockfileError),
    #[error(transparent)]
    Pnpm(#[from] PnpmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("lockfile version {lockfile} is newer than the installed pnpm {pnpm}")]
    LockfileTooNew { lockfile: String, pnpm: String },
    #[error("hash mismatch\nexpected: {expected}\ngot:      {got}")]
    HashMismatch { expected: String, got: String },
    #[error("{message}")]
    Setup {
        message: String,
        #[source]
        source: Cause,
    },
}

impl PrefetchError {
    fn setup(message: impl Into<String>, source: impl Into<Cause>) -> Self {
        Self::Setup {
            message: message.into(),
            source: source.into(),
        }
    }
}

/// Process environment captured once at orchestrator entry; nothing else
/// in the call graph reads environment variables.
#[derive(Debug, Clone, Default)]
pub struct RunEnvironment {
    /// Pre-split `PATH` entries, searched for `pnpm` when no explicit path
    /// is given.
    pub path_entries: Vec<String>,
    /// `NIX_NPM_REGISTRY`, forwarded to `pnpm install` when set.
    pub registry: Option<String>,
}

impl RunEnvironment {
    #[must_use]
    pub fn capture() -> Self {
        let path_entries = env::var("PATH")
            .map(|path| path.split(':').map(str::to_string).collect())
            .unwrap_or_default();
        let registry = env::var("NIX_NPM_REGISTRY").ok().filter(|url| !url.is_empty());
        Self {
            path_entries,
            registry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrefetchOptions {
    /// Directory containing `pnpm-lock.yaml`.
    pub src_dir: PathBuf,
    pub fetcher_version: FetcherVersion,
    /// Explicit pnpm binary; otherwise `PATH` is searched.
    pub pnpm_path: Option<PathBuf>,
    /// `--filter=<value>` per entry.
    pub workspaces: Vec<String>,
    /// Extra flags passed to `pnpm install` verbatim.
    pub pnpm_flags: Vec<String>,
    /// Shell commands run in the source directory before install.
    pub pre_install_commands: Vec<String>,
    /// Expected SRI hash; a differing result fails the run.
    pub expected_hash: Option<String>,
}

/// Drive the full pipeline: load the lockfile, resolve pnpm, populate a
/// scratch store, normalize it, and hash the fetcher-version-specific
/// hash input. Returns the SRI string.
///
/// Every scratch directory is removed on every exit path.
///
/// # Errors
///
/// Propagates the typed error of whichever stage failed; nothing is
/// retried or swallowed.
pub fn run_prefetch(
    fs: &dyn FileSystem,
    environment: &RunEnvironment,
    opts: &PrefetchOptions,
) -> Result<String, PrefetchError> {
    let lockfile_path = opts.src_dir.join("pnpm-lock.yaml");
    let lockfile = load_lockfile(fs, &lockfile_path)?;
    debug!(version = %lockfile.lockfile_version, "loaded lockfile");

    let pnpm = match &opts.pnpm_path {
        Some(path) => Pnpm::new(fs, path)?,
        None => Pnpm::locate(fs, &environment.path_entries)?,
    };

    let pnpm_version = pnpm.version()?;
    check_lockfile_guard(&lockfile, &pnpm_version)?;

    let store = ScratchDir::create(fs, "pnpm-store-")
        .map_err(|err| PrefetchError::setup("failed to create scratch store directory", err))?;

    {
        let step = StepReporter::start("running pnpm install");
        pnpm.install(&InstallOptions {
            store_dir: store.path(),
            working_dir: &opts.src_dir,
            registry: environment.registry.as_deref(),
            workspaces: &opts.workspaces,
            extra_flags: &opts.pnpm_flags,
            pre_install_commands: &opts.pre_install_commands,
        })?;
        step.finish("pnpm install finished");
    }

    let hash = hash_store(fs, store.path(), opts.fetcher_version)?;
    info!(%hash, "store hashed");

    if let Some(expected) = &opts.expected_hash {
        if expected != &hash {
            return Err(PrefetchError::HashMismatch {
                expected: expected.clone(),
                got: hash,
            });
        }
    }

    Ok(hash)
}

/// Assemble the hash input for a populated store and hash it.
///
/// - v1: normalize, then hash the store directly.
/// - v2: write the marker *before* normalization (the permission pass must
///   also sweep it), normalize, hash the store.
/// - v3: normalize, then hash a sidecar directory holding the marker and
///   the reproducible tarball.
pub(crate) fn hash_store(
    fs: &dyn FileSystem,
    store_path: &Path,
    version: FetcherVersion,
) -> Result<String, PrefetchError> {
    if version.writes_marker() && !version.wraps_tarball() {
        write_marker(fs, store_path, version)?;
    }

    {
        let step = StepReporter::start("normalizing pnpm store");
        normalize(fs, store_path, version)?;
        step.finish("store normalized");
    }

    if !version.wraps_tarball() {
        let step = StepReporter::start("hashing store");
        let hash = hash_tree(fs, store_path)?;
        step.finish("store hashed");
        return Ok(hash);
    }

    let sidecar = ScratchDir::create(fs, "pnpm-tarball-")
        .map_err(|err| PrefetchError::setup("failed to create tarball output directory", err))?;
    write_marker(fs, sidecar.path(), version)?;
    {
        let step = StepReporter::start("creating reproducible tarball");
        write_archive(fs, store_path, &sidecar.path().join(STORE_TARBALL_NAME))?;
        step.finish("tarball created");
    }

    let step = StepReporter::start("hashing tarball");
    let hash = hash_tree(fs, sidecar.path())?;
    step.finish("tarball hashed");
    Ok(hash)
}

fn write_marker(
    fs: &dyn FileSystem,
    dir: &Path,
    version: FetcherVersion,
) -> Result<(), PrefetchError> {
    let path = dir.join(VERSION_MARKER_NAME);
    fs.write(&path, version.marker_contents().as_bytes())
        .map_err(|err| PrefetchError::setup("failed to write fetcher-version marker", err))?;
    fs.set_permissions(&path, 0o444)
        .map_err(|err| PrefetchError::setup("failed to write fetcher-version marker", err))
}

fn load_lockfile(fs: &dyn FileSystem, path: &Path) -> Result<Lockfile, LockfileError> {
    let meta = match fs.metadata(path) {
        Ok(meta) => meta,
        Err(err) => return Err(LockfileError::not_found("", Some(err.into()))),
    };
    if meta.is_dir() {
        return Err(LockfileError::failed_to_load("path is a directory", None));
    }
    let data = fs
        .read(path)
        .map_err(|err| LockfileError::failed_to_load("", Some(err.into())))?;
    Lockfile::parse(&data)
}

/// A lockfile newer than the installed pnpm cannot be installed with
/// `--frozen-lockfile`; fail before any subprocess work.
fn check_lockfile_guard(lockfile: &Lockfile, pnpm_version: &str) -> Result<(), PrefetchError> {
    let pnpm_major = major_version(pnpm_version).map_err(|err| PnpmError::FailedToParse {
        message: format!("invalid pnpm version format: {}", pnpm_version.trim()),
        source: Some(Box::new(err)),
    })?;
    let lockfile_major = lockfile.major_version()?;
    if lockfile_major > pnpm_major {
        return Err(PrefetchError::LockfileTooNew {
            lockfile: lockfile.lockfile_version.clone(),
            pnpm: pnpm_version.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::effects::MemoryFileSystem;

    fn seeded_store() -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        fs.add_file(
            "/scratch/store/v10/files/00/aa",
            0o644,
            b"package payload",
        )
        .unwrap();
        fs.add_file(
            "/scratch/store/v10/index.json",
            0o644,
            br#"{"files":{"checkedAt":1}}"#,
        )
        .unwrap();
        fs
    }

    #[test]
    fn lockfile_guard_rejects_newer_lockfile() {
        let lockfile = Lockfile {
            lockfile_version: "9.0".to_string(),
        };
        let err = check_lockfile_guard(&lockfile, "8.15.4\n").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("9.0"), "missing lockfile version: {message}");
        assert!(message.contains("8.15.4"), "missing pnpm version: {message}");
    }

    #[test]
    fn lockfile_guard_accepts_equal_major() {
        let lockfile = Lockfile {
            lockfile_version: "9.0".to_string(),
        };
        check_lockfile_guard(&lockfile, "9.12.0\n").unwrap();
    }

    #[test]
    fn lockfile_guard_accepts_older_lockfile() {
        let lockfile = Lockfile {
            lockfile_version: "6.0".to_string(),
        };
        check_lockfile_guard(&lockfile, "10.4.1\n").unwrap();
    }

    #[test]
    fn load_lockfile_distinguishes_missing_from_directory() {
        let fs = MemoryFileSystem::new();
        fs.create_dir_all(Path::new("/src/pnpm-lock.yaml")).unwrap();

        let err = load_lockfile(&fs, Path::new("/src/pnpm-lock.yaml")).unwrap_err();
        assert!(matches!(err, LockfileError::FailedToLoad { .. }));

        let err = load_lockfile(&fs, Path::new("/elsewhere/pnpm-lock.yaml")).unwrap_err();
        assert!(matches!(err, LockfileError::NotFound { .. }));
    }

    #[test]
    fn load_lockfile_parses_a_real_file() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/src/pnpm-lock.yaml", 0o644, b"lockfileVersion: '9.0'\n")
            .unwrap();
        let lockfile = load_lockfile(&fs, Path::new("/src/pnpm-lock.yaml")).unwrap();
        assert_eq!(lockfile.lockfile_version, "9.0");
    }

    #[test]
    fn v2_marker_is_swept_by_the_permission_pass() {
        let fs = seeded_store();
        hash_store(&fs, Path::new("/scratch/store"), FetcherVersion::V2).unwrap();

        let marker = fs
            .symlink_metadata(Path::new("/scratch/store/.fetcher-version"))
            .unwrap();
        assert_eq!(marker.perm(), 0o444);
        assert_eq!(
            fs.read(Path::new("/scratch/store/.fetcher-version")).unwrap(),
            b"2\n"
        );
    }

    #[test]
    fn marker_changes_the_hash() {
        let with_marker =
            hash_store(&seeded_store(), Path::new("/scratch/store"), FetcherVersion::V2).unwrap();
        let without_marker =
            hash_store(&seeded_store(), Path::new("/scratch/store"), FetcherVersion::V1).unwrap();
        assert_ne!(with_marker, without_marker);
    }

    #[test]
    fn each_fetcher_version_is_deterministic() {
        for version in [
            FetcherVersion::V1,
            FetcherVersion::V2,
            FetcherVersion::V3,
        ] {
            let first =
                hash_store(&seeded_store(), Path::new("/scratch/store"), version).unwrap();
            let second =
                hash_store(&seeded_store(), Path::new("/scratch/store"), version).unwrap();
            assert_eq!(first, second, "nondeterministic hash for {version}");
        }
    }

    #[test]
    fn fetcher_versions_produce_distinct_hashes() {
        let v1 = hash_store(&seeded_store(), Path::new("/scratch/store"), FetcherVersion::V1)
            .unwrap();
        let v2 = hash_store(&seeded_store(), Path::new("/scratch/store"), FetcherVersion::V2)
            .unwrap();
        let v3 = hash_store(&seeded_store(), Path::new("/scratch/store"), FetcherVersion::V3)
            .unwrap();
        assert_ne!(v1, v2);
        assert_ne!(v2, v3);
        assert_ne!(v1, v3);
    }

    #[test]
    fn v3_sidecar_is_removed_after_hashing() {
        let fs = seeded_store();
        hash_store(&fs, Path::new("/scratch/store"), FetcherVersion::V3).unwrap();
        // The sidecar scratch dir lives under /tmp in the memory tree and
        // is dropped before hash_store returns.
        let leftovers = fs.read_dir(Path::new("/tmp")).unwrap();
        assert!(leftovers.is_empty(), "sidecar leaked: {leftovers:?}");
    }

    #[test]
    fn expected_hash_comparison_formats_both_values() {
        let err = PrefetchError::HashMismatch {
            expected: "sha256-expected".to_string(),
            got: "sha256-got".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("expected: sha256-expected"));
        assert!(rendered.contains("got:      sha256-got"));
    }
}
