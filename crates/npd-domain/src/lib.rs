#![deny(clippy::all, warnings)]

//! Pure domain types for the pnpm dependency prefetcher: the lockfile
//! model, fetcher-version selection, and the small parsing helpers shared
//! by the engine and the CLI. No I/O happens in this crate.

mod fetcher;
mod lockfile;
mod paths;
mod semver;

pub use fetcher::{FetcherVersion, InvalidFetcherVersion};
pub use lockfile::{Lockfile, LockfileError};
pub use paths::is_path_entry;
pub use semver::{major_version, VersionParseError};
