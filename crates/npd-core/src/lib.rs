#![deny(clippy::all, warnings)]

//! Engine behind `nix-prefetch-pnpm-deps`.
//!
//! The pipeline drives `pnpm install` into a scratch store, normalizes the
//! store into a bit-deterministic form, and hashes the result (directly, or
//! wrapped in a reproducible tarball) into an SRI string for consumption by
//! a fixed-output derivation.

mod core;

pub mod api;

pub use crate::api::{run_prefetch, PrefetchError, PrefetchOptions, RunEnvironment};
pub use crate::core::effects::{
    walk, DirEntry, FileKind, FileMeta, FileSystem, MemoryFileSystem, OsFileSystem, ScratchDir,
    WalkEntry,
};
pub use crate::core::pnpm::{InstallOptions, Pnpm, PnpmError};
pub use crate::core::store::{
    hash_tree, normalize, write_archive, StoreError, STORE_TARBALL_NAME, VERSION_MARKER_NAME,
};
