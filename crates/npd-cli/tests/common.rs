#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

const STUB_PNPM: &str = r#"#!/bin/sh
state_dir="$(dirname "$0")/state"
mkdir -p "$state_dir"
case "$1" in
--version)
    cat "$state_dir/../version"
    ;;
config)
    if [ "$3" = "store-dir" ]; then
        printf '%s' "$4" > "$state_dir/store-dir"
    fi
    ;;
install)
    store="$(cat "$state_dir/store-dir")"
    mkdir -p "$store/v10/files/00"
    printf 'package payload' > "$store/v10/files/00/aa"
    printf '{"checkedAt":7,"name":"pkg"}' > "$store/v10/files/00/meta.json"
    ;;
esac
exit 0
"#;

pub struct StubPnpm {
    pub bin: PathBuf,
    _dir: TempDir,
}

/// Writes a fake pnpm that fabricates a tiny store on `install`.
///
/// # Panics
/// Panics when the stub files cannot be written.
#[must_use]
pub fn stub_pnpm(version: &str) -> StubPnpm {
    let dir = tempfile::Builder::new()
        .prefix("stub-pnpm-")
        .tempdir()
        .expect("tempdir");
    let bin = dir.path().join("pnpm");
    fs::write(&bin, STUB_PNPM).expect("write stub");
    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).expect("chmod stub");
    fs::write(dir.path().join("version"), format!("{version}\n")).expect("write version");
    StubPnpm { bin, _dir: dir }
}

/// Creates a source directory holding only a lockfile.
///
/// # Panics
/// Panics when the directory or lockfile cannot be created.
#[must_use]
pub fn source_dir(lockfile_version: &str) -> TempDir {
    let dir = tempfile::Builder::new()
        .prefix("npd-src-")
        .tempdir()
        .expect("tempdir");
    fs::write(
        dir.path().join("pnpm-lock.yaml"),
        format!("lockfileVersion: '{lockfile_version}'\n"),
    )
    .expect("write lockfile");
    dir
}

#[must_use]
pub fn path_str(path: &Path) -> String {
    path.display().to_string()
}
