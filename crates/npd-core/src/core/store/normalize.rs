use std::path::Path;

use serde_json::Value;
use tracing::debug;

use npd_domain::FetcherVersion;

use crate::core::effects::{walk, FileSystem};

use super::{StoreError, STORE_VERSION_DIRS};

/// Make a pnpm store bit-deterministic across independent installs.
///
/// Four strictly ordered passes:
///
/// 1. remove `<store>/{v3,v10}/tmp` (unfinished extraction sidecars),
/// 2. canonicalize every `*.json` file,
/// 3. remove `<store>/{v3,v10}/projects` (symlink farms encoding host
///    paths),
/// 4. for fetcher v2+, force directory modes to 0o555 and file modes to
///    0o444 (0o555 for `*-exec` files).
///
/// Symlinks are preserved untouched: never rewritten, never followed.
///
/// # Errors
///
/// The first failing pass aborts with the matching `StoreError` variant;
/// a missing `tmp`/`projects` directory is not a failure.
pub fn normalize(
    fs: &dyn FileSystem,
    store_path: &Path,
    fetcher_version: FetcherVersion,
) -> Result<(), StoreError> {
    for dir in STORE_VERSION_DIRS {
        let tmp = store_path.join(dir).join("tmp");
        fs.remove_dir_all(&tmp)
            .map_err(|err| StoreError::cleanup(&tmp, err))?;
    }

    normalize_json_files(fs, store_path)?;

    for dir in STORE_VERSION_DIRS {
        let projects = store_path.join(dir).join("projects");
        fs.remove_dir_all(&projects)
            .map_err(|err| StoreError::cleanup(&projects, err))?;
    }

    if fetcher_version.fixes_permissions() {
        set_permissions(fs, store_path)?;
    }

    Ok(())
}

fn normalize_json_files(fs: &dyn FileSystem, store_path: &Path) -> Result<(), StoreError> {
    let entries =
        walk(fs, store_path).map_err(|err| StoreError::normalize_json(store_path, err))?;
    for entry in entries {
        if !entry.meta.is_file() || !entry.path.to_string_lossy().ends_with(".json") {
            continue;
        }
        normalize_json_file(fs, &entry.path)?;
    }
    Ok(())
}

/// Canonicalize one JSON file in place.
///
/// pnpm writes metadata with nondeterministic key order and `checkedAt`
/// timestamps that change on every install. The canonical form strips
/// every `checkedAt` key at any depth and re-emits with sorted keys,
/// two-space indentation and a trailing newline. Number literals pass
/// through verbatim and `<`, `>`, `&` stay unescaped, matching what a
/// `jq` round-trip produces. The file keeps its permission bits.
fn normalize_json_file(fs: &dyn FileSystem, path: &Path) -> Result<(), StoreError> {
    let data = fs
        .read(path)
        .map_err(|err| StoreError::normalize_json(path, err))?;

    let value: Value = serde_json::from_slice(&data)
        .map_err(|err| StoreError::normalize_json(path, err))?;
    let value = remove_checked_at(value);

    let mut out = serde_json::to_vec_pretty(&value)
        .map_err(|err| StoreError::normalize_json(path, err))?;
    out.push(b'\n');

    fs.write(path, &out)
        .map_err(|err| StoreError::normalize_json(path, err))
}

fn remove_checked_at(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| key != "checkedAt")
                .map(|(key, value)| (key, remove_checked_at(value)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(remove_checked_at).collect())
        }
        other => other,
    }
}

fn set_permissions(fs: &dyn FileSystem, store_path: &Path) -> Result<(), StoreError> {
    let entries = walk(fs, store_path).map_err(|err| StoreError::permissions(store_path, err))?;
    for entry in entries {
        let mode = if entry.meta.is_dir() {
            0o555
        } else if entry.meta.is_symlink() {
            // chmod would affect the target, not the link.
            debug!(path = %entry.path.display(), "leaving symlink mode untouched");
            continue;
        } else if entry
            .path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().ends_with("-exec"))
        {
            0o555
        } else {
            0o444
        };
        fs.set_permissions(&entry.path, mode)
            .map_err(|err| StoreError::permissions(&entry.path, err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::effects::MemoryFileSystem;

    fn store_with(files: &[(&str, &str)]) -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        fs.create_dir_all(Path::new("/store")).unwrap();
        for (path, contents) in files {
            fs.add_file(path, 0o644, contents.as_bytes()).unwrap();
        }
        fs
    }

    #[test]
    fn canonicalizes_keys_and_strips_checked_at() {
        let fs = store_with(&[(
            "/store/v3/pkg.json",
            r#"{"z":1,"a":2,"nested":{"checkedAt":123,"b":3},"checkedAt":456}"#,
        )]);
        normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap();

        let got = fs.read(Path::new("/store/v3/pkg.json")).unwrap();
        assert_eq!(
            String::from_utf8(got).unwrap(),
            "{\n  \"a\": 2,\n  \"nested\": {\n    \"b\": 3\n  },\n  \"z\": 1\n}\n"
        );
    }

    #[test]
    fn strips_checked_at_inside_arrays() {
        let fs = store_with(&[(
            "/store/v10/index.json",
            r#"{"files":[{"checkedAt":1,"mode":420},{"size":2}]}"#,
        )]);
        normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap();

        let got = fs.read(Path::new("/store/v10/index.json")).unwrap();
        let text = String::from_utf8(got).unwrap();
        assert!(!text.contains("checkedAt"));
        assert!(text.contains("\"mode\": 420"));
    }

    #[test]
    fn preserves_number_literals_verbatim() {
        let fs = store_with(&[(
            "/store/v3/meta.json",
            r#"{"size":1.50,"big":10000000000000000001}"#,
        )]);
        normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap();

        let text =
            String::from_utf8(fs.read(Path::new("/store/v3/meta.json")).unwrap()).unwrap();
        assert!(text.contains("1.50"), "float literal rewritten: {text}");
        assert!(text.contains("10000000000000000001"), "u128-sized literal rewritten: {text}");
    }

    #[test]
    fn normalization_is_idempotent() {
        let fs = store_with(&[(
            "/store/v3/pkg.json",
            r#"{"z":1,"a":{"checkedAt":9,"k":[1,2]},"checkedAt":3}"#,
        )]);
        normalize(&fs, Path::new("/store"), FetcherVersion::V2).unwrap();
        let first = fs.read(Path::new("/store/v3/pkg.json")).unwrap();
        normalize(&fs, Path::new("/store"), FetcherVersion::V2).unwrap();
        let second = fs.read(Path::new("/store/v3/pkg.json")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn removes_tmp_and_projects_in_both_layout_versions() {
        let fs = store_with(&[
            ("/store/v3/tmp/partial", "x"),
            ("/store/v3/projects/host/link.json", "{}"),
            ("/store/v10/tmp/partial", "x"),
            ("/store/v10/projects/host/link.json", "{}"),
            ("/store/v3/files/00/aa", "payload"),
        ]);
        normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap();

        assert!(fs.symlink_metadata(Path::new("/store/v3/tmp")).is_err());
        assert!(fs.symlink_metadata(Path::new("/store/v3/projects")).is_err());
        assert!(fs.symlink_metadata(Path::new("/store/v10/tmp")).is_err());
        assert!(fs.symlink_metadata(Path::new("/store/v10/projects")).is_err());
        assert!(fs.symlink_metadata(Path::new("/store/v3/files/00/aa")).is_ok());
    }

    #[test]
    fn missing_tmp_and_projects_are_not_errors() {
        let fs = store_with(&[("/store/v3/files/00/aa", "payload")]);
        normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap();
    }

    #[test]
    fn corrupt_json_is_a_hard_failure() {
        let fs = store_with(&[("/store/v3/broken.json", "{not json")]);
        let err = normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap_err();
        assert!(matches!(err, StoreError::FailedToNormalizeJson { .. }));
    }

    #[test]
    fn json_pass_runs_before_projects_cleanup() {
        // A corrupt JSON under projects/ still fails the run: the JSON
        // pass completes before the projects directories are removed.
        let fs = store_with(&[("/store/v3/projects/host/broken.json", "{not json")]);
        let err = normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap_err();
        assert!(matches!(err, StoreError::FailedToNormalizeJson { .. }));
    }

    #[test]
    fn v2_fixes_permissions() {
        let fs = store_with(&[
            ("/store/v3/files/00/data", "d"),
            ("/store/v3/files/00/tool-exec", "t"),
        ]);
        fs.set_permissions(Path::new("/store/v3/files/00/data"), 0o777)
            .unwrap();
        normalize(&fs, Path::new("/store"), FetcherVersion::V2).unwrap();

        let dir = fs.symlink_metadata(Path::new("/store/v3/files")).unwrap();
        assert_eq!(dir.perm(), 0o555);
        let data = fs
            .symlink_metadata(Path::new("/store/v3/files/00/data"))
            .unwrap();
        assert_eq!(data.perm(), 0o444);
        let exec = fs
            .symlink_metadata(Path::new("/store/v3/files/00/tool-exec"))
            .unwrap();
        assert_eq!(exec.perm(), 0o555);
    }

    #[test]
    fn v1_leaves_permissions_alone() {
        let fs = store_with(&[("/store/v3/files/00/data", "d")]);
        fs.set_permissions(Path::new("/store/v3/files/00/data"), 0o600)
            .unwrap();
        normalize(&fs, Path::new("/store"), FetcherVersion::V1).unwrap();
        let data = fs
            .symlink_metadata(Path::new("/store/v3/files/00/data"))
            .unwrap();
        assert_eq!(data.perm(), 0o600);
    }

    #[test]
    fn permission_pass_skips_symlinks() {
        let fs = store_with(&[("/store/v3/files/00/data", "d")]);
        fs.add_symlink("/store/v3/link", "/store/v3/files/00/data")
            .unwrap();
        normalize(&fs, Path::new("/store"), FetcherVersion::V2).unwrap();

        // Target got the regular-file sweep, link stayed a link.
        let target = fs
            .symlink_metadata(Path::new("/store/v3/files/00/data"))
            .unwrap();
        assert_eq!(target.perm(), 0o444);
        let link = fs.symlink_metadata(Path::new("/store/v3/link")).unwrap();
        assert!(link.is_symlink());
    }
}
