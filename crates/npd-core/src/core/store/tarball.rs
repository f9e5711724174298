use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::effects::{walk, FileMeta, FileSystem};

use super::{
    GnuTarWriter, StoreError, TarEntryInfo, ZstdWriter, TAR_TYPE_DIR, TAR_TYPE_FILE,
    TAR_TYPE_SYMLINK,
};

/// All archive mtimes are pinned to 1980-01-01 00:00:00 UTC, the
/// SOURCE_DATE_EPOCH convention for reproducible builds.
const SOURCE_DATE_EPOCH: u64 = 315532800;

struct ArchiveEntry {
    rel: String,
    path: PathBuf,
    meta: FileMeta,
}

/// Write a reproducible zstd-compressed tarball of `store_path` to
/// `output_path`, byte-identical to
///
/// ```text
/// tar --sort=name --mtime="@315532800" --owner=0 --group=0 --numeric-owner \
///   --pax-option=exthdr.name=%d/PaxHeaders/%f,delete=atime,delete=ctime \
///   --zstd -cf - -C <store_path> .
/// ```
///
/// # Errors
///
/// Any walk, open, read, or write failure surfaces as
/// `FailedToCreateTarball` with the offending path.
pub fn write_archive(
    fs: &dyn FileSystem,
    store_path: &Path,
    output_path: &Path,
) -> Result<(), StoreError> {
    let entries = collect_sorted_entries(fs, store_path)?;

    let out = fs
        .create(output_path)
        .map_err(|err| StoreError::tarball(output_path, err))?;
    let zstd = ZstdWriter::new(out).map_err(|err| StoreError::tarball(output_path, err))?;
    let mut tar = GnuTarWriter::new(zstd);

    for entry in &entries {
        write_store_entry(fs, &mut tar, entry)?;
    }

    tar.close()
        .map_err(|err| StoreError::tarball(output_path, err))?;
    let zstd = tar.into_inner();
    let mut out = zstd
        .finish()
        .map_err(|err| StoreError::tarball(output_path, err))?;
    out.flush()
        .map_err(|err| StoreError::tarball(output_path, err))
}

/// Walk the store and sort every entry (the root included) by relative
/// POSIX path, byte-wise. `--sort=name` ordering falls out of comparing
/// the `/`-separated relative paths as plain bytes.
fn collect_sorted_entries(
    fs: &dyn FileSystem,
    store_path: &Path,
) -> Result<Vec<ArchiveEntry>, StoreError> {
    let walked = walk(fs, store_path).map_err(|err| StoreError::tarball(store_path, err))?;

    let mut entries = Vec::with_capacity(walked.len());
    for entry in walked {
        let rel = if entry.path == store_path {
            ".".to_string()
        } else {
            let rel = entry
                .path
                .strip_prefix(store_path)
                .map_err(|err| StoreError::tarball(&entry.path, err))?;
            rel.to_str()
                .ok_or_else(|| {
                    StoreError::tarball(
                        &entry.path,
                        std::io::Error::other("non-UTF-8 path in store"),
                    )
                })?
                .to_string()
        };
        entries.push(ArchiveEntry {
            rel,
            path: entry.path,
            meta: entry.meta,
        });
    }

    entries.sort_by(|a, b| a.rel.as_bytes().cmp(b.rel.as_bytes()));
    Ok(entries)
}

fn entry_tar_path(entry: &ArchiveEntry) -> String {
    if entry.rel == "." {
        return "./".to_string();
    }
    let mut path = format!("./{}", entry.rel);
    if entry.meta.is_dir() && !path.ends_with('/') {
        path.push('/');
    }
    path
}

fn write_store_entry<W: std::io::Write>(
    fs: &dyn FileSystem,
    tar: &mut GnuTarWriter<W>,
    entry: &ArchiveEntry,
) -> Result<(), StoreError> {
    let (typeflag, linkname) = if entry.meta.is_dir() {
        (TAR_TYPE_DIR, String::new())
    } else if entry.meta.is_symlink() {
        let target = fs
            .read_link(&entry.path)
            .map_err(|err| StoreError::tarball(&entry.path, err))?;
        let target = target
            .to_str()
            .ok_or_else(|| {
                StoreError::tarball(
                    &entry.path,
                    std::io::Error::other("non-UTF-8 symlink target in store"),
                )
            })?
            .to_string();
        (TAR_TYPE_SYMLINK, target)
    } else {
        (TAR_TYPE_FILE, String::new())
    };

    let mut reader = None;
    let mut size = 0;
    if entry.meta.is_file() && entry.meta.len > 0 {
        size = entry.meta.len;
        reader = Some(
            fs.open(&entry.path)
                .map_err(|err| StoreError::tarball(&entry.path, err))?,
        );
    }

    let info = TarEntryInfo {
        // fs.FileMode-style permission bits only; type bits never reach
        // the mode field.
        mode: entry.meta.mode & 0o777,
        size,
        mtime: SOURCE_DATE_EPOCH,
        typeflag,
        linkname,
        data: match &mut reader {
            Some(r) => Some(r.as_mut()),
            None => None,
        },
    };
    tar.write_entry(&entry_tar_path(entry), info)
        .map_err(|err| StoreError::tarball(&entry.path, err))
}
