use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub kind: FileKind,
    pub len: u64,
    pub mode: u32,
}

impl FileMeta {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Permission bits only, without the file-type bits.
    #[must_use]
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub meta: FileMeta,
}

/// Filesystem capability set used by every store and pnpm entry point.
///
/// `read_dir` returns entries sorted byte-wise by name: both the NAR
/// encoder and the tar writer are specified in terms of lexicographic
/// child order, so the contract lives here instead of at each call site.
/// `remove_dir_all` treats a missing path as success.
pub trait FileSystem: Send + Sync {
    fn metadata(&self, path: &Path) -> Result<FileMeta>;
    fn symlink_metadata(&self, path: &Path) -> Result<FileMeta>;
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()>;
    fn read_link(&self, path: &Path) -> Result<PathBuf>;
    fn temp_dir(&self, prefix: &str) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub meta: FileMeta,
}

/// Depth-first pre-order traversal rooted at `root` (root included).
///
/// Children are visited in the sorted order `read_dir` guarantees, and
/// entries are never followed through symlinks.
pub fn walk(fs: &dyn FileSystem, root: &Path) -> Result<Vec<WalkEntry>> {
    let meta = fs.symlink_metadata(root)?;
    let mut entries = Vec::new();
    walk_into(fs, root, meta, &mut entries)?;
    Ok(entries)
}

fn walk_into(
    fs: &dyn FileSystem,
    path: &Path,
    meta: FileMeta,
    out: &mut Vec<WalkEntry>,
) -> Result<()> {
    let is_dir = meta.is_dir();
    out.push(WalkEntry {
        path: path.to_path_buf(),
        meta,
    });
    if is_dir {
        for child in fs.read_dir(path)? {
            walk_into(fs, &child.path, child.meta, out)?;
        }
    }
    Ok(())
}

/// A scratch directory owned by the pipeline, deleted on drop so every
/// exit path (including failures) releases it.
pub struct ScratchDir<'fs> {
    fs: &'fs dyn FileSystem,
    path: PathBuf,
}

impl<'fs> ScratchDir<'fs> {
    pub fn create(fs: &'fs dyn FileSystem, prefix: &str) -> Result<Self> {
        let path = fs.temp_dir(prefix)?;
        Ok(Self { fs, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.fs.remove_dir_all(&self.path) {
            debug!(path = %self.path.display(), %err, "failed to remove scratch directory");
        }
    }
}

fn meta_from_std(metadata: &fs::Metadata) -> FileMeta {
    let kind = if metadata.file_type().is_symlink() {
        FileKind::Symlink
    } else if metadata.is_dir() {
        FileKind::Dir
    } else {
        FileKind::File
    };
    FileMeta {
        kind,
        len: metadata.len(),
        mode: metadata.mode(),
    }
}

/// The production filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl OsFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for OsFileSystem {
    fn metadata(&self, path: &Path) -> Result<FileMeta> {
        let metadata =
            fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(meta_from_std(&metadata))
    }

    fn symlink_metadata(&self, path: &Path) -> Result<FileMeta> {
        let metadata = fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(meta_from_std(&metadata))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file =
            fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>> {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let reader = fs::read_dir(path)
            .with_context(|| format!("failed to read directory {}", path.display()))?;
        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry
                .with_context(|| format!("failed to read directory {}", path.display()))?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|name| anyhow!("non-UTF-8 file name {name:?} in {}", path.display()))?;
            let child = entry.path();
            let metadata = fs::symlink_metadata(&child)
                .with_context(|| format!("failed to stat {}", child.display()))?;
            entries.push(DirEntry {
                name,
                path: child,
                meta: meta_from_std(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Ok(entries)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", path.display()))
            }
        };
        let result = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            // A file or symlink at the target is removed without following.
            fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to chmod {}", path.display()))
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path)
            .with_context(|| format!("failed to read symlink target {}", path.display()))
    }

    fn temp_dir(&self, prefix: &str) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .context("failed to create temporary directory")?;
        Ok(dir.keep())
    }
}

#[derive(Clone)]
enum MemoryNode {
    Dir { mode: u32 },
    File { mode: u32, data: Vec<u8> },
    Symlink { target: PathBuf },
}

#[derive(Default)]
struct MemoryTree {
    nodes: BTreeMap<PathBuf, MemoryNode>,
    temp_counter: u64,
}

impl MemoryTree {
    fn canonical(path: &Path) -> Result<PathBuf> {
        if !path.is_absolute() {
            bail!("memory filesystem paths must be absolute (got {})", path.display());
        }
        let mut out = PathBuf::from("/");
        for component in path.components() {
            match component {
                Component::RootDir => {}
                Component::CurDir => {}
                Component::Normal(part) => out.push(part),
                other => bail!("unsupported path component {other:?} in {}", path.display()),
            }
        }
        Ok(out)
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut current = Self::canonical(path)?;
        for _ in 0..32 {
            match self.nodes.get(&current) {
                Some(MemoryNode::Symlink { target }) => {
                    current = if target.is_absolute() {
                        Self::canonical(target)?
                    } else {
                        let parent = current
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_else(|| PathBuf::from("/"));
                        Self::canonical(&parent.join(target))?
                    };
                }
                _ => return Ok(current),
            }
        }
        bail!("too many levels of symbolic links at {}", path.display())
    }

    fn node(&self, path: &Path) -> Result<&MemoryNode> {
        self.nodes
            .get(path)
            .ok_or_else(|| anyhow!("no such file or directory: {}", path.display()))
    }

    fn meta_of(&self, node: &MemoryNode) -> FileMeta {
        match node {
            MemoryNode::Dir { mode } => FileMeta {
                kind: FileKind::Dir,
                len: 0,
                mode: *mode,
            },
            MemoryNode::File { mode, data } => FileMeta {
                kind: FileKind::File,
                len: data.len() as u64,
                mode: *mode,
            },
            MemoryNode::Symlink { target } => FileMeta {
                kind: FileKind::Symlink,
                len: target.as_os_str().len() as u64,
                mode: 0o777,
            },
        }
    }

    fn insert_file(&mut self, path: PathBuf, contents: &[u8]) -> Result<()> {
        let Some(parent) = path.parent() else {
            bail!("cannot write to {}", path.display());
        };
        match self.nodes.get(parent) {
            Some(MemoryNode::Dir { .. }) => {}
            _ => bail!("parent directory does not exist: {}", parent.display()),
        }
        let mode = match self.nodes.get(&path) {
            Some(MemoryNode::File { mode, .. }) => *mode,
            Some(MemoryNode::Dir { .. }) => bail!("is a directory: {}", path.display()),
            _ => 0o644,
        };
        self.nodes.insert(
            path,
            MemoryNode::File {
                mode,
                data: contents.to_vec(),
            },
        );
        Ok(())
    }
}

/// An in-memory tree with mode bits and symlinks; backs the hermetic unit
/// tests for the normalizer, hasher, and tar writer.
#[derive(Clone)]
pub struct MemoryFileSystem {
    inner: Arc<Mutex<MemoryTree>>,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    #[must_use]
    pub fn new() -> Self {
        let mut tree = MemoryTree::default();
        tree.nodes
            .insert(PathBuf::from("/"), MemoryNode::Dir { mode: 0o755 });
        Self {
            inner: Arc::new(Mutex::new(tree)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTree> {
        self.inner.lock().expect("memory filesystem lock")
    }

    /// Create a file with explicit mode, creating parent directories.
    pub fn add_file(&self, path: impl AsRef<Path>, mode: u32, contents: &[u8]) -> Result<()> {
        let path = MemoryTree::canonical(path.as_ref())?;
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        let mut tree = self.lock();
        tree.nodes.insert(
            path,
            MemoryNode::File {
                mode,
                data: contents.to_vec(),
            },
        );
        Ok(())
    }

    /// Create a symlink node (the target need not exist).
    pub fn add_symlink(&self, path: impl AsRef<Path>, target: impl Into<PathBuf>) -> Result<()> {
        let path = MemoryTree::canonical(path.as_ref())?;
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        let mut tree = self.lock();
        tree.nodes.insert(
            path,
            MemoryNode::Symlink {
                target: target.into(),
            },
        );
        Ok(())
    }
}

struct MemoryWriter {
    inner: Arc<Mutex<MemoryTree>>,
    path: PathBuf,
    buf: Vec<u8>,
}

impl MemoryWriter {
    fn commit(&mut self) -> std::io::Result<()> {
        let mut tree = self.inner.lock().expect("memory filesystem lock");
        tree.insert_file(self.path.clone(), &self.buf)
            .map_err(std::io::Error::other)
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit()
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let _ = self.commit();
    }
}

impl FileSystem for MemoryFileSystem {
    fn metadata(&self, path: &Path) -> Result<FileMeta> {
        let tree = self.lock();
        let resolved = tree.resolve(path)?;
        let node = tree.node(&resolved)?;
        Ok(tree.meta_of(node))
    }

    fn symlink_metadata(&self, path: &Path) -> Result<FileMeta> {
        let tree = self.lock();
        let path = MemoryTree::canonical(path)?;
        let node = tree.node(&path)?;
        Ok(tree.meta_of(node))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.read(path)?)))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>> {
        let path = MemoryTree::canonical(path)?;
        Ok(Box::new(MemoryWriter {
            inner: Arc::clone(&self.inner),
            path,
            buf: Vec::new(),
        }))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let tree = self.lock();
        let resolved = tree.resolve(path)?;
        match tree.node(&resolved)? {
            MemoryNode::File { data, .. } => Ok(data.clone()),
            MemoryNode::Dir { .. } => bail!("is a directory: {}", path.display()),
            MemoryNode::Symlink { .. } => bail!("dangling symlink: {}", path.display()),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut tree = self.lock();
        let resolved = tree.resolve(path)?;
        tree.insert_file(resolved, contents)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let path = MemoryTree::canonical(path)?;
        let mut tree = self.lock();
        let mut current = PathBuf::from("/");
        tree.nodes
            .entry(current.clone())
            .or_insert(MemoryNode::Dir { mode: 0o755 });
        for component in path.components().skip(1) {
            current.push(component);
            match tree.nodes.get(&current) {
                Some(MemoryNode::Dir { .. }) => {}
                Some(_) => bail!("not a directory: {}", current.display()),
                None => {
                    tree.nodes
                        .insert(current.clone(), MemoryNode::Dir { mode: 0o755 });
                }
            }
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let tree = self.lock();
        let resolved = tree.resolve(path)?;
        match tree.node(&resolved)? {
            MemoryNode::Dir { .. } => {}
            _ => bail!("not a directory: {}", path.display()),
        }
        let mut entries = Vec::new();
        for (child, node) in tree.nodes.range(resolved.clone()..) {
            if child == &resolved {
                continue;
            }
            if !child.starts_with(&resolved) {
                break;
            }
            if child.parent() != Some(resolved.as_path()) {
                continue;
            }
            let name = child
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("non-UTF-8 file name in {}", path.display()))?
                .to_string();
            entries.push(DirEntry {
                name,
                path: child.clone(),
                meta: tree.meta_of(node),
            });
        }
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Ok(entries)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let path = MemoryTree::canonical(path)?;
        let mut tree = self.lock();
        let doomed: Vec<PathBuf> = tree
            .nodes
            .keys()
            .filter(|candidate| candidate.starts_with(&path))
            .cloned()
            .collect();
        for candidate in doomed {
            tree.nodes.remove(&candidate);
        }
        Ok(())
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        let mut tree = self.lock();
        let resolved = tree.resolve(path)?;
        match tree.nodes.get_mut(&resolved) {
            Some(MemoryNode::Dir { mode: dir_mode }) => {
                *dir_mode = mode;
                Ok(())
            }
            Some(MemoryNode::File {
                mode: file_mode, ..
            }) => {
                *file_mode = mode;
                Ok(())
            }
            Some(MemoryNode::Symlink { .. }) | None => {
                bail!("no such file or directory: {}", path.display())
            }
        }
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        let tree = self.lock();
        let path = MemoryTree::canonical(path)?;
        match tree.node(&path)? {
            MemoryNode::Symlink { target } => Ok(target.clone()),
            _ => bail!("not a symlink: {}", path.display()),
        }
    }

    fn temp_dir(&self, prefix: &str) -> Result<PathBuf> {
        let mut tree = self.lock();
        tree.temp_counter += 1;
        let path = PathBuf::from(format!("/tmp/{prefix}{}", tree.temp_counter));
        let mut current = PathBuf::from("/");
        for component in path.components().skip(1) {
            current.push(component);
            tree.nodes
                .entry(current.clone())
                .or_insert(MemoryNode::Dir { mode: 0o755 });
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_read_dir_is_sorted_bytewise() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/b.txt", 0o644, b"b").unwrap();
        fs.add_file("/store/a.txt", 0o644, b"a").unwrap();
        fs.add_file("/store/a/nested", 0o644, b"n").unwrap();
        fs.add_file("/store/A.txt", 0o644, b"A").unwrap();

        let names: Vec<String> = fs
            .read_dir(Path::new("/store"))
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["A.txt", "a", "a.txt", "b.txt"]);
    }

    #[test]
    fn memory_write_preserves_mode_of_existing_file() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/pkg.json", 0o444, b"{}").unwrap();
        fs.write(Path::new("/store/pkg.json"), b"{\"a\":1}").unwrap();
        let meta = fs.symlink_metadata(Path::new("/store/pkg.json")).unwrap();
        assert_eq!(meta.perm(), 0o444);
        assert_eq!(fs.read(Path::new("/store/pkg.json")).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn memory_remove_dir_all_ignores_missing_paths() {
        let fs = MemoryFileSystem::new();
        fs.remove_dir_all(Path::new("/store/v3/tmp")).unwrap();
    }

    #[test]
    fn memory_remove_dir_all_removes_subtree_only() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/v3/tmp/x", 0o644, b"x").unwrap();
        fs.add_file("/store/v3/kept", 0o644, b"k").unwrap();
        fs.remove_dir_all(Path::new("/store/v3/tmp")).unwrap();
        assert!(fs.symlink_metadata(Path::new("/store/v3/tmp")).is_err());
        assert!(fs.symlink_metadata(Path::new("/store/v3/kept")).is_ok());
    }

    #[test]
    fn memory_symlink_metadata_does_not_follow() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/target", 0o644, b"t").unwrap();
        fs.add_symlink("/store/link", "target").unwrap();
        let meta = fs.symlink_metadata(Path::new("/store/link")).unwrap();
        assert!(meta.is_symlink());
        let followed = fs.metadata(Path::new("/store/link")).unwrap();
        assert!(followed.is_file());
        assert_eq!(fs.read_link(Path::new("/store/link")).unwrap(), PathBuf::from("target"));
    }

    #[test]
    fn walk_visits_parents_before_children_in_sorted_order() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/b/file", 0o644, b"x").unwrap();
        fs.add_file("/store/a", 0o644, b"y").unwrap();
        fs.create_dir_all(Path::new("/store/c")).unwrap();

        let paths: Vec<PathBuf> = walk(&fs, Path::new("/store"))
            .unwrap()
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/store"),
                PathBuf::from("/store/a"),
                PathBuf::from("/store/b"),
                PathBuf::from("/store/b/file"),
                PathBuf::from("/store/c"),
            ]
        );
    }

    #[test]
    fn os_read_dir_sorts_and_lstats() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("zz"), b"z").unwrap();
        fs::write(root.join("aa"), b"a").unwrap();
        fs::create_dir(root.join("mm")).unwrap();
        std::os::unix::fs::symlink("aa", root.join("ln")).unwrap();

        let fs_impl = OsFileSystem::new();
        let entries = fs_impl.read_dir(root).unwrap();
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["aa", "ln", "mm", "zz"]);
        assert!(entries[1].meta.is_symlink());
        assert!(entries[2].meta.is_dir());
    }

    #[test]
    fn scratch_dir_removes_itself_on_drop() {
        let fs = MemoryFileSystem::new();
        let path = {
            let scratch = ScratchDir::create(&fs, "store-").unwrap();
            fs.add_file(scratch.path().join("x"), 0o644, b"x").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(fs.symlink_metadata(&path).is_err());
    }
}
