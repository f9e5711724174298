use std::io::{Read, Write};
use std::path::Path;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use sha2::{Digest, Sha256};

use crate::core::effects::{FileMeta, FileSystem};

use super::StoreError;

const NAR_MAGIC: &str = "nix-archive-1";
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Hash a filesystem subtree as a NAR stream and render the digest in SRI
/// form (`sha256-<base64>`), equivalent to `nix hash path --type sha256`.
///
/// The serialization is streamed straight into the hash state; file
/// contents are never buffered whole.
///
/// # Errors
///
/// Any I/O failure during the walk surfaces as `FailedToHash` carrying the
/// offending path.
pub fn hash_tree(fs: &dyn FileSystem, root: &Path) -> Result<String, StoreError> {
    let mut sink = DigestWriter {
        hasher: Sha256::new(),
    };
    {
        let mut encoder = NarEncoder { fs, w: &mut sink };
        encoder
            .write_str(NAR_MAGIC)
            .map_err(|err| StoreError::hash(root, err))?;
        let meta = fs
            .metadata(root)
            .map_err(|err| StoreError::hash(root, err))?;
        encoder.write_node(root, meta)?;
    }
    let digest = sink.hasher.finalize();
    Ok(format!("sha256-{}", BASE64_STANDARD.encode(digest)))
}

struct DigestWriter {
    hasher: Sha256,
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// NAR framing: every token is a length-prefixed string, lengths are
/// little-endian u64, payloads are padded with NUL to 8-byte boundaries.
struct NarEncoder<'a> {
    fs: &'a dyn FileSystem,
    w: &'a mut dyn Write,
}

impl NarEncoder<'_> {
    fn write_node(&mut self, path: &Path, meta: FileMeta) -> Result<(), StoreError> {
        if meta.is_dir() {
            self.write_directory(path)
        } else if meta.is_symlink() {
            self.write_symlink(path)
        } else {
            self.write_regular(path, meta)
        }
    }

    fn write_directory(&mut self, path: &Path) -> Result<(), StoreError> {
        let io = |err: std::io::Error| StoreError::hash(path, err);
        self.write_str("(").map_err(io)?;
        self.write_str("type").map_err(io)?;
        self.write_str("directory").map_err(io)?;

        // read_dir is contractually sorted byte-wise, which is exactly the
        // lexicographic entry order the format requires.
        let entries = self
            .fs
            .read_dir(path)
            .map_err(|err| StoreError::hash(path, err))?;
        for entry in entries {
            self.write_str("entry").map_err(io)?;
            self.write_str("(").map_err(io)?;
            self.write_str("name").map_err(io)?;
            self.write_blob(entry.name.as_bytes()).map_err(io)?;
            self.write_str("node").map_err(io)?;
            self.write_node(&entry.path, entry.meta)?;
            self.write_str(")").map_err(io)?;
        }

        self.write_str(")").map_err(io)
    }

    fn write_regular(&mut self, path: &Path, meta: FileMeta) -> Result<(), StoreError> {
        let io = |err: std::io::Error| StoreError::hash(path, err);
        self.write_str("(").map_err(io)?;
        self.write_str("type").map_err(io)?;
        self.write_str("regular").map_err(io)?;
        if meta.is_executable() {
            self.write_str("executable").map_err(io)?;
            self.write_str("").map_err(io)?;
        }
        self.write_str("contents").map_err(io)?;

        self.w.write_all(&meta.len.to_le_bytes()).map_err(io)?;
        let mut reader = self
            .fs
            .open(path)
            .map_err(|err| StoreError::hash(path, err))?;
        let mut copied: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).map_err(io)?;
            if n == 0 {
                break;
            }
            self.w.write_all(&buf[..n]).map_err(io)?;
            copied += n as u64;
        }
        if copied != meta.len {
            return Err(StoreError::hash(
                path,
                std::io::Error::other(format!(
                    "file length changed while hashing (declared {}, read {copied})",
                    meta.len
                )),
            ));
        }
        self.write_padding(meta.len).map_err(io)?;

        self.write_str(")").map_err(io)
    }

    fn write_symlink(&mut self, path: &Path) -> Result<(), StoreError> {
        let io = |err: std::io::Error| StoreError::hash(path, err);
        let target = self
            .fs
            .read_link(path)
            .map_err(|err| StoreError::hash(path, err))?;
        self.write_str("(").map_err(io)?;
        self.write_str("type").map_err(io)?;
        self.write_str("symlink").map_err(io)?;
        self.write_str("target").map_err(io)?;
        self.write_blob(target.as_os_str().as_encoded_bytes())
            .map_err(io)?;
        self.write_str(")").map_err(io)
    }

    fn write_str(&mut self, token: &str) -> std::io::Result<()> {
        self.write_blob(token.as_bytes())
    }

    fn write_blob(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.w.write_all(&(data.len() as u64).to_le_bytes())?;
        self.w.write_all(data)?;
        self.write_padding(data.len() as u64)
    }

    fn write_padding(&mut self, len: u64) -> std::io::Result<()> {
        let rem = (len % 8) as usize;
        if rem != 0 {
            self.w.write_all(&[0u8; 8][..8 - rem])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::effects::MemoryFileSystem;

    // `nix hash path` over an empty directory; a fixed point of the format.
    const EMPTY_DIR_SRI: &str = "sha256-pQpattmS9VmO3ZIQUFn66az8GSmB4IvYhTTCFn6SUmo=";

    fn fixture_tree(executable: bool) -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        let mode = if executable { 0o555 } else { 0o444 };
        fs.add_file("/store/bin-exec", mode, b"#!/bin/sh\n").unwrap();
        fs.add_file("/store/data.txt", 0o444, b"hello world\n").unwrap();
        fs.add_symlink("/store/link", "data.txt").unwrap();
        fs
    }

    #[test]
    fn empty_directory_matches_known_hash() {
        let fs = MemoryFileSystem::new();
        fs.create_dir_all(Path::new("/store")).unwrap();
        assert_eq!(hash_tree(&fs, Path::new("/store")).unwrap(), EMPTY_DIR_SRI);
    }

    #[test]
    fn mixed_tree_matches_known_hash() {
        let fs = fixture_tree(true);
        assert_eq!(
            hash_tree(&fs, Path::new("/store")).unwrap(),
            "sha256-p7Em1jbAjkVDpFthAiG5w2JiQEUO9apdW/OGra1XfXI="
        );
    }

    #[test]
    fn executable_bit_changes_the_hash() {
        let with_exec = hash_tree(&fixture_tree(true), Path::new("/store")).unwrap();
        let without_exec = hash_tree(&fixture_tree(false), Path::new("/store")).unwrap();
        assert_eq!(
            without_exec,
            "sha256-Fs9S1pLl/X/0RDrC6xR+lVGjbiLfCH+JdSsH9VIrL00="
        );
        assert_ne!(with_exec, without_exec);
    }

    #[test]
    fn single_file_matches_known_hash() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/file.txt", 0o444, b"hello").unwrap();
        assert_eq!(
            hash_tree(&fs, Path::new("/store")).unwrap(),
            "sha256-qUvPXh6SjEx8mq4G6z1YklP/eHLvmzfyFKI3ehha0qI="
        );
    }

    #[test]
    fn hashing_is_deterministic() {
        let first = hash_tree(&fixture_tree(true), Path::new("/store")).unwrap();
        let second = hash_tree(&fixture_tree(true), Path::new("/store")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn swapping_sibling_contents_changes_the_hash() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/a", 0o444, b"one").unwrap();
        fs.add_file("/store/b", 0o444, b"two").unwrap();
        let original = hash_tree(&fs, Path::new("/store")).unwrap();

        let swapped = MemoryFileSystem::new();
        swapped.add_file("/store/a", 0o444, b"two").unwrap();
        swapped.add_file("/store/b", 0o444, b"one").unwrap();
        assert_ne!(original, hash_tree(&swapped, Path::new("/store")).unwrap());
    }

    #[test]
    fn renaming_a_file_changes_the_hash() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/store/a", 0o444, b"payload").unwrap();
        let original = hash_tree(&fs, Path::new("/store")).unwrap();

        let renamed = MemoryFileSystem::new();
        renamed.add_file("/store/b", 0o444, b"payload").unwrap();
        assert_ne!(original, hash_tree(&renamed, Path::new("/store")).unwrap());
    }

    #[test]
    fn missing_root_is_failed_to_hash() {
        let fs = MemoryFileSystem::new();
        let err = hash_tree(&fs, Path::new("/absent")).unwrap_err();
        assert!(matches!(err, StoreError::FailedToHash { .. }));
    }
}
