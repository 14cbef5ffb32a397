// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Walks a working set and produces a deterministic path-to-digest map, and
//! diffs two such maps to find new-or-changed content.
//!
//! The digest is xxh3-128: a 128-bit, non-cryptographic hash. It is used
//! purely for change detection between successive snapshots of the same
//! mirror, never as a security boundary, so collision resistance against an
//! adversarial preimage is not a requirement.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

/// path -> hex digest, always produced in sorted (deterministic) order.
pub type DigestMap = BTreeMap<String, String>;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error walking {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("root path does not exist or is not a directory: {0}")]
    InvalidRoot(PathBuf),
}

/// Directory/file names excluded from hashing wherever they occur, plus the
/// dynamic "escapes root" rule for symlinks, which is evaluated per-entry
/// rather than by name.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    names: HashSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self { names: HashSet::new() }
    }

    /// The mirror's VCS metadata directory and the snapshot output
    /// directory are always excluded from the working-set digest.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.exclude(".git");
        set.exclude("versions");
        set
    }

    pub fn exclude(&mut self, name: impl Into<String>) -> &mut Self {
        self.names.insert(name.into());
        self
    }

    /// Whether a bare file/directory name (not a path) is excluded.
    pub fn excludes(&self, file_name: &str) -> bool {
        self.names.contains(file_name)
    }
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Walks `root` depth-first in deterministic (sorted) order and returns a
/// path -> digest map. A single file's content is never fully buffered in
/// memory; reads are streamed in fixed-size chunks.
pub fn hash_tree(root: &Path, exclusions: &ExclusionSet) -> Result<DigestMap, Error> {
    let root_canon = fs::canonicalize(root).map_err(|_| Error::InvalidRoot(root.to_path_buf()))?;
    if !root_canon.is_dir() {
        return Err(Error::InvalidRoot(root.to_path_buf()));
    }

    let mut out = DigestMap::new();
    walk(root, &root_canon, Path::new(""), exclusions, &mut out)?;
    Ok(out)
}

fn walk(
    root: &Path,
    root_canon: &Path,
    relative: &Path,
    exclusions: &ExclusionSet,
    out: &mut DigestMap,
) -> Result<(), Error> {
    let absolute = root.join(relative);

    let mut entries = fs::read_dir(&absolute)
        .map_err(|source| Error::Io { path: absolute.clone(), source })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| Error::Io { path: absolute.clone(), source })?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();

        if exclusions.excludes(&name_str) {
            continue;
        }

        let entry_relative = relative.join(&name);
        let entry_path = root.join(&entry_relative);
        let metadata = fs::symlink_metadata(&entry_path).map_err(|source| Error::Io {
            path: entry_path.clone(),
            source,
        })?;

        if metadata.file_type().is_symlink() {
            if let Some(link_text) = resolve_if_inside(root_canon, &entry_path)? {
                let digest = hash_bytes(link_text.as_bytes());
                out.insert(relative_key(&entry_relative), digest);
            }
            // Escaping symlinks are silently excluded, per the exclusion-set contract.
            continue;
        }

        if metadata.is_dir() {
            walk(root, root_canon, &entry_relative, exclusions, out)?;
        } else if metadata.is_file() {
            let digest = hash_file(&entry_path)?;
            out.insert(relative_key(&entry_relative), digest);
        }
    }

    Ok(())
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn hash_file(path: &Path) -> Result<String, Error> {
    let mut file = fs::File::open(path).map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:032x}", hasher.digest128()))
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(bytes);
    format!("{:032x}", hasher.digest128())
}

/// Returns the link's raw target text if it resolves inside `root_canon`,
/// or `None` if it escapes and should be excluded. Resolution is lexical
/// (no filesystem lookup of the target), since a link's target need not
/// exist. Exposed so other components walking the same tree (the snapshot
/// packer) apply an identical escape rule.
pub fn resolve_if_inside(root_canon: &Path, link_path: &Path) -> Result<Option<String>, Error> {
    let target = fs::read_link(link_path).map_err(|source| Error::Io {
        path: link_path.to_path_buf(),
        source,
    })?;

    let parent = link_path.parent().unwrap_or(link_path);
    let absolute_target = if target.is_absolute() {
        target.clone()
    } else {
        parent.join(&target)
    };

    let normalized = normalize_lexically(&absolute_target);

    if is_within(root_canon, &normalized) {
        Ok(Some(target.to_string_lossy().into_owned()))
    } else {
        Ok(None)
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_within(base: &Path, candidate: &Path) -> bool {
    candidate.components().zip(base.components()).all(|(a, b)| a == b) && candidate.components().count() >= base.components().count()
}

/// Returns paths that are new in `curr`, or whose digest differs from `prev`.
/// Paths removed since `prev` (present only in `prev`) are not included: the
/// diff is the set of content an incremental snapshot must capture.
pub fn diff(prev: &DigestMap, curr: &DigestMap) -> Vec<String> {
    curr.iter()
        .filter(|(path, digest)| prev.get(*path) != Some(*digest))
        .map(|(path, _)| path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn hashes_are_deterministic_and_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();

        let map = hash_tree(dir.path(), &ExclusionSet::with_defaults()).unwrap();
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[test]
    fn excludes_vcs_dir_and_versions_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), b"ref: refs/heads/main").unwrap();
        fs::create_dir(dir.path().join("versions")).unwrap();
        fs::write(dir.path().join("versions/old.tar.xz"), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"keep").unwrap();

        let map = hash_tree(dir.path(), &ExclusionSet::with_defaults()).unwrap();
        assert_eq!(map.keys().cloned().collect::<Vec<_>>(), vec!["keep.txt"]);
    }

    #[test]
    #[cfg(unix)]
    fn symlink_inside_root_is_hashed_as_link_text_not_target() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"content").unwrap();
        symlink("real.txt", dir.path().join("link.txt")).unwrap();

        let map = hash_tree(dir.path(), &ExclusionSet::with_defaults()).unwrap();
        let real_digest = map.get("real.txt").unwrap();
        let link_digest = map.get("link.txt").unwrap();
        assert_ne!(real_digest, link_digest);
        assert_eq!(link_digest, &hash_bytes(b"real.txt"));
    }

    #[test]
    #[cfg(unix)]
    fn symlink_escaping_root_is_excluded() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        symlink(outside.path().join("secret.txt"), dir.path().join("escape.txt")).unwrap();

        let map = hash_tree(dir.path(), &ExclusionSet::with_defaults()).unwrap();
        assert!(!map.contains_key("escape.txt"));
    }

    #[test]
    fn diff_is_exactly_new_or_changed_paths() {
        let mut prev = DigestMap::new();
        prev.insert("a".into(), "1".into());
        prev.insert("b".into(), "2".into());

        let mut curr = DigestMap::new();
        curr.insert("a".into(), "1".into()); // unchanged
        curr.insert("b".into(), "3".into()); // changed
        curr.insert("c".into(), "4".into()); // new

        let changed = diff(&prev, &curr);
        assert_eq!(changed, vec!["b".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn diff_of_identical_maps_is_empty() {
        let mut map = DigestMap::new();
        map.insert("a".into(), "1".into());
        assert!(diff(&map, &map).is_empty());
    }
}
