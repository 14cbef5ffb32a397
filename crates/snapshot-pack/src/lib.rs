// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Streams working-set content into (and back out of) compressed tar
//! snapshots.
//!
//! Packing never holds the whole archive in memory: both the tar layer and
//! the LZMA-family compressor are streaming. Unpacking defends against
//! "tar-slip" by resolving every entry's path against the destination
//! before any bytes are written, rejecting anything that would land
//! outside it.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use fs_err as fs;

use tar::EntryType;
use thiserror::Error;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

pub use hash_index::ExclusionSet;

const XZ_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackStats {
    pub size_bytes: u64,
    pub file_count: u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{path} is not inside {root}")]
    NotInSourceRoot { path: PathBuf, root: PathBuf },
    #[error("archive entry resolves outside the destination root: {0}")]
    TarSlip(PathBuf),
    #[error("archive entry has no path")]
    MissingEntryPath,
}

/// Packs `source_root` into a streaming tar-in-xz snapshot at `output_path`.
///
/// With `file_list` absent, every file and in-bounds symlink under
/// `source_root` (minus `exclusions`) is packed (a full snapshot). With
/// `file_list` present, only those relative paths are packed (an
/// incremental snapshot). The output is written to a temporary sibling of
/// `output_path` and renamed into place only on success, so a failed pack
/// never leaves a partial file at the target path.
pub fn pack(
    source_root: &Path,
    output_path: &Path,
    file_list: Option<&[String]>,
    exclusions: &ExclusionSet,
) -> Result<PackStats, Error> {
    let paths = match file_list {
        Some(list) => {
            let mut v = list.to_vec();
            v.sort();
            v
        }
        None => collect_tree(source_root, exclusions)?,
    };

    let out_dir = output_path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(out_dir)?;
    let temp = tempfile::Builder::new().prefix(".snapshot-").tempfile_in(out_dir)?;

    let file_count = {
        let writer = BufWriter::new(temp.as_file());
        let encoder = XzEncoder::new(writer, XZ_LEVEL);
        let mut builder = tar::Builder::new(encoder);

        let mut count = 0u64;
        for relative in &paths {
            let full_path = source_root.join(relative);
            builder.append_path_with_name(&full_path, relative)?;
            count += 1;
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        count
    };

    let size_bytes = temp.as_file().metadata()?.len();

    temp.persist(output_path).map_err(|e| Error::Io(e.error))?;

    Ok(PackStats { size_bytes, file_count })
}

/// Walks `source_root` collecting every in-scope file and symlink relative
/// path, applying the same exclusion and escaping-symlink rules as
/// [`hash_index::hash_tree`] so a full snapshot and a full hash pass agree
/// on what's "in" a mirror.
fn collect_tree(source_root: &Path, exclusions: &ExclusionSet) -> Result<Vec<String>, Error> {
    let root_canon = fs::canonicalize(source_root)?;
    let mut out = Vec::new();
    collect_dir(source_root, &root_canon, Path::new(""), exclusions, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_dir(
    root: &Path,
    root_canon: &Path,
    relative: &Path,
    exclusions: &ExclusionSet,
    out: &mut Vec<String>,
) -> Result<(), Error> {
    let absolute = root.join(relative);
    let mut entries: Vec<_> = fs::read_dir(&absolute)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if exclusions.excludes(&name_str) {
            continue;
        }

        let entry_relative = relative.join(&name);
        let entry_path = root.join(&entry_relative);
        let metadata = fs::symlink_metadata(&entry_path)?;

        if metadata.file_type().is_symlink() {
            if hash_index::resolve_if_inside(root_canon, &entry_path)
                .map_err(|e| Error::Io(io::Error::other(e.to_string())))?
                .is_some()
            {
                out.push(to_posix(&entry_relative));
            }
            continue;
        }

        if metadata.is_dir() {
            collect_dir(root, root_canon, &entry_relative, exclusions, out)?;
        } else if metadata.is_file() {
            out.push(to_posix(&entry_relative));
        }
    }

    Ok(())
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extracts `archive_path` into `destination_root`. Every entry's resolved
/// path is required to lie strictly within `destination_root`: absolute
/// paths and `..` components are refused outright. Symlinks restore as
/// links; a hard link whose target does not resolve safely inside the
/// destination is materialized as a plain file copy instead of being
/// linked.
pub fn unpack(archive_path: &Path, destination_root: &Path) -> Result<(), Error> {
    fs::create_dir_all(destination_root)?;

    let file = fs::File::open(archive_path)?;
    let decoder = XzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);

    let mut extracted: HashMap<PathBuf, PathBuf> = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path().map_err(|_| Error::MissingEntryPath)?.into_owned();
        let safe_relative = safe_relative_path(&raw_path)?;
        let target = destination_root.join(&safe_relative);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            EntryType::Symlink => {
                let link_name = entry
                    .link_name()
                    .ok()
                    .flatten()
                    .ok_or(Error::MissingEntryPath)?
                    .into_owned();
                restore_symlink(&link_name, &target)?;
            }
            EntryType::Link => {
                let link_name = entry
                    .link_name()
                    .ok()
                    .flatten()
                    .ok_or(Error::MissingEntryPath)?
                    .into_owned();
                let safe_link_target = safe_relative_path(&link_name).ok();
                let resolved = safe_link_target
                    .as_ref()
                    .and_then(|rel| extracted.get(rel).cloned());

                match resolved.filter(|source| fs::hard_link(source, &target).is_ok()) {
                    Some(_) => {}
                    None => copy_entry_to_file(&mut entry, &target)?,
                }
            }
            _ => {
                copy_entry_to_file(&mut entry, &target)?;
            }
        }

        extracted.insert(safe_relative, target);
    }

    Ok(())
}

fn copy_entry_to_file<R: Read>(entry: &mut tar::Entry<'_, R>, target: &Path) -> Result<(), Error> {
    let mut out = fs::File::create(target)?;
    io::copy(entry, &mut out)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(mode) = entry.header().mode() {
            let _ = out.set_permissions(std::fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}

#[cfg(unix)]
fn restore_symlink(link_name: &Path, target: &Path) -> Result<(), Error> {
    let _ = fs::remove_file(target);
    std::os::unix::fs::symlink(link_name, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_symlink(_link_name: &Path, target: &Path) -> Result<(), Error> {
    // Non-unix targets have no native symlink restoration here; materialize
    // an empty placeholder rather than silently dropping the entry.
    fs::File::create(target)?;
    Ok(())
}

/// Validates a tar entry path and returns it as a destination-relative
/// path. Rejects absolute paths and any `..` component: with those two
/// rules enforced, a pure relative join with `destination_root` can never
/// resolve outside it.
fn safe_relative_path(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        return Err(Error::TarSlip(path.to_path_buf()));
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::TarSlip(path.to_path_buf()));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(Error::TarSlip(path.to_path_buf()));
    }

    Ok(out)
}

/// Best-effort deletion: a missing archive file is not an error.
pub fn delete(archive_path: &Path) {
    let _ = fs::remove_file(archive_path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn pack_and_unpack_round_trips_regular_files() {
        let source = tempdir().unwrap();
        fs::write(source.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("sub/b.txt"), b"world").unwrap();

        let out_dir = tempdir().unwrap();
        let archive_path = out_dir.path().join("snap.tar.xz");
        let stats = pack(source.path(), &archive_path, None, &ExclusionSet::with_defaults()).unwrap();
        assert_eq!(stats.file_count, 2);
        assert!(stats.size_bytes > 0);

        let dest = tempdir().unwrap();
        unpack(&archive_path, dest.path()).unwrap();

        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.path().join("sub/b.txt")).unwrap(), b"world");
    }

    #[test]
    fn incremental_pack_contains_only_listed_files() {
        let source = tempdir().unwrap();
        fs::write(source.path().join("a.txt"), b"hello").unwrap();
        fs::write(source.path().join("b.txt"), b"world").unwrap();

        let out_dir = tempdir().unwrap();
        let archive_path = out_dir.path().join("snap.tar.xz");
        let file_list = vec!["b.txt".to_owned()];
        let stats = pack(
            source.path(),
            &archive_path,
            Some(&file_list),
            &ExclusionSet::with_defaults(),
        )
        .unwrap();
        assert_eq!(stats.file_count, 1);

        let dest = tempdir().unwrap();
        unpack(&archive_path, dest.path()).unwrap();
        assert!(!dest.path().join("a.txt").exists());
        assert_eq!(fs::read(dest.path().join("b.txt")).unwrap(), b"world");
    }

    #[test]
    fn pack_never_leaves_partial_output_on_failure() {
        let source = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let archive_path = out_dir.path().join("snap.tar.xz");

        let file_list = vec!["does-not-exist.txt".to_owned()];
        let result = pack(source.path(), &archive_path, Some(&file_list), &ExclusionSet::with_defaults());
        assert!(result.is_err());
        assert!(!archive_path.exists());
    }

    #[test]
    fn unpack_rejects_tar_slip_absolute_path() {
        let out_dir = tempdir().unwrap();
        let archive_path = out_dir.path().join("evil.tar.xz");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let encoder = XzEncoder::new(file, XZ_LEVEL);
            let mut builder = tar::Builder::new(encoder);
            let data = b"pwned";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "/etc/passwd", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tempdir().unwrap();
        let result = unpack(&archive_path, dest.path());
        assert!(matches!(result, Err(Error::TarSlip(_))));
    }

    #[test]
    fn unpack_rejects_tar_slip_parent_dir() {
        let out_dir = tempdir().unwrap();
        let archive_path = out_dir.path().join("evil2.tar.xz");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let encoder = XzEncoder::new(file, XZ_LEVEL);
            let mut builder = tar::Builder::new(encoder);
            let data = b"pwned";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "../../outside.txt", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tempdir().unwrap();
        let result = unpack(&archive_path, dest.path());
        assert!(matches!(result, Err(Error::TarSlip(_))));
    }

    #[test]
    fn delete_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        delete(&dir.path().join("nope.tar.xz"));
    }
}
