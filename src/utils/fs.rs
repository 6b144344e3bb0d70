// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Filesystem tree helpers shared by the artifact store and the cache

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Copy everything below directory `src` into `dst`, creating `dst`
///
/// Existing files in `dst` are overwritten; other files are left alone.
/// Returns the number of files copied.
pub fn copy_dir_contents(src: &Path, dst: &Path) -> io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Copy `src` into directory `dst_dir`
///
/// A file lands as `dst_dir/<file name>`; a directory has its contents merged.
pub fn copy_into(src: &Path, dst_dir: &Path) -> io::Result<u64> {
    if src.is_dir() {
        return copy_dir_contents(src, dst_dir);
    }

    std::fs::create_dir_all(dst_dir)?;
    let name = src
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    std::fs::copy(src, dst_dir.join(name))?;
    Ok(1)
}

/// Remove a file or directory tree; a missing path is not an error
pub fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Paths of the files and symlinks below `dir`, relative to it
pub fn relative_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| !e.file_type().is_dir())
        .filter_map(|e| e.path().strip_prefix(dir).ok().map(Path::to_path_buf))
        .collect()
}

/// Total size in bytes of the files below `path`
pub fn tree_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = std::fs::read_link(src)?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    remove_path(dst)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::copy(src, dst).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_dir_contents_preserves_layout() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        std::fs::create_dir_all(src.join("nested/deeper")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("nested/deeper/b.txt"), "b").unwrap();

        let dst = temp_dir.path().join("dst");
        let copied = copy_dir_contents(&src, &dst).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(
            std::fs::read_to_string(dst.join("nested/deeper/b.txt")).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_copy_into_places_files_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("Nodulus.ipa");
        std::fs::write(&file, "ipa").unwrap();

        let dst = temp_dir.path().join("out");
        copy_into(&file, &dst).unwrap();
        assert!(dst.join("Nodulus.ipa").is_file());
    }

    #[test]
    fn test_relative_files_skips_directories() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        std::fs::write(temp_dir.path().join("a/b/c.txt"), "c").unwrap();
        std::fs::write(temp_dir.path().join("top.txt"), "t").unwrap();

        let mut files = relative_files(temp_dir.path());
        files.sort();
        assert_eq!(
            files,
            vec![PathBuf::from("a/b/c.txt"), PathBuf::from("top.txt")]
        );
    }

    #[test]
    fn test_remove_missing_path_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        assert!(remove_path(&temp_dir.path().join("nope")).is_ok());
    }
}
