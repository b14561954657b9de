//! Blocking filesystem helpers. Callers run these on the blocking pool.

use std::{fs, io, path::Path};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

/// Recursively copy `src` into `dst`, returning the number of bytes copied.
/// Symlinks in the template are skipped so a workspace never points outside
/// itself.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut copied = 0u64;

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            copied += fs::copy(entry.path(), &target)?;
        }
    }

    Ok(copied)
}

/// Total size of regular files below `path`. Unreadable entries count as 0.
pub(crate) fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

pub(crate) fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
