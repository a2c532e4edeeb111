use std::fs::metadata;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Get the update time of a file in the local filesystem.
///
/// # Arguments
///
/// * `path` - A reference to a `Path` object representing the path to the file.
///
/// # Returns
///
/// A `DateTime<Utc>` object representing the update time of the file.
///
/// # Errors
///
/// This function returns an error if the file metadata cannot be accessed.
pub fn local_get_file_update_time(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = metadata(path)?;
    let modified_time = metadata.modified()?;

    Ok(DateTime::<Utc>::from(modified_time))
}

/// Make sure the given directory exists, creating it (and any missing parents)
/// when absent. Calling this twice on the same target is not an error.
///
/// # Errors
///
/// Returns an error if the path exists but is not a directory, or if creation
/// fails.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Could not create directory {}", path.display()))?;
    }

    if !path.is_dir() {
        bail!("Path {} exists and is not a directory", path.display());
    }

    Ok(())
}

/// Find the most-recently-modified regular file matching a glob pattern.
/// Returns `Ok(None)` when nothing matches.
pub fn newest_matching_file(pattern: &str) -> Result<Option<PathBuf>> {
    let mut newest: Option<(DateTime<Utc>, PathBuf)> = None;

    for entry in glob::glob(pattern)? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }

        let mtime = local_get_file_update_time(&path)?;
        if newest.as_ref().map_or(true, |(t, _)| mtime > *t) {
            newest = Some((mtime, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Collect the regular files under a directory tree, up to `cap` entries.
/// The cap bounds the work done by a directory-tree upload.
pub fn collect_files_under(dir: &Path, cap: usize) -> Result<Vec<PathBuf>> {
    let content = fs_extra::dir::get_dir_content(dir)
        .with_context(|| format!("Could not list directory {}", dir.display()))?;

    let files = content
        .files
        .into_iter()
        .map(PathBuf::from)
        .filter(|p| p.is_file())
        .take(cap)
        .collect();

    Ok(files)
}
