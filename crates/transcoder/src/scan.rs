use std::path::{Path, PathBuf};
use anyhow::{bail, Result};
use walkdir::WalkDir;
use log::{debug, info, warn};

/// Media file extensions picked up by a directory scan
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "mov", "avi", "webm", "mpeg", "mpg", "flv", "ts", "m4v",
];

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Recursively collect media files under `root`, sorted by path.
///
/// An empty result is not an error; a missing root is.
pub fn scan_directory(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Scan root does not exist: {}", root.display());
    }
    if !root.is_dir() {
        bail!("Scan root is not a directory: {}", root.display());
    }

    info!("Scanning directory: {}", root.display());

    let mut found = Vec::new();
    let mut entry_count = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        entry_count += 1;
        if entry_count % 1000 == 0 {
            info!("Scanned {} entries so far in {}...", entry_count, root.display());
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_media_file(entry.path()) {
            continue;
        }

        debug!("Found media file: {}", entry.path().display());
        found.push(entry.into_path());
    }

    found.sort();
    info!(
        "Finished scanning {}: {} entries, {} media files",
        root.display(),
        entry_count,
        found.len()
    );
    Ok(found)
}
