//! Unpacking received archives

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::BundleError;

/// Extensions recognised as video files
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv"];

/// Whether `path` has one of [`VIDEO_EXTENSIONS`] (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|v| v.eq_ignore_ascii_case(ext))
        })
}

/// Whether `path` names a zip archive.
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Extract every file in `archive` under `dest`.
///
/// Members whose names would land outside `dest` are skipped. Returns the
/// extracted paths in archive order.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, BundleError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| BundleError::Io { path, source }
    };
    let zip_err = |source: zip::result::ZipError| BundleError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(io_err(archive))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;
    fs::create_dir_all(dest).map_err(io_err(dest))?;

    let mut extracted = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(member = %entry.name(), "Skipping archive member with unsafe name");
            continue;
        };
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let mut out = File::create(&target).map_err(io_err(&target))?;
        io::copy(&mut entry, &mut out).map_err(io_err(&target))?;
        debug!(path = ?target, size = entry.size(), "Extracted");
        extracted.push(target);
    }

    info!(archive = ?archive, dest = ?dest, files = extracted.len(), "Archive extracted");
    Ok(extracted)
}

/// Video files directly inside `dir`, sorted by name.
pub fn list_videos(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut videos: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_video_file(p))
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };
    videos.sort();
    Ok(videos)
}
