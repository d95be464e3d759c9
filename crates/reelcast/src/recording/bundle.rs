//! Zip archives of finished sessions

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{Bundle, SessionFile};
use crate::BundleError;

/// File name prefix of every archive this builder writes
pub const ARCHIVE_PREFIX: &str = "recordings_";

/// Extension of every archive this builder writes
pub const ARCHIVE_EXTENSION: &str = "zip";

/// An archive found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Builds bundles into a fixed archive directory
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    archive_dir: PathBuf,
}

impl BundleBuilder {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Archive `sessions` into a new bundle.
    ///
    /// Returns `Ok(None)` when there is nothing to archive. Members are
    /// ordered by file name, then by full path. Members sharing a file name
    /// are stored as `<stem>_<n>.<ext>` after the first. Source files are
    /// left in place. A failed build leaves no partial archive behind.
    pub fn build(&self, sessions: &[SessionFile]) -> Result<Option<Bundle>, BundleError> {
        if sessions.is_empty() {
            debug!("No sessions to bundle");
            return Ok(None);
        }

        let mut members = sessions.to_vec();
        members.sort_by(|a, b| {
            a.file_name()
                .cmp(&b.file_name())
                .then_with(|| a.path.cmp(&b.path))
        });

        fs::create_dir_all(&self.archive_dir).map_err(|source| BundleError::Io {
            path: self.archive_dir.clone(),
            source,
        })?;

        let created_at = Local::now();
        let archive_path = self.unused_archive_path(&created_at);

        if let Err(e) = write_archive(&archive_path, &members) {
            if let Err(cleanup) = fs::remove_file(&archive_path) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = ?archive_path, error = %cleanup, "Failed to remove partial archive");
                }
            }
            return Err(e);
        }

        let size_bytes = fs::metadata(&archive_path)
            .map_err(|source| BundleError::Io {
                path: archive_path.clone(),
                source,
            })?
            .len();

        info!(
            path = ?archive_path,
            members = members.len(),
            size = size_bytes,
            "Bundle created"
        );

        Ok(Some(Bundle {
            archive_path,
            size_bytes,
            created_at,
            members,
        }))
    }

    /// Archives in the archive directory, sorted by name.
    pub fn list_archives(&self) -> Result<Vec<ArchiveInfo>, BundleError> {
        let entries = match fs::read_dir(&self.archive_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BundleError::Io {
                    path: self.archive_dir.clone(),
                    source,
                })
            }
        };

        let mut archives: Vec<ArchiveInfo> = entries
            .flatten()
            .filter(|entry| is_archive_name(&entry.file_name().to_string_lossy()))
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                meta.is_file().then(|| ArchiveInfo {
                    path: entry.path(),
                    size_bytes: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
            .collect();
        archives.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(archives)
    }

    /// The most recently modified archive, opened as a bundle.
    pub fn latest_archive(&self) -> Result<Option<Bundle>, BundleError> {
        let latest = self
            .list_archives()?
            .into_iter()
            .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        latest.map(|info| open_bundle(&info.path)).transpose()
    }

    fn unused_archive_path(&self, created_at: &DateTime<Local>) -> PathBuf {
        let stamp = created_at.format("%Y%m%d_%H%M%S_%3f");
        let mut path = self
            .archive_dir
            .join(format!("{ARCHIVE_PREFIX}{stamp}.{ARCHIVE_EXTENSION}"));
        let mut n = 1;
        while path.exists() {
            path = self
                .archive_dir
                .join(format!("{ARCHIVE_PREFIX}{stamp}_{n}.{ARCHIVE_EXTENSION}"));
            n += 1;
        }
        path
    }
}

fn is_archive_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX)
        && Path::new(name)
            .extension()
            .is_some_and(|ext| ext == ARCHIVE_EXTENSION)
}

fn write_archive(path: &Path, members: &[SessionFile]) -> Result<(), BundleError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| BundleError::Io { path, source }
    };
    let zip_err = |source: zip::result::ZipError| BundleError::Archive {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(io_err(path))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(members.iter().any(|m| m.size_bytes >= u32::MAX as u64));

    for (member, entry) in members.iter().zip(entry_names(members)) {
        zip.start_file(entry, options).map_err(zip_err)?;
        let mut source = BufReader::new(File::open(&member.path).map_err(io_err(&member.path))?);
        io::copy(&mut source, &mut zip).map_err(io_err(path))?;
        debug!(member = ?member.path, "Archived session");
    }

    let mut file = zip.finish().map_err(zip_err)?;
    file.flush().map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(())
}

/// Archive entry name for each member, in order, with repeated file names
/// suffixed so every entry is unique.
fn entry_names(members: &[SessionFile]) -> Vec<String> {
    let mut taken = HashSet::new();
    members
        .iter()
        .map(|member| {
            let name = member.file_name();
            if taken.insert(name.clone()) {
                return name;
            }
            let path = Path::new(&name);
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let mut n = 1;
            loop {
                let candidate = format!("{stem}_{n}{ext}");
                if taken.insert(candidate.clone()) {
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

/// Describe an existing archive as a bundle.
fn open_bundle(path: &Path) -> Result<Bundle, BundleError> {
    let io_err = |source: io::Error| BundleError::Io {
        path: path.to_path_buf(),
        source,
    };
    let zip_err = |source: zip::result::ZipError| BundleError::Archive {
        path: path.to_path_buf(),
        source,
    };

    let meta = fs::metadata(path).map_err(io_err)?;
    let file = File::open(path).map_err(io_err)?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;

    let mut members = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(zip_err)?;
        if !entry.is_dir() {
            members.push(SessionFile::new(entry.name(), entry.size()));
        }
    }

    let created_at = meta
        .modified()
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now());

    Ok(Bundle {
        archive_path: path.to_path_buf(),
        size_bytes: meta.len(),
        created_at,
        members,
    })
}

impl Bundle {
    /// Rebuild a bundle description from an archive on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        open_bundle(path.as_ref())
    }
}
