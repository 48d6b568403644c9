//! Archive extraction

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::Path;
use tar::Archive;
use thiserror::Error;

/// Archive formats accepted for binary artifacts
pub const SUPPORTED_EXTENSIONS: &[&str] = &["zip", "tar.gz"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("unexpected file type; supported extensions are: {}", SUPPORTED_EXTENSIONS.join(", "))]
    UnsupportedType,

    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Failed(e.to_string())
    }
}

/// Whether `path` names an archive format this crate can extract
pub fn is_supported_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|extension| name.ends_with(&format!(".{}", extension)))
}

pub trait Archiver: Send + Sync {
    /// Unpack `archive` into `destination`, creating it if needed
    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError>;
}

/// Extracts zip and gzip-compressed tar archives
#[derive(Debug, Default, Clone, Copy)]
pub struct FileArchiver;

impl Archiver for FileArchiver {
    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
        if !is_supported_archive(archive) {
            return Err(ArchiveError::UnsupportedType);
        }
        fs::create_dir_all(destination)?;
        let file = File::open(archive)?;
        let name = archive.to_string_lossy().to_lowercase();

        if name.ends_with(".zip") {
            let mut zip = zip::ZipArchive::new(file).map_err(|e| ArchiveError::Failed(e.to_string()))?;
            zip.extract(destination)
                .map_err(|e| ArchiveError::Failed(e.to_string()))
        } else {
            Archive::new(GzDecoder::new(file)).unpack(destination)?;
            Ok(())
        }
    }
}
