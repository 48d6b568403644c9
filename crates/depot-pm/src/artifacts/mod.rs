//! Binary artifact acquisition
//!
//! Binary targets either point at a local path inside their package or at a
//! remote archive pinned by checksum. Remote archives are downloaded into
//! `artifacts/<identity>/`, verified, extracted into `artifacts/extract/<target>`
//! and moved into place as `artifacts/<identity>/<target>.artifactbundle`.
//!
//! A remote URL may also name an index document listing one archive per set
//! of target triples; the index is verified against the manifest checksum and
//! the archive for the host triple is fetched in its place.
//!
//! Once recorded, an artifact's checksum is fixed: a manifest that keeps the
//! URL but changes the checksum is rejected without downloading anything.

pub mod archive;
pub mod fetch;
pub mod index;

pub use archive::{ArchiveError, Archiver, FileArchiver};
pub use fetch::{HttpTransport, Transport, TransportError};
pub use index::{ArchiveIndex, IndexedArchive, INDEX_EXTENSION};

use crate::delegate::WorkspaceDelegate;
use crate::executor::{wait_all, Executor};
use crate::fsutil;
use crate::identity::{PackageIdentity, PackageReference};
use crate::manifest::BinarySource;
use crate::state::{ArtifactSource, ManagedArtifact, WorkspaceState};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Directory name suffix of an installed artifact
pub const ARTIFACT_EXTENSION: &str = "artifactbundle";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("failed downloading '{url}' which is required by binary target '{target}': {cause}")]
    Download {
        url: String,
        target: String,
        cause: TransportError,
    },

    #[error("failed extracting '{url}' which is required by binary target '{target}': {cause}")]
    Extraction {
        url: String,
        target: String,
        cause: ArchiveError,
    },

    #[error("checksum of downloaded artifact of binary target '{target}' ({actual}) does not match checksum specified by the manifest ({expected})")]
    ChecksumMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    #[error("failed retrieving '{url}': checksum of downloaded artifact of binary target '{target}' ({actual}) does not match checksum specified by the manifest ({expected})")]
    IndexChecksumMismatch {
        url: String,
        target: String,
        expected: String,
        actual: String,
    },

    #[error("failed retrieving '{url}': {message}")]
    IndexRetrieval { url: String, message: String },

    #[error("failed retrieving '{url}': No supported archive was found for '{triple}'")]
    UnsupportedTriple { url: String, triple: String },

    #[error("artifact of binary target '{target}' has changed checksum")]
    ChecksumChanged { target: String },

    #[error("downloaded archive of binary target '{target}' does not contain expected binary artifact '{target}'")]
    MissingExpectedArtifact { target: String },

    #[error("local binary target '{target}' does not exist at '{}'", path.display())]
    LocalNotFound { target: String, path: PathBuf },

    #[error("unexpected file type; supported extensions are: {}", archive::SUPPORTED_EXTENSIONS.join(", "))]
    UnsupportedFileType,

    #[error("file not found at path: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("failed installing binary target '{target}': {message}")]
    Io { target: String, message: String },
}

/// Hashes artifact bytes into the checksum text used by manifests
pub trait ChecksumAlgorithm: Send + Sync {
    fn checksum(&self, bytes: &[u8]) -> String;
}

/// Lowercase hex SHA-256
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Checksum;

impl ChecksumAlgorithm for Sha256Checksum {
    fn checksum(&self, bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

/// Checksum of a local archive, as a manifest would declare it
pub fn checksum_for_artifact(path: &Path, algorithm: &dyn ChecksumAlgorithm) -> Result<String, ArtifactError> {
    if !archive::is_supported_archive(path) {
        return Err(ArtifactError::UnsupportedFileType);
    }
    if !path.is_file() {
        return Err(ArtifactError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let bytes = fs::read(path).map_err(|_| ArtifactError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    Ok(algorithm.checksum(&bytes))
}

/// A binary target found in the resolved graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryTarget {
    pub package: PackageReference,
    pub target_name: String,
    pub source: BinarySource,

    /// Where the owning package lives; local sources are relative to it
    pub package_path: PathBuf,
}

/// Downloads, verifies and installs binary artifacts
pub struct ArtifactPipeline {
    directory: PathBuf,
    host_triple: String,
    transport: Arc<dyn Transport>,
    archiver: Arc<dyn Archiver>,
    checksum: Arc<dyn ChecksumAlgorithm>,
    delegate: Arc<dyn WorkspaceDelegate>,
    executor: Arc<Executor>,
}

struct DownloadJob {
    target: BinaryTarget,
    url: String,
    checksum: String,
}

impl ArtifactPipeline {
    pub fn new(
        directory: PathBuf,
        host_triple: String,
        transport: Arc<dyn Transport>,
        archiver: Arc<dyn Archiver>,
        checksum: Arc<dyn ChecksumAlgorithm>,
        delegate: Arc<dyn WorkspaceDelegate>,
        executor: Arc<Executor>,
    ) -> Self {
        ArtifactPipeline {
            directory,
            host_triple,
            transport,
            archiver,
            checksum,
            delegate,
            executor,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Bring the artifact records in `state` in line with `targets`
    ///
    /// Records of targets that are gone are dropped with their payload.
    /// Failures are per target: successful siblings are still recorded.
    #[tracing::instrument(skip_all, fields(targets = targets.len()))]
    pub fn update(&self, state: &mut WorkspaceState, targets: Vec<BinaryTarget>) -> Vec<ArtifactError> {
        let wanted: HashSet<(PackageIdentity, String)> = targets
            .iter()
            .map(|t| (t.package.identity.clone(), t.target_name.clone()))
            .collect();
        let stale: Vec<ManagedArtifact> = state
            .artifacts()
            .filter(|artifact| !wanted.contains(&artifact.key()))
            .cloned()
            .collect();
        for artifact in stale {
            tracing::debug!(target_name = %artifact.target_name, "Removing artifact of vanished target");
            self.remove_payload(&artifact);
            state.remove_artifact(&artifact.package.identity, &artifact.target_name);
        }

        let mut errors = Vec::new();
        let mut jobs = Vec::new();
        for target in targets {
            let existing = state
                .artifact(&target.package.identity, &target.target_name)
                .cloned();
            match &target.source {
                BinarySource::Local { path } => {
                    let path = target.package_path.join(path);
                    if !path.exists() {
                        errors.push(ArtifactError::LocalNotFound {
                            target: target.target_name.clone(),
                            path,
                        });
                        continue;
                    }
                    if let Some(existing) = &existing {
                        self.remove_payload(existing);
                    }
                    state.add_artifact(ManagedArtifact {
                        package: target.package.clone(),
                        target_name: target.target_name.clone(),
                        source: ArtifactSource::Local,
                        path,
                    });
                }
                BinarySource::Remote { url, checksum } => {
                    if let Some(existing) = &existing {
                        if let ArtifactSource::Remote {
                            url: recorded_url,
                            checksum: recorded_checksum,
                        } = &existing.source
                        {
                            if recorded_url == url {
                                if recorded_checksum != checksum {
                                    errors.push(ArtifactError::ChecksumChanged {
                                        target: target.target_name.clone(),
                                    });
                                    continue;
                                }
                                if existing.path.exists() {
                                    continue;
                                }
                            }
                        }
                        self.remove_payload(existing);
                        state.remove_artifact(&existing.package.identity, &existing.target_name);
                    }
                    jobs.push(DownloadJob {
                        url: url.clone(),
                        checksum: checksum.clone(),
                        target,
                    });
                }
            }
        }

        if jobs.is_empty() {
            return errors;
        }

        let names: Vec<String> = jobs.iter().map(|job| job.target.target_name.clone()).collect();
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let worker = self.worker();
                self.executor.spawn(move || worker.install(job))
            })
            .collect();
        for (target, result) in names.into_iter().zip(wait_all(handles)) {
            match result {
                Ok(Ok(artifact)) => state.add_artifact(artifact),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(ArtifactError::Io {
                    target,
                    message: e.to_string(),
                }),
            }
        }
        if let Err(e) = fs::remove_dir(self.directory.join("extract")) {
            tracing::debug!(error = %e, "Keeping artifact extraction directory");
        }
        errors
    }

    fn worker(&self) -> Worker {
        Worker {
            directory: self.directory.clone(),
            host_triple: self.host_triple.clone(),
            transport: self.transport.clone(),
            archiver: self.archiver.clone(),
            checksum: self.checksum.clone(),
            delegate: self.delegate.clone(),
        }
    }

    /// Delete an installed payload; local artifacts are never touched
    fn remove_payload(&self, artifact: &ManagedArtifact) {
        if artifact.source == ArtifactSource::Local || !artifact.path.starts_with(&self.directory) {
            return;
        }
        if let Err(e) = fsutil::remove_path(&artifact.path) {
            tracing::warn!(path = %artifact.path.display(), error = %e, "Failed to remove artifact");
        }
    }
}

/// The owned half of the pipeline that runs on worker threads
struct Worker {
    directory: PathBuf,
    host_triple: String,
    transport: Arc<dyn Transport>,
    archiver: Arc<dyn Archiver>,
    checksum: Arc<dyn ChecksumAlgorithm>,
    delegate: Arc<dyn WorkspaceDelegate>,
}

impl Worker {
    fn install(&self, job: DownloadJob) -> Result<ManagedArtifact, ArtifactError> {
        let target_name = job.target.target_name.clone();
        let (archive_url, archive_checksum) = if index::is_index_url(&job.url) {
            self.select_from_index(&job.url, &job.checksum, &target_name)?
        } else {
            (job.url.clone(), job.checksum.clone())
        };

        let package_directory = self.directory.join(job.target.package.identity.as_str());
        let file_name = url::Url::parse(&archive_url)
            .ok()
            .and_then(|url| url.path_segments().and_then(|s| s.last().map(str::to_string)))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{}.zip", target_name));
        let staged = package_directory.join(file_name);

        self.delegate.will_download_artifact(&archive_url);
        let downloaded = self.transport.download(&archive_url, &staged);
        self.delegate
            .did_download_artifact(&archive_url, downloaded.as_ref().err().map(|e| e.to_string()).as_deref());
        downloaded.map_err(|cause| ArtifactError::Download {
            url: archive_url.clone(),
            target: target_name.clone(),
            cause,
        })?;

        let result = self.verify_and_extract(&staged, &archive_url, &archive_checksum, &target_name, &package_directory);
        if let Err(e) = fsutil::remove_path(&staged) {
            tracing::debug!(path = %staged.display(), error = %e, "Failed to remove downloaded archive");
        }
        let path = result?;

        tracing::info!(target_name = %target_name, url = %archive_url, "Installed binary artifact");
        Ok(ManagedArtifact {
            package: job.target.package,
            target_name,
            source: ArtifactSource::Remote {
                url: job.url,
                checksum: job.checksum,
            },
            path,
        })
    }

    fn select_from_index(
        &self,
        url: &str,
        checksum: &str,
        target: &str,
    ) -> Result<(String, String), ArtifactError> {
        let retrieval = |message: String| ArtifactError::IndexRetrieval {
            url: url.to_string(),
            message,
        };

        let bytes = self.transport.get(url).map_err(|e| retrieval(e.to_string()))?;
        let actual = self.checksum.checksum(&bytes);
        if actual != checksum {
            return Err(ArtifactError::IndexChecksumMismatch {
                url: url.to_string(),
                target: target.to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }
        let index = ArchiveIndex::parse(&bytes).map_err(|e| retrieval(e.to_string()))?;
        let archive = index
            .select(&self.host_triple)
            .ok_or_else(|| ArtifactError::UnsupportedTriple {
                url: url.to_string(),
                triple: self.host_triple.clone(),
            })?;
        let archive_url = index::archive_url(url, &archive.file_name).map_err(|e| retrieval(e.to_string()))?;
        Ok((archive_url, archive.checksum.clone()))
    }

    fn verify_and_extract(
        &self,
        staged: &Path,
        url: &str,
        expected: &str,
        target: &str,
        package_directory: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        let io_error = |e: std::io::Error| ArtifactError::Io {
            target: target.to_string(),
            message: e.to_string(),
        };

        let bytes = fs::read(staged).map_err(io_error)?;
        let actual = self.checksum.checksum(&bytes);
        if actual != expected {
            return Err(ArtifactError::ChecksumMismatch {
                target: target.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        let extract_directory = self.directory.join("extract").join(target);
        fsutil::remove_path(&extract_directory).map_err(io_error)?;
        self.archiver
            .extract(staged, &extract_directory)
            .map_err(|cause| ArtifactError::Extraction {
                url: url.to_string(),
                target: target.to_string(),
                cause,
            })?;

        let bundle_name = format!("{}.{}", target, ARTIFACT_EXTENSION);
        let extracted = extract_directory.join(&bundle_name);
        let result = if extracted.exists() {
            let destination = package_directory.join(&bundle_name);
            fsutil::remove_path(&destination)
                .and_then(|_| fs::rename(&extracted, &destination))
                .map(|_| destination)
                .map_err(io_error)
        } else {
            Err(ArtifactError::MissingExpectedArtifact {
                target: target.to_string(),
            })
        };
        if let Err(e) = fsutil::remove_path(&extract_directory) {
            tracing::debug!(path = %extract_directory.display(), error = %e, "Failed to remove extraction directory");
        }
        result
    }
}
