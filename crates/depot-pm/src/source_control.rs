//! Source-control collaborator interfaces and the repository manager
//!
//! The engine never talks to a version-control tool directly. A
//! [`RepositoryProvider`] clones/updates repository copies and creates working
//! copies from them; [`RepositoryManager`] owns the on-disk repository cache and
//! makes sure each repository is fetched at most once per workspace instance.

use crate::delegate::WorkspaceDelegate;
use crate::fsutil;
use crate::identity::RepositorySpecifier;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by source-control collaborators
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceControlError {
    #[error("failed to fetch '{repository}': {message}")]
    FetchFailed { repository: String, message: String },

    #[error("revision '{0}' does not exist")]
    RevisionNotFound(String),

    #[error("'{0}' is not a tag, branch or revision")]
    UnknownReference(String),

    #[error("file '{}' does not exist at revision '{revision}'", path.display())]
    FileNotFound { path: PathBuf, revision: String },

    #[error("no working copy at '{}'", .0.display())]
    MissingWorkingCopy(PathBuf),

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("source control operation failed at '{}': {message}", path.display())]
    Io { path: PathBuf, message: String },
}

/// An immutable revision identifier (commit hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(identifier: impl Into<String>) -> Self {
        Revision(identifier.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read access to a fetched repository copy
pub trait Repository: Send + Sync {
    fn tags(&self) -> Result<Vec<String>, SourceControlError>;

    /// Resolve a tag, branch or revision identifier
    fn resolve_revision(&self, identifier: &str) -> Result<Revision, SourceControlError>;

    fn exists(&self, revision: &Revision) -> bool;

    /// Read a file at a revision without creating a working copy
    fn read_file(&self, revision: &Revision, path: &Path) -> Result<Vec<u8>, SourceControlError>;
}

/// A checked-out tree
pub trait WorkingCopy: Send {
    fn current_revision(&self) -> Result<Revision, SourceControlError>;

    fn checkout_revision(&mut self, revision: &Revision) -> Result<(), SourceControlError>;

    /// Create a branch at the current revision and switch to it
    fn checkout_new_branch(&mut self, name: &str) -> Result<(), SourceControlError>;

    fn has_uncommitted_changes(&self) -> bool;

    fn exists(&self, revision: &Revision) -> bool;
}

/// Clones repositories and creates working copies
pub trait RepositoryProvider: Send + Sync {
    /// Create a fresh copy of `repository` at `path`
    fn fetch(&self, repository: &RepositorySpecifier, path: &Path) -> Result<(), SourceControlError>;

    /// Refresh an existing copy at `path`
    fn update(&self, repository: &RepositorySpecifier, path: &Path) -> Result<(), SourceControlError>;

    fn open(&self, repository: &RepositorySpecifier, path: &Path) -> Result<Arc<dyn Repository>, SourceControlError>;

    /// Create a working copy at `destination` from the copy at `source`
    fn create_working_copy(
        &self,
        repository: &RepositorySpecifier,
        source: &Path,
        destination: &Path,
        editable: bool,
    ) -> Result<Box<dyn WorkingCopy>, SourceControlError>;

    fn open_working_copy(&self, path: &Path) -> Result<Box<dyn WorkingCopy>, SourceControlError>;
}

/// A repository copy known to be fetched
#[derive(Clone)]
pub struct RepositoryHandle {
    pub repository: RepositorySpecifier,
    pub path: PathBuf,
    provider: Arc<dyn RepositoryProvider>,
}

impl RepositoryHandle {
    pub fn open(&self) -> Result<Arc<dyn Repository>, SourceControlError> {
        self.provider.open(&self.repository, &self.path)
    }

    pub fn create_working_copy(
        &self,
        destination: &Path,
        editable: bool,
    ) -> Result<Box<dyn WorkingCopy>, SourceControlError> {
        self.provider
            .create_working_copy(&self.repository, &self.path, destination, editable)
    }
}

impl fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryHandle")
            .field("repository", &self.repository)
            .field("path", &self.path)
            .finish()
    }
}

/// Owner of the repository cache directory
pub struct RepositoryManager {
    path: PathBuf,
    provider: Arc<dyn RepositoryProvider>,
    delegate: Arc<dyn WorkspaceDelegate>,
    lookups: DashMap<RepositorySpecifier, Arc<OnceCell<RepositoryHandle>>>,
}

impl RepositoryManager {
    pub fn new(
        path: PathBuf,
        provider: Arc<dyn RepositoryProvider>,
        delegate: Arc<dyn WorkspaceDelegate>,
    ) -> Self {
        RepositoryManager {
            path,
            provider,
            delegate,
            lookups: DashMap::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn RepositoryProvider> {
        &self.provider
    }

    /// Forget earlier lookups; the next lookup of each repository refreshes it
    ///
    /// Called at the start of every operation that resolves, so one
    /// operation sees a consistent snapshot and the next one sees new tags.
    pub fn begin_operation(&self) {
        self.lookups.clear();
    }

    /// Fetch (or refresh) a repository, at most once per operation
    ///
    /// A failed lookup is not remembered; the next call tries again.
    pub fn lookup(
        &self,
        repository: &RepositorySpecifier,
        skip_update: bool,
    ) -> Result<RepositoryHandle, SourceControlError> {
        let cell = self
            .lookups
            .entry(repository.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(|| self.fetch_or_update(repository, skip_update))
            .cloned()
    }

    fn fetch_or_update(
        &self,
        repository: &RepositorySpecifier,
        skip_update: bool,
    ) -> Result<RepositoryHandle, SourceControlError> {
        let path = self.path.join(repository.storage_name());

        if path.exists() {
            if !skip_update {
                self.delegate.will_update(repository);
                tracing::debug!(%repository, "Updating repository");
                self.provider.update(repository, &path)?;
                self.delegate.did_update(repository);
            }
        } else {
            self.delegate.will_fetch(repository);
            tracing::info!(%repository, "Fetching repository");
            let fetched = self.provider.fetch(repository, &path);
            if fetched.is_err() {
                if let Err(e) = fsutil::remove_path(&path) {
                    tracing::debug!(path = %path.display(), error = %e, "Failed to remove partial fetch");
                }
            }
            let message = fetched.as_ref().err().map(ToString::to_string);
            self.delegate.did_fetch(repository, message.as_deref());
            fetched?;
        }

        Ok(RepositoryHandle {
            repository: repository.clone(),
            path,
            provider: self.provider.clone(),
        })
    }

    /// Drop every repository copy
    pub fn reset(&self) -> std::io::Result<()> {
        self.lookups.clear();
        fsutil::remove_path(&self.path)
    }
}
