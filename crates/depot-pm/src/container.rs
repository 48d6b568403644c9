//! Package containers
//!
//! A container answers the resolver's questions about one package: which
//! versions exist, what a branch or revision points at, and which constraints
//! a given binding imposes. Remote containers read manifests straight from the
//! repository copy at a revision; local and root containers read them from disk.

use crate::constraint::{PackageConstraint, ProductFilter};
use crate::executor::{wait_all, Executor};
use crate::identity::{PackageIdentity, PackageKind, PackageReference};
use crate::manifest::{Manifest, ManifestError, MANIFEST_FILE_NAME};
use crate::manifest_cache::ManifestCache;
use crate::semver::Version;
use crate::source_control::{Repository, RepositoryHandle, RepositoryManager, Revision, SourceControlError};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error(transparent)]
    SourceControl(#[from] SourceControlError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("version {version} of '{package}' does not exist")]
    UnknownVersion { package: PackageIdentity, version: Version },

    #[error("'{package}' can only be used unversioned")]
    Unversioned { package: PackageIdentity },
}

/// What a package was bound to by resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BoundVersion {
    Version(Version),
    Revision {
        revision: Revision,
        branch: Option<String>,
    },
    /// Root, local, edited or otherwise overridden packages
    Unversioned,
}

impl fmt::Display for BoundVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundVersion::Version(version) => write!(f, "{}", version),
            BoundVersion::Revision {
                branch: Some(branch),
                ..
            } => f.write_str(branch),
            BoundVersion::Revision { revision, .. } => write!(f, "{}", revision),
            BoundVersion::Unversioned => f.write_str("unversioned"),
        }
    }
}

/// Everything the resolver may ask about a package
pub trait PackageContainer: Send + Sync {
    fn package(&self) -> &PackageReference;

    /// Available versions, highest first
    fn versions(&self) -> Result<Vec<Version>, ContainerError>;

    fn revision_for_version(&self, version: &Version) -> Result<Revision, ContainerError>;

    /// Resolve a branch name or revision identifier
    fn resolve_revision(&self, identifier: &str) -> Result<Revision, ContainerError>;

    fn manifest(&self, binding: &BoundVersion) -> Result<Arc<Manifest>, ContainerError>;

    /// Constraints imposed by `binding` when `products` are used
    fn dependencies(
        &self,
        binding: &BoundVersion,
        products: &ProductFilter,
    ) -> Result<Vec<PackageConstraint>, ContainerError> {
        Ok(self.manifest(binding)?.dependency_constraints(products))
    }
}

/// Supplies containers by package reference
pub trait ContainerProvider: Send + Sync {
    fn container(&self, package: &PackageReference) -> Result<Arc<dyn PackageContainer>, ContainerError>;

    /// Warm up containers that are about to be needed
    fn prefetch(&self, _packages: &[PackageReference]) {}
}

/// Container backed by a package directory on disk
pub struct LocalPackageContainer {
    package: PackageReference,
    path: PathBuf,
    kind: PackageKind,
    manifests: Arc<ManifestCache>,
}

impl LocalPackageContainer {
    pub fn new(package: PackageReference, path: PathBuf, manifests: Arc<ManifestCache>) -> Self {
        let kind = match package.kind {
            PackageKind::Root => PackageKind::Root,
            PackageKind::Local | PackageKind::Remote => PackageKind::Local,
        };
        LocalPackageContainer {
            package,
            path,
            kind,
            manifests,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PackageContainer for LocalPackageContainer {
    fn package(&self) -> &PackageReference {
        &self.package
    }

    fn versions(&self) -> Result<Vec<Version>, ContainerError> {
        Ok(Vec::new())
    }

    fn revision_for_version(&self, version: &Version) -> Result<Revision, ContainerError> {
        Err(ContainerError::UnknownVersion {
            package: self.package.identity.clone(),
            version: version.clone(),
        })
    }

    fn resolve_revision(&self, _identifier: &str) -> Result<Revision, ContainerError> {
        Err(ContainerError::Unversioned {
            package: self.package.identity.clone(),
        })
    }

    fn manifest(&self, _binding: &BoundVersion) -> Result<Arc<Manifest>, ContainerError> {
        Ok(self.manifests.load(&self.path, self.kind)?)
    }
}

/// Container backed by a fetched repository
pub struct SourceControlContainer {
    package: PackageReference,
    handle: RepositoryHandle,
    repository: OnceCell<Arc<dyn Repository>>,
    tags: OnceCell<BTreeMap<Version, String>>,
    manifests: Arc<ManifestCache>,
    by_revision: Mutex<HashMap<Revision, Arc<Manifest>>>,
}

impl SourceControlContainer {
    pub fn new(package: PackageReference, handle: RepositoryHandle, manifests: Arc<ManifestCache>) -> Self {
        SourceControlContainer {
            package,
            handle,
            repository: OnceCell::new(),
            tags: OnceCell::new(),
            manifests,
            by_revision: Mutex::new(HashMap::new()),
        }
    }

    fn repository(&self) -> Result<&Arc<dyn Repository>, ContainerError> {
        Ok(self.repository.get_or_try_init(|| self.handle.open())?)
    }

    /// Tags that parse as versions; for duplicates (`1.0.0` and `v1.0.0`) the first wins
    fn tags(&self) -> Result<&BTreeMap<Version, String>, ContainerError> {
        self.tags.get_or_try_init(|| {
            let mut tags = BTreeMap::new();
            for tag in self.repository()?.tags()? {
                if let Ok(version) = Version::parse(&tag) {
                    tags.entry(version).or_insert(tag);
                }
            }
            Ok::<_, ContainerError>(tags)
        })
    }

    fn manifest_at(&self, revision: &Revision) -> Result<Arc<Manifest>, ContainerError> {
        if let Some(manifest) = self.by_revision.lock().get(revision) {
            return Ok(manifest.clone());
        }
        let contents = self
            .repository()?
            .read_file(revision, Path::new(MANIFEST_FILE_NAME))?;
        let path = self.handle.path.join(MANIFEST_FILE_NAME);
        let manifest = self
            .manifests
            .load_contents(&path, &contents, PackageKind::Remote)?;
        self.by_revision
            .lock()
            .insert(revision.clone(), manifest.clone());
        Ok(manifest)
    }
}

impl PackageContainer for SourceControlContainer {
    fn package(&self) -> &PackageReference {
        &self.package
    }

    fn versions(&self) -> Result<Vec<Version>, ContainerError> {
        Ok(self.tags()?.keys().rev().cloned().collect())
    }

    fn revision_for_version(&self, version: &Version) -> Result<Revision, ContainerError> {
        let tag = self
            .tags()?
            .get(version)
            .ok_or_else(|| ContainerError::UnknownVersion {
                package: self.package.identity.clone(),
                version: version.clone(),
            })?;
        Ok(self.repository()?.resolve_revision(tag)?)
    }

    fn resolve_revision(&self, identifier: &str) -> Result<Revision, ContainerError> {
        Ok(self.repository()?.resolve_revision(identifier)?)
    }

    fn manifest(&self, binding: &BoundVersion) -> Result<Arc<Manifest>, ContainerError> {
        let revision = match binding {
            BoundVersion::Version(version) => self.revision_for_version(version)?,
            BoundVersion::Revision { revision, .. } => revision.clone(),
            BoundVersion::Unversioned => {
                return Err(ContainerError::Unversioned {
                    package: self.package.identity.clone(),
                })
            }
        };
        self.manifest_at(&revision)
    }
}

/// The container provider used by workspace operations
///
/// Edited packages are served from their working copy so the resolver sees
/// the user's changes instead of the repository.
pub struct WorkspaceContainerProvider {
    repositories: Arc<RepositoryManager>,
    manifests: Arc<ManifestCache>,
    executor: Arc<Executor>,
    skip_update: bool,
    edited: HashMap<PackageIdentity, PathBuf>,
    containers: DashMap<PackageReference, Arc<dyn PackageContainer>>,
}

impl WorkspaceContainerProvider {
    pub fn new(
        repositories: Arc<RepositoryManager>,
        manifests: Arc<ManifestCache>,
        executor: Arc<Executor>,
        skip_update: bool,
    ) -> Self {
        WorkspaceContainerProvider {
            repositories,
            manifests,
            executor,
            skip_update,
            edited: HashMap::new(),
            containers: DashMap::new(),
        }
    }

    /// Serve `identity` from the working copy at `path`
    pub fn with_edited(mut self, edited: HashMap<PackageIdentity, PathBuf>) -> Self {
        self.edited = edited;
        self
    }

    fn create(&self, package: &PackageReference) -> Result<Arc<dyn PackageContainer>, ContainerError> {
        if let Some(path) = self.edited.get(&package.identity) {
            return Ok(Arc::new(LocalPackageContainer::new(
                package.clone(),
                path.clone(),
                self.manifests.clone(),
            )));
        }
        match package.repository() {
            Some(repository) => {
                let handle = self.repositories.lookup(&repository, self.skip_update)?;
                Ok(Arc::new(SourceControlContainer::new(
                    package.clone(),
                    handle,
                    self.manifests.clone(),
                )))
            }
            None => Ok(Arc::new(LocalPackageContainer::new(
                package.clone(),
                PathBuf::from(&package.location),
                self.manifests.clone(),
            ))),
        }
    }
}

impl ContainerProvider for WorkspaceContainerProvider {
    fn container(&self, package: &PackageReference) -> Result<Arc<dyn PackageContainer>, ContainerError> {
        if let Some(container) = self.containers.get(package) {
            return Ok(container.clone());
        }
        let container = self.create(package)?;
        Ok(self
            .containers
            .entry(package.clone())
            .or_insert(container)
            .clone())
    }

    /// Fetch the repositories of `packages` in parallel; errors resurface on
    /// the later `container` call
    fn prefetch(&self, packages: &[PackageReference]) {
        let handles: Vec<_> = packages
            .iter()
            .filter(|p| !self.edited.contains_key(&p.identity))
            .filter_map(PackageReference::repository)
            .map(|repository| {
                let repositories = self.repositories.clone();
                let skip_update = self.skip_update;
                self.executor
                    .spawn(move || repositories.lookup(&repository, skip_update).map(|_| ()))
            })
            .collect();
        for result in wait_all(handles) {
            if let Ok(Err(e)) = result {
                tracing::debug!(error = %e, "Prefetch failed");
            }
        }
    }
}
