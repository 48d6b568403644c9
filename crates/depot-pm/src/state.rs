//! Managed dependency and artifact ledger (workspace-state.json)
//!
//! The ledger records what the workspace has materialized on disk: one
//! [`ManagedDependency`] per resolved package and one [`ManagedArtifact`] per
//! binary target. It is owned by the workspace and written atomically after
//! every operation that changes it.

use crate::constraint::Requirement;
use crate::fsutil;
use crate::identity::{PackageIdentity, PackageReference};
use crate::semver::{PrereleasePolicy, Version};
use crate::source_control::Revision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// State file name inside the data directory
pub const STATE_FILE_NAME: &str = "workspace-state.json";

/// Ledger format version
pub const STATE_VERSION: u32 = 1;

/// Errors that can occur while reading or writing the ledger
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to access workspace state: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse workspace state: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Unsupported workspace state version: {0} (expected {STATE_VERSION})")]
    UnsupportedVersion(u32),
}

/// A materialized revision, optionally reached through a version or branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckoutState {
    pub revision: Revision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl CheckoutState {
    pub fn version(version: Version, revision: Revision) -> Self {
        CheckoutState {
            revision,
            version: Some(version),
            branch: None,
        }
    }

    pub fn branch(name: impl Into<String>, revision: Revision) -> Self {
        CheckoutState {
            revision,
            version: None,
            branch: Some(name.into()),
        }
    }

    pub fn revision(revision: Revision) -> Self {
        CheckoutState {
            revision,
            version: None,
            branch: None,
        }
    }

    /// The narrowest requirement that reproduces this state
    pub fn requirement(&self) -> Requirement {
        match (&self.version, &self.branch) {
            (Some(version), _) => Requirement::Exact(version.clone()),
            (None, Some(branch)) => Requirement::Branch(branch.clone()),
            (None, None) => Requirement::Revision(self.revision.to_string()),
        }
    }

    /// Whether this state still satisfies `requirement`
    pub fn satisfies(&self, requirement: &Requirement, policy: PrereleasePolicy) -> bool {
        match requirement {
            Requirement::Exact(_) | Requirement::Range(_) => self
                .version
                .as_ref()
                .is_some_and(|version| requirement.admits_version(version, policy)),
            Requirement::Branch(branch) => self.branch.as_deref() == Some(branch.as_str()),
            Requirement::Revision(identifier) => {
                self.version.is_none() && self.branch.is_none() && self.revision.as_str() == identifier
            }
            Requirement::Unversioned => false,
        }
    }
}

impl fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.version, &self.branch) {
            (Some(version), _) => write!(f, "{}", version),
            (None, Some(branch)) => f.write_str(branch),
            (None, None) => write!(f, "{}", self.revision),
        }
    }
}

/// How a managed dependency is materialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DependencyState {
    /// A resolver-managed checkout under `checkouts/`
    Checkout(CheckoutState),

    /// A user-writable working copy replacing the checkout
    Edited {
        /// State to restore on unedit; `None` if the package left the graph
        #[serde(default, skip_serializing_if = "Option::is_none")]
        basis: Option<Box<ManagedDependency>>,

        /// Working copy outside the editables directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unmanaged_path: Option<PathBuf>,
    },

    /// A path dependency; nothing to materialize
    Local,
}

/// Ledger entry for one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDependency {
    pub package: PackageReference,

    /// Directory name under `checkouts/` or the editables directory
    pub subpath: PathBuf,

    pub state: DependencyState,
}

impl ManagedDependency {
    pub fn checkout(package: PackageReference, state: CheckoutState) -> Self {
        let subpath = default_subpath(&package);
        ManagedDependency {
            package,
            subpath,
            state: DependencyState::Checkout(state),
        }
    }

    pub fn local(package: PackageReference) -> Self {
        ManagedDependency {
            subpath: PathBuf::from(&package.location),
            package,
            state: DependencyState::Local,
        }
    }

    /// The edited incarnation of this dependency, keeping `self` as basis
    pub fn edited(self, unmanaged_path: Option<PathBuf>) -> Self {
        ManagedDependency {
            package: self.package.clone(),
            subpath: self.subpath.clone(),
            state: DependencyState::Edited {
                basis: Some(Box::new(self)),
                unmanaged_path,
            },
        }
    }

    /// This dependency with nothing to restore when its edit ends
    pub fn without_basis(mut self) -> Self {
        if let DependencyState::Edited { basis, .. } = &mut self.state {
            *basis = None;
        }
        self
    }

    pub fn checkout_state(&self) -> Option<&CheckoutState> {
        match &self.state {
            DependencyState::Checkout(state) => Some(state),
            DependencyState::Edited { .. } | DependencyState::Local => None,
        }
    }

    pub fn is_edited(&self) -> bool {
        matches!(self.state, DependencyState::Edited { .. })
    }

    pub fn is_local(&self) -> bool {
        matches!(self.state, DependencyState::Local)
    }

    pub fn basis(&self) -> Option<&ManagedDependency> {
        match &self.state {
            DependencyState::Edited { basis, .. } => basis.as_deref(),
            DependencyState::Checkout(_) | DependencyState::Local => None,
        }
    }
}

/// Directory name for a package: the last component of its location, as spelled
pub fn default_subpath(package: &PackageReference) -> PathBuf {
    let trimmed = package.location.trim_end_matches(['/', '\\']);
    let last = trimmed
        .rsplit(['/', '\\', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(package.identity.as_str());
    PathBuf::from(last.strip_suffix(".git").unwrap_or(last))
}

/// Where a binary artifact came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArtifactSource {
    Remote { url: String, checksum: String },
    Local,
}

/// Ledger entry for one binary target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedArtifact {
    pub package: PackageReference,
    pub target_name: String,
    pub source: ArtifactSource,
    pub path: PathBuf,
}

impl ManagedArtifact {
    pub fn key(&self) -> (PackageIdentity, String) {
        (self.package.identity.clone(), self.target_name.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default)]
    dependencies: Vec<ManagedDependency>,
    #[serde(default)]
    artifacts: Vec<ManagedArtifact>,
}

/// In-memory ledger bound to its file
#[derive(Debug, Clone)]
pub struct WorkspaceState {
    path: PathBuf,
    dependencies: BTreeMap<PackageIdentity, ManagedDependency>,
    artifacts: BTreeMap<(PackageIdentity, String), ManagedArtifact>,
}

impl WorkspaceState {
    /// An empty ledger that will be saved to `path`
    pub fn new(path: PathBuf) -> Self {
        WorkspaceState {
            path,
            dependencies: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Load the ledger; a missing file yields an empty one
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let mut state = WorkspaceState::new(path.to_path_buf());
        if !path.exists() {
            return Ok(state);
        }
        let document: StateDocument = serde_json::from_slice(&std::fs::read(path)?)?;
        if document.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(document.version));
        }
        for dependency in document.dependencies {
            state
                .dependencies
                .insert(dependency.package.identity.clone(), dependency);
        }
        for artifact in document.artifacts {
            state.artifacts.insert(artifact.key(), artifact);
        }
        Ok(state)
    }

    /// Atomically write the ledger
    pub fn save(&self) -> Result<(), StateError> {
        let document = StateDocument {
            version: STATE_VERSION,
            dependencies: self.dependencies.values().cloned().collect(),
            artifacts: self.artifacts.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        fsutil::write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dependency(&self, identity: &PackageIdentity) -> Option<&ManagedDependency> {
        self.dependencies.get(identity)
    }

    /// Dependencies ordered by identity
    pub fn dependencies(&self) -> impl Iterator<Item = &ManagedDependency> {
        self.dependencies.values()
    }

    pub fn add_dependency(&mut self, dependency: ManagedDependency) {
        self.dependencies
            .insert(dependency.package.identity.clone(), dependency);
    }

    pub fn remove_dependency(&mut self, identity: &PackageIdentity) -> Option<ManagedDependency> {
        self.dependencies.remove(identity)
    }

    pub fn artifact(&self, identity: &PackageIdentity, target_name: &str) -> Option<&ManagedArtifact> {
        self.artifacts
            .get(&(identity.clone(), target_name.to_string()))
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ManagedArtifact> {
        self.artifacts.values()
    }

    pub fn add_artifact(&mut self, artifact: ManagedArtifact) {
        self.artifacts.insert(artifact.key(), artifact);
    }

    pub fn remove_artifact(&mut self, identity: &PackageIdentity, target_name: &str) -> Option<ManagedArtifact> {
        self.artifacts
            .remove(&(identity.clone(), target_name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty() && self.artifacts.is_empty()
    }

    /// Forget everything in memory; the file is left alone
    pub fn clear(&mut self) {
        self.dependencies.clear();
        self.artifacts.clear();
    }
}
