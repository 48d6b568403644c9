//! Deciding whether dependency resolution is needed
//!
//! The analysis walks the current constraints against what is already on
//! disk: manifests come from existing checkouts, edited working copies and
//! local packages, never from the network. Nothing is mutated, so running it
//! on every invocation is cheap.

use crate::constraint::{PackageConstraint, ProductFilter, Requirement};
use crate::identity::{PackageIdentity, PackageKind, PackageReference};
use crate::manifest::{Manifest, ManifestError};
use crate::manifest_cache::ManifestCache;
use crate::pins::PinsStore;
use crate::semver::PrereleasePolicy;
use crate::state::{DependencyState, ManagedDependency, WorkspaceState};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Why a resolution is required
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionReason {
    /// Packages that are neither pinned nor managed
    NewPackages(Vec<PackageReference>),

    /// A package whose current state no longer satisfies its requirement
    PackageRequirementChange {
        package: PackageReference,
        state: DependencyState,
        requirement: Requirement,
    },

    Other(String),
}

impl fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionReason::NewPackages(packages) => {
                let names: Vec<_> = packages.iter().map(|p| p.identity.to_string()).collect();
                write!(f, "new packages: {}", names.join(", "))
            }
            ResolutionReason::PackageRequirementChange {
                package, requirement, ..
            } => write!(f, "requirement of '{}' changed to {}", package.identity, requirement),
            ResolutionReason::Other(reason) => f.write_str(reason),
        }
    }
}

/// Outcome of [`Precomputation::compute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrecomputeResult {
    NotRequired,
    Required(ResolutionReason),
}

impl PrecomputeResult {
    pub fn is_required(&self) -> bool {
        matches!(self, PrecomputeResult::Required(_))
    }

    pub fn reason(&self) -> Option<&ResolutionReason> {
        match self {
            PrecomputeResult::NotRequired => None,
            PrecomputeResult::Required(reason) => Some(reason),
        }
    }
}

/// Read-only view of the workspace used by the analysis
pub struct Precomputation<'a> {
    pub state: &'a WorkspaceState,
    pub pins: &'a PinsStore,
    pub manifests: &'a ManifestCache,
    pub checkouts: &'a Path,
    pub editables: &'a Path,
    pub policy: PrereleasePolicy,
}

enum Scope {
    RootLevel,
    Transitive,
}

impl Precomputation<'_> {
    /// Decide whether resolving `constraints` would change anything
    #[tracing::instrument(skip_all)]
    pub fn compute(&self, constraints: &[PackageConstraint]) -> PrecomputeResult {
        let mut roots = HashSet::new();
        let mut root_level = Vec::new();
        let mut other: Option<ResolutionReason> = None;

        for constraint in constraints {
            if constraint.package.is_root() {
                roots.insert(constraint.package.identity.clone());
                match self
                    .manifests
                    .load(Path::new(&constraint.package.location), PackageKind::Root)
                {
                    Ok(manifest) => root_level.extend(manifest.dependency_constraints(&constraint.products)),
                    Err(e) => {
                        other.get_or_insert(ResolutionReason::Other(e.to_string()));
                    }
                }
            } else {
                root_level.push(constraint.clone());
            }
        }

        let unversioned_overrides: HashSet<_> = root_level
            .iter()
            .filter(|c| c.requirement == Requirement::Unversioned)
            .map(|c| c.package.identity.clone())
            .collect();
        let revision_overrides: HashSet<_> = root_level
            .iter()
            .filter(|c| c.requirement.is_revision_based())
            .map(|c| c.package.identity.clone())
            .collect();

        let mut new_packages: Vec<PackageReference> = Vec::new();
        let mut mismatch: Option<ResolutionReason> = None;
        let mut visited: HashMap<PackageIdentity, ProductFilter> = HashMap::new();
        let mut queue: VecDeque<(Scope, PackageConstraint)> =
            root_level.into_iter().map(|c| (Scope::RootLevel, c)).collect();

        while let Some((scope, constraint)) = queue.pop_front() {
            let identity = constraint.package.identity.clone();
            if roots.contains(&identity) {
                continue;
            }

            let root_level = matches!(scope, Scope::RootLevel);
            let governed = if unversioned_overrides.contains(&identity) {
                root_level && constraint.requirement == Requirement::Unversioned
            } else if revision_overrides.contains(&identity) {
                root_level
            } else {
                true
            };

            let Some(dependency) = self.state.dependency(&identity) else {
                if self.pins.get(&identity).is_some() {
                    other.get_or_insert_with(|| {
                        ResolutionReason::Other(format!("'{}' is pinned but not checked out", identity))
                    });
                } else if !new_packages.iter().any(|p| p.identity == identity) {
                    new_packages.push(constraint.package.clone());
                }
                continue;
            };

            if governed && mismatch.is_none() {
                mismatch = self.requirement_change(dependency, &constraint);
            }

            let products = match visited.get(&identity) {
                Some(seen) if seen.covers(&constraint.products) => continue,
                Some(seen) => seen.merge(&constraint.products),
                None => constraint.products.clone(),
            };
            visited.insert(identity.clone(), products.clone());

            match self.load(dependency) {
                Ok(manifest) => queue.extend(
                    manifest
                        .dependency_constraints(&products)
                        .into_iter()
                        .map(|c| (Scope::Transitive, c)),
                ),
                Err(e) => {
                    other.get_or_insert(ResolutionReason::Other(e.to_string()));
                }
            }
        }

        if !new_packages.is_empty() {
            return PrecomputeResult::Required(ResolutionReason::NewPackages(new_packages));
        }
        if let Some(reason) = mismatch.or(other) {
            return PrecomputeResult::Required(reason);
        }

        for dependency in self.state.dependencies() {
            let identity = &dependency.package.identity;
            if !visited.contains_key(identity) && !dependency.is_edited() {
                return PrecomputeResult::Required(ResolutionReason::Other(format!(
                    "'{}' is no longer required",
                    identity
                )));
            }
            if dependency.checkout_state().is_some() && self.pins.get(identity).is_none() {
                return PrecomputeResult::Required(ResolutionReason::Other(format!(
                    "'{}' is not pinned",
                    identity
                )));
            }
        }
        if let Some(pin) = self.pins.iter().find(|pin| {
            self.state
                .dependency(&pin.package.identity)
                .map_or(true, |d| d.checkout_state().is_none())
        }) {
            return PrecomputeResult::Required(ResolutionReason::Other(format!(
                "'{}' is pinned but not checked out",
                pin.package.identity
            )));
        }

        PrecomputeResult::NotRequired
    }

    fn requirement_change(
        &self,
        dependency: &ManagedDependency,
        constraint: &PackageConstraint,
    ) -> Option<ResolutionReason> {
        let changed = match &dependency.state {
            DependencyState::Edited { .. } => false,
            DependencyState::Checkout(state) => {
                dependency.package.location != constraint.package.location
                    || !state.satisfies(&constraint.requirement, self.policy)
            }
            DependencyState::Local => {
                dependency.package.location != constraint.package.location
                    || constraint.requirement != Requirement::Unversioned
            }
        };
        changed.then(|| ResolutionReason::PackageRequirementChange {
            package: constraint.package.clone(),
            state: dependency.state.clone(),
            requirement: constraint.requirement.clone(),
        })
    }

    fn load(&self, dependency: &ManagedDependency) -> Result<Arc<Manifest>, ManifestError> {
        let (path, kind) = match &dependency.state {
            DependencyState::Checkout(_) => (self.checkouts.join(&dependency.subpath), PackageKind::Remote),
            DependencyState::Edited { unmanaged_path, .. } => (
                unmanaged_path
                    .clone()
                    .unwrap_or_else(|| self.editables.join(&dependency.subpath)),
                PackageKind::Local,
            ),
            DependencyState::Local => (PathBuf::from(&dependency.package.location), PackageKind::Local),
        };
        self.manifests.load(&path, kind)
    }
}
