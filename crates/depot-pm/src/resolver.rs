//! Dependency resolution
//!
//! A backtracking solver over package containers. Packages are decided in
//! discovery order; for each one the candidates are tried in preference order
//! (an existing pin first, then the highest admitted version) and a conflict
//! further down backtracks to the next candidate.
//!
//! Root-level unversioned constraints (root packages, local dependencies of
//! roots, edited packages) override every other requirement on their
//! identity, and root-level branch or revision requirements override the
//! version requirements of transitive consumers.

use crate::constraint::{PackageConstraint, ProductFilter, Requirement};
use crate::container::{BoundVersion, ContainerError, ContainerProvider, PackageContainer};
use crate::identity::{PackageIdentity, PackageKind, PackageReference};
use crate::manifest::Manifest;
use crate::semver::{PrereleasePolicy, Version};
use crate::state::CheckoutState;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during dependency resolution
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// No assignment satisfies this (minimal) set of requirements
    #[error("Dependencies could not be resolved because {}", describe_conflict(.0))]
    Conflict(Vec<ConflictingRequirement>),

    #[error("package '{package}' is required using a revision-based requirement and it depends on local package '{local}', which is not supported")]
    RevisionDependsOnLocal { package: String, local: String },

    #[error("cyclic dependency declaration found: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// Only raised when resolving strictly from pins
    #[error("'{0}' is not pinned")]
    NotPinned(PackageIdentity),

    /// Only raised when resolving strictly from pins
    #[error("'{package}' is pinned at {pin}, which does not satisfy {requirement}")]
    PinNotSatisfying {
        package: PackageIdentity,
        pin: String,
        requirement: Requirement,
    },

    #[error(transparent)]
    Container(#[from] ContainerError),
}

fn describe_conflict(requirements: &[ConflictingRequirement]) -> String {
    match requirements {
        [only] => format!("{} and no matching version exists", only),
        _ => requirements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" and "),
    }
}

/// Who imposed a requirement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Consumer {
    /// Constraints handed directly to the resolver
    Workspace,

    Package(PackageReference, BoundVersion),
}

impl Consumer {
    fn is_root_level(&self) -> bool {
        match self {
            Consumer::Workspace => true,
            Consumer::Package(package, _) => package.is_root(),
        }
    }
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consumer::Workspace => f.write_str("root"),
            Consumer::Package(package, BoundVersion::Unversioned) => write!(f, "'{}'", package.identity),
            Consumer::Package(package, binding) => write!(f, "'{}' {}", package.identity, binding),
        }
    }
}

/// One member of a conflicting requirement set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingRequirement {
    pub consumer: Consumer,
    pub package: PackageIdentity,
    pub requirement: Requirement,
}

impl fmt::Display for ConflictingRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} depends on '{}' {}", self.consumer, self.package, self.requirement)
    }
}

/// A package and what it was bound to
#[derive(Debug, Clone)]
pub struct ResolvedBinding {
    /// The reference the package is materialized from
    pub package: PackageReference,
    pub binding: BoundVersion,
    pub products: ProductFilter,
    /// Identities of direct dependencies, in declaration order
    pub dependencies: Vec<PackageIdentity>,
    pub manifest: Arc<Manifest>,
}

/// Result of a successful resolution, in discovery order
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub bindings: Vec<ResolvedBinding>,
}

impl Resolution {
    pub fn get(&self, identity: &PackageIdentity) -> Option<&ResolvedBinding> {
        self.bindings.iter().find(|b| &b.package.identity == identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedBinding> {
        self.bindings.iter()
    }

    /// Report the first declaration cycle reachable from the graph, by manifest name
    fn check_cycles(&self) -> Result<(), ResolutionError> {
        let index: HashMap<&PackageIdentity, usize> = self
            .bindings
            .iter()
            .enumerate()
            .map(|(i, b)| (&b.package.identity, i))
            .collect();
        let mut marks = vec![Mark::Unvisited; self.bindings.len()];
        let mut stack = Vec::new();

        for start in 0..self.bindings.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &index, &mut marks, &mut stack) {
                    let chain = cycle
                        .into_iter()
                        .map(|i| self.bindings[i].manifest.name.clone())
                        .collect();
                    return Err(ResolutionError::Cycle { chain });
                }
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        index: &HashMap<&PackageIdentity, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::InProgress;
        stack.push(node);
        for dependency in &self.bindings[node].dependencies {
            let Some(&next) = index.get(dependency) else {
                continue;
            };
            match marks[next] {
                Mark::InProgress => {
                    let mut chain = stack.clone();
                    chain.push(next);
                    return Some(chain);
                }
                Mark::Unvisited => {
                    if let Some(chain) = self.visit(next, index, marks, stack) {
                        return Some(chain);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

#[derive(Debug, Clone)]
enum Override {
    /// Always bound unversioned, from this reference
    Unversioned(PackageReference),

    /// Only root-level requirements count
    RevisionBased,
}

#[derive(Debug, Clone)]
struct Assignment {
    package: PackageReference,
    binding: BoundVersion,
    /// Requirement a revision-based binding was derived from
    origin: Option<Requirement>,
    products: ProductFilter,
    dependencies: Vec<PackageConstraint>,
}

#[derive(Debug, Clone, Default)]
struct Partial {
    order: Vec<PackageIdentity>,
    seen: HashSet<PackageIdentity>,
    requirements: HashMap<PackageIdentity, Vec<(Consumer, PackageConstraint)>>,
    assignments: HashMap<PackageIdentity, Assignment>,
}

enum Failure {
    /// Backtrack and try the next candidate
    Conflict(ResolutionError),

    /// Abort the whole resolution
    Fatal(ResolutionError),
}

impl Failure {
    fn into_error(self) -> ResolutionError {
        match self {
            Failure::Conflict(e) | Failure::Fatal(e) => e,
        }
    }
}

impl From<ContainerError> for Failure {
    fn from(e: ContainerError) -> Self {
        Failure::Fatal(ResolutionError::Container(e))
    }
}

type Candidate = (BoundVersion, Option<Requirement>);

/// Dependency resolver
pub struct Resolver<'a> {
    provider: &'a dyn ContainerProvider,
    pins: BTreeMap<PackageIdentity, CheckoutState>,
    policy: PrereleasePolicy,
    locked: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(provider: &'a dyn ContainerProvider) -> Self {
        Resolver {
            provider,
            pins: BTreeMap::new(),
            policy: PrereleasePolicy::default(),
            locked: false,
        }
    }

    /// Only accept pinned states; every versioned or revision-based package must be pinned
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Prefer these checkout states where they still satisfy every requirement
    pub fn with_pins(mut self, pins: BTreeMap<PackageIdentity, CheckoutState>) -> Self {
        self.pins = pins;
        self
    }

    pub fn with_prerelease_policy(mut self, policy: PrereleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve root-level constraints into a complete assignment
    #[tracing::instrument(skip_all, fields(constraints = constraints.len()))]
    pub fn resolve(&self, constraints: Vec<PackageConstraint>) -> Result<Resolution, ResolutionError> {
        let overrides = self.overrides(&constraints)?;
        let packages: Vec<_> = constraints.iter().map(|c| c.package.clone()).collect();
        self.provider.prefetch(&packages);

        let mut partial = Partial::default();
        self.add_constraints(&overrides, &mut partial, Consumer::Workspace, constraints)
            .map_err(Failure::into_error)?;
        let solved = self
            .solve(&overrides, partial)
            .map_err(Failure::into_error)?;

        let resolution = self.finish(solved)?;
        tracing::debug!(packages = resolution.bindings.len(), "Resolved dependencies");
        Ok(resolution)
    }

    /// Collect root-level overrides, including the declarations of root packages
    fn overrides(
        &self,
        constraints: &[PackageConstraint],
    ) -> Result<HashMap<PackageIdentity, Override>, ResolutionError> {
        let mut root_level = Vec::new();
        for constraint in constraints {
            root_level.push(constraint.clone());
            if constraint.package.is_root() && constraint.requirement == Requirement::Unversioned {
                let container = self.provider.container(&constraint.package)?;
                root_level.extend(container.dependencies(&BoundVersion::Unversioned, &constraint.products)?);
            }
        }

        let mut overrides = HashMap::new();
        for constraint in root_level.iter().filter(|c| c.requirement == Requirement::Unversioned) {
            overrides
                .entry(constraint.package.identity.clone())
                .or_insert_with(|| Override::Unversioned(constraint.package.clone()));
        }
        for constraint in root_level.iter().filter(|c| c.requirement.is_revision_based()) {
            overrides
                .entry(constraint.package.identity.clone())
                .or_insert(Override::RevisionBased);
        }
        Ok(overrides)
    }

    /// Whether a requirement from `consumer` constrains `identity`
    fn is_governed(
        overrides: &HashMap<PackageIdentity, Override>,
        identity: &PackageIdentity,
        consumer: &Consumer,
    ) -> bool {
        match overrides.get(identity) {
            None => true,
            Some(Override::Unversioned(_)) => false,
            Some(Override::RevisionBased) => consumer.is_root_level(),
        }
    }

    fn governed(
        overrides: &HashMap<PackageIdentity, Override>,
        partial: &Partial,
        identity: &PackageIdentity,
    ) -> Vec<(Consumer, PackageConstraint)> {
        partial
            .requirements
            .get(identity)
            .map(|requirements| {
                requirements
                    .iter()
                    .filter(|(consumer, _)| Self::is_governed(overrides, identity, consumer))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn solve(&self, overrides: &HashMap<PackageIdentity, Override>, partial: Partial) -> Result<Partial, Failure> {
        let Some(identity) = partial
            .order
            .iter()
            .find(|identity| !partial.assignments.contains_key(*identity))
            .cloned()
        else {
            return Ok(partial);
        };

        let (package, candidates) = self.candidates(overrides, &partial, &identity)?;
        let mut first_conflict = None;
        for (binding, origin) in candidates {
            let mut next = partial.clone();
            let attempt = self
                .assign(overrides, &mut next, &identity, package.clone(), binding, origin)
                .and_then(|()| self.solve(overrides, next));
            match attempt {
                Ok(solved) => return Ok(solved),
                Err(Failure::Fatal(e)) => return Err(Failure::Fatal(e)),
                Err(Failure::Conflict(e)) => {
                    first_conflict.get_or_insert(e);
                }
            }
        }

        match first_conflict {
            Some(e) => Err(Failure::Conflict(e)),
            None => Err(Failure::Conflict(self.conflict(overrides, &partial, &identity)?)),
        }
    }

    /// Candidates for an undecided package, most preferred first
    fn candidates(
        &self,
        overrides: &HashMap<PackageIdentity, Override>,
        partial: &Partial,
        identity: &PackageIdentity,
    ) -> Result<(PackageReference, Vec<Candidate>), Failure> {
        if let Some(Override::Unversioned(package)) = overrides.get(identity) {
            return Ok((package.clone(), vec![(BoundVersion::Unversioned, None)]));
        }

        let governed = Self::governed(overrides, partial, identity);
        let Some((_, first)) = governed.first() else {
            return Err(Failure::Conflict(self.conflict(overrides, partial, identity)?));
        };
        let package = first.package.clone();

        if governed.iter().any(|(_, c)| c.requirement == Requirement::Unversioned) {
            if governed.iter().all(|(_, c)| c.requirement == Requirement::Unversioned) {
                return Ok((package, vec![(BoundVersion::Unversioned, None)]));
            }
            return Err(Failure::Conflict(self.conflict(overrides, partial, identity)?));
        }

        if self.locked {
            return self.pinned_candidate(identity, package, &governed);
        }

        if let Some((_, revision_based)) = governed.iter().find(|(_, c)| c.requirement.is_revision_based()) {
            let requirement = revision_based.requirement.clone();
            if governed.iter().any(|(_, c)| c.requirement != requirement) {
                return Err(Failure::Conflict(self.conflict(overrides, partial, identity)?));
            }
            let container = self.provider.container(&package)?;
            let binding = match &requirement {
                Requirement::Branch(branch) => {
                    let pinned = self
                        .pins
                        .get(identity)
                        .filter(|pin| pin.branch.as_deref() == Some(branch.as_str()));
                    let revision = match pinned {
                        Some(pin) => pin.revision.clone(),
                        None => container.resolve_revision(branch)?,
                    };
                    BoundVersion::Revision {
                        revision,
                        branch: Some(branch.clone()),
                    }
                }
                Requirement::Revision(identifier) => BoundVersion::Revision {
                    revision: container.resolve_revision(identifier)?,
                    branch: None,
                },
                Requirement::Exact(_) | Requirement::Range(_) | Requirement::Unversioned => {
                    return Err(Failure::Conflict(self.conflict(overrides, partial, identity)?));
                }
            };
            return Ok((package, vec![(binding, Some(requirement))]));
        }

        let container = self.provider.container(&package)?;
        let mut versions: Vec<Version> = container
            .versions()?
            .into_iter()
            .filter(|version| {
                governed
                    .iter()
                    .all(|(_, c)| c.requirement.admits_version(version, self.policy))
            })
            .collect();
        if versions.is_empty() {
            return Err(Failure::Conflict(self.conflict(overrides, partial, identity)?));
        }

        let pinned = self.pins.get(identity).and_then(|pin| pin.version.as_ref());
        if let Some(position) = pinned.and_then(|pinned| versions.iter().position(|v| v == pinned)) {
            let version = versions.remove(position);
            versions.insert(0, version);
        }

        Ok((
            package,
            versions
                .into_iter()
                .map(|version| (BoundVersion::Version(version), None))
                .collect(),
        ))
    }

    /// The single candidate allowed when resolving strictly from pins
    fn pinned_candidate(
        &self,
        identity: &PackageIdentity,
        package: PackageReference,
        governed: &[(Consumer, PackageConstraint)],
    ) -> Result<(PackageReference, Vec<Candidate>), Failure> {
        let pin = self
            .pins
            .get(identity)
            .ok_or_else(|| Failure::Fatal(ResolutionError::NotPinned(identity.clone())))?;
        if let Some((_, unsatisfied)) = governed
            .iter()
            .find(|(_, c)| !pin.satisfies(&c.requirement, self.policy))
        {
            return Err(Failure::Fatal(ResolutionError::PinNotSatisfying {
                package: identity.clone(),
                pin: pin.to_string(),
                requirement: unsatisfied.requirement.clone(),
            }));
        }

        let candidate = match (&pin.version, &pin.branch) {
            (Some(version), _) => (BoundVersion::Version(version.clone()), None),
            (None, branch) => (
                BoundVersion::Revision {
                    revision: pin.revision.clone(),
                    branch: branch.clone(),
                },
                governed.first().map(|(_, c)| c.requirement.clone()),
            ),
        };
        Ok((package, vec![candidate]))
    }

    fn assign(
        &self,
        overrides: &HashMap<PackageIdentity, Override>,
        partial: &mut Partial,
        identity: &PackageIdentity,
        package: PackageReference,
        binding: BoundVersion,
        origin: Option<Requirement>,
    ) -> Result<(), Failure> {
        let products = partial
            .requirements
            .get(identity)
            .into_iter()
            .flatten()
            .fold(ProductFilter::default(), |acc, (_, c)| acc.merge(&c.products));

        let container = self.provider.container(&package)?;
        let dependencies = container.dependencies(&binding, &products)?;
        self.check_revision_dependencies(container.as_ref(), &binding, &dependencies)?;

        let undecided: Vec<_> = dependencies
            .iter()
            .filter(|d| !partial.assignments.contains_key(&d.package.identity))
            .map(|d| d.package.clone())
            .collect();
        self.provider.prefetch(&undecided);

        partial.assignments.insert(
            identity.clone(),
            Assignment {
                package: package.clone(),
                binding: binding.clone(),
                origin,
                products,
                dependencies: dependencies.clone(),
            },
        );
        self.add_constraints(overrides, partial, Consumer::Package(package, binding), dependencies)
    }

    /// Record requirements, checking decided packages and widening their products
    fn add_constraints(
        &self,
        overrides: &HashMap<PackageIdentity, Override>,
        partial: &mut Partial,
        consumer: Consumer,
        constraints: Vec<PackageConstraint>,
    ) -> Result<(), Failure> {
        let mut queue: VecDeque<(Consumer, PackageConstraint)> =
            constraints.into_iter().map(|c| (consumer.clone(), c)).collect();

        while let Some((consumer, constraint)) = queue.pop_front() {
            let identity = constraint.package.identity.clone();
            let requirements = partial.requirements.entry(identity.clone()).or_default();
            if requirements.iter().any(|(c, k)| c == &consumer && k == &constraint) {
                continue;
            }
            requirements.push((consumer.clone(), constraint.clone()));
            if partial.seen.insert(identity.clone()) {
                partial.order.push(identity.clone());
            }

            let Some(assignment) = partial.assignments.get(&identity) else {
                continue;
            };
            if Self::is_governed(overrides, &identity, &consumer)
                && !self.satisfies(assignment, &constraint.requirement)
            {
                return Err(Failure::Conflict(self.conflict(overrides, partial, &identity)?));
            }
            if assignment.products.covers(&constraint.products) {
                continue;
            }

            let products = assignment.products.merge(&constraint.products);
            let package = assignment.package.clone();
            let binding = assignment.binding.clone();
            let container = self.provider.container(&package)?;
            let dependencies = container.dependencies(&binding, &products)?;
            self.check_revision_dependencies(container.as_ref(), &binding, &dependencies)?;

            if let Some(assignment) = partial.assignments.get_mut(&identity) {
                let added: Vec<_> = dependencies
                    .iter()
                    .filter(|d| !assignment.dependencies.contains(d))
                    .cloned()
                    .collect();
                assignment.products = products;
                assignment.dependencies = dependencies;
                let owner = Consumer::Package(package, binding);
                queue.extend(added.into_iter().map(|d| (owner.clone(), d)));
            }
        }
        Ok(())
    }

    fn satisfies(&self, assignment: &Assignment, requirement: &Requirement) -> bool {
        match &assignment.binding {
            BoundVersion::Unversioned => requirement == &Requirement::Unversioned,
            BoundVersion::Version(version) => requirement.admits_version(version, self.policy),
            BoundVersion::Revision { .. } => assignment.origin.as_ref() == Some(requirement),
        }
    }

    fn check_revision_dependencies(
        &self,
        container: &dyn PackageContainer,
        binding: &BoundVersion,
        dependencies: &[PackageConstraint],
    ) -> Result<(), Failure> {
        if !matches!(binding, BoundVersion::Revision { .. }) {
            return Ok(());
        }
        let Some(local) = dependencies.iter().find(|d| d.package.kind == PackageKind::Local) else {
            return Ok(());
        };
        let manifest = container.manifest(binding)?;
        let local_name = Path::new(&local.package.location)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| local.package.identity.to_string());
        Err(Failure::Fatal(ResolutionError::RevisionDependsOnLocal {
            package: manifest.name.clone(),
            local: local_name,
        }))
    }

    /// The smallest subset of requirements on `identity` with no common candidate
    fn conflict(
        &self,
        overrides: &HashMap<PackageIdentity, Override>,
        partial: &Partial,
        identity: &PackageIdentity,
    ) -> Result<ResolutionError, Failure> {
        let mut set = Self::governed(overrides, partial, identity);
        let versions = match set.first() {
            Some((_, c)) if c.requirement.is_versioned() => {
                self.provider.container(&c.package)?.versions()?
            }
            _ => Vec::new(),
        };

        let mut i = 0;
        while i < set.len() {
            let mut trial = set.clone();
            trial.remove(i);
            if self.has_candidate(&trial, &versions) {
                i += 1;
            } else {
                set = trial;
            }
        }

        Ok(ResolutionError::Conflict(
            set.into_iter()
                .map(|(consumer, constraint)| ConflictingRequirement {
                    consumer,
                    package: identity.clone(),
                    requirement: constraint.requirement,
                })
                .collect(),
        ))
    }

    fn has_candidate(&self, set: &[(Consumer, PackageConstraint)], versions: &[Version]) -> bool {
        let Some((_, first)) = set.first() else {
            return true;
        };
        let requirements = || set.iter().map(|(_, c)| &c.requirement);
        if requirements().all(|r| r == &Requirement::Unversioned) {
            return true;
        }
        if requirements().any(|r| r == &Requirement::Unversioned) {
            return false;
        }
        if requirements().any(Requirement::is_revision_based) {
            return requirements().all(|r| r == &first.requirement);
        }
        versions
            .iter()
            .any(|version| requirements().all(|r| r.admits_version(version, self.policy)))
    }

    fn finish(&self, partial: Partial) -> Result<Resolution, ResolutionError> {
        let mut bindings = Vec::with_capacity(partial.assignments.len());
        for identity in &partial.order {
            let Some(assignment) = partial.assignments.get(identity) else {
                continue;
            };
            let container = self.provider.container(&assignment.package)?;
            let manifest = container.manifest(&assignment.binding)?;
            let mut dependencies: Vec<PackageIdentity> = Vec::new();
            for dependency in &assignment.dependencies {
                if !dependencies.contains(&dependency.package.identity) {
                    dependencies.push(dependency.package.identity.clone());
                }
            }
            bindings.push(ResolvedBinding {
                package: assignment.package.clone(),
                binding: assignment.binding.clone(),
                products: assignment.products.clone(),
                dependencies,
                manifest,
            });
        }

        let resolution = Resolution { bindings };
        resolution.check_cycles()?;
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ToolsVersion;
    use crate::source_control::Revision;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// Dependency edge, optionally only used through one product
    type Edge = (Option<&'static str>, PackageConstraint);

    #[derive(Default)]
    struct MockPackage {
        name: String,
        versions: BTreeMap<Version, Vec<Edge>>,
        revisions: HashMap<String, Vec<Edge>>,
        unversioned: Vec<Edge>,
    }

    struct MockContainer {
        package: PackageReference,
        mock: Arc<MockPackage>,
    }

    impl PackageContainer for MockContainer {
        fn package(&self) -> &PackageReference {
            &self.package
        }

        fn versions(&self) -> Result<Vec<Version>, ContainerError> {
            Ok(self.mock.versions.keys().rev().cloned().collect())
        }

        fn revision_for_version(&self, version: &Version) -> Result<Revision, ContainerError> {
            Ok(Revision::new(version.to_string()))
        }

        fn resolve_revision(&self, identifier: &str) -> Result<Revision, ContainerError> {
            Ok(Revision::new(format!("{}-tip", identifier)))
        }

        fn manifest(&self, _binding: &BoundVersion) -> Result<Arc<Manifest>, ContainerError> {
            Ok(Arc::new(Manifest {
                name: self.mock.name.clone(),
                tools_version: ToolsVersion::CURRENT,
                dependencies: Vec::new(),
                targets: Vec::new(),
                products: Vec::new(),
            }))
        }

        fn dependencies(
            &self,
            binding: &BoundVersion,
            products: &ProductFilter,
        ) -> Result<Vec<PackageConstraint>, ContainerError> {
            let edges = match binding {
                BoundVersion::Version(version) => self.mock.versions.get(version),
                BoundVersion::Revision { branch: Some(branch), .. } => self.mock.revisions.get(branch),
                BoundVersion::Revision { revision, .. } => self.mock.revisions.get(revision.as_str()),
                BoundVersion::Unversioned => Some(&self.mock.unversioned),
            };
            Ok(edges
                .into_iter()
                .flatten()
                .filter(|(product, _)| product.map_or(true, |p| products.contains(p)))
                .map(|(_, c)| c.clone())
                .collect())
        }
    }

    #[derive(Default)]
    struct MockProvider {
        packages: HashMap<PackageIdentity, Arc<MockPackage>>,
        requested: Mutex<Vec<PackageReference>>,
    }

    impl MockProvider {
        fn add(&mut self, identity: &str, package: MockPackage) {
            self.packages
                .insert(PackageIdentity::plain(identity), Arc::new(package));
        }
    }

    impl ContainerProvider for MockProvider {
        fn container(&self, package: &PackageReference) -> Result<Arc<dyn PackageContainer>, ContainerError> {
            self.requested.lock().push(package.clone());
            let mock = self.packages.get(&package.identity).cloned().unwrap_or_default();
            Ok(Arc::new(MockContainer {
                package: package.clone(),
                mock,
            }))
        }
    }

    fn remote(name: &str) -> PackageReference {
        PackageReference::remote(format!("https://example.com/{}.git", name))
    }

    fn root(name: &str) -> PackageReference {
        PackageReference::root(Path::new(&format!("/ws/roots/{}", name)))
    }

    fn on(name: &str, requirement: &str) -> PackageConstraint {
        PackageConstraint::new(remote(name), Requirement::parse(requirement).unwrap(), ProductFilter::specific([name]))
    }

    fn root_constraint(name: &str) -> PackageConstraint {
        PackageConstraint::new(root(name), Requirement::Unversioned, ProductFilter::Everything)
    }

    fn package(name: &str, versions: &[(&str, Vec<PackageConstraint>)]) -> MockPackage {
        MockPackage {
            name: name.to_string(),
            versions: versions
                .iter()
                .map(|(v, deps)| {
                    (
                        Version::parse(v).unwrap(),
                        deps.iter().map(|d| (None, d.clone())).collect(),
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    fn root_package(name: &str, deps: Vec<PackageConstraint>) -> MockPackage {
        MockPackage {
            name: name.to_string(),
            unversioned: deps.into_iter().map(|d| (None, d)).collect(),
            ..Default::default()
        }
    }

    fn version_of(resolution: &Resolution, name: &str) -> BoundVersion {
        resolution
            .get(&PackageIdentity::plain(name))
            .map(|b| b.binding.clone())
            .unwrap()
    }

    fn v(s: &str) -> BoundVersion {
        BoundVersion::Version(Version::parse(s).unwrap())
    }

    #[test]
    fn test_highest_version_in_range() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "^1.0.0")]));
        provider.add("foo", package("Foo", &[("1.0.0", vec![]), ("1.5.0", vec![]), ("2.0.0", vec![])]));

        let resolution = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap();
        assert_eq!(version_of(&resolution, "foo"), v("1.5.0"));
        let order: Vec<_> = resolution.iter().map(|b| b.package.identity.to_string()).collect();
        assert_eq!(order, vec!["r", "foo"]);
    }

    #[test]
    fn test_pin_is_preferred_when_still_valid() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "^1.0.0")]));
        provider.add("foo", package("Foo", &[("1.0.0", vec![]), ("1.5.0", vec![])]));

        let pins = BTreeMap::from([(
            PackageIdentity::plain("foo"),
            CheckoutState::version(Version::new(1, 0, 0), Revision::new("1.0.0")),
        )]);
        let resolution = Resolver::new(&provider)
            .with_pins(pins)
            .resolve(vec![root_constraint("r")])
            .unwrap();
        assert_eq!(version_of(&resolution, "foo"), v("1.0.0"));
    }

    #[test]
    fn test_backtracks_to_older_version() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "^1.0.0"), on("bar", "1.0.0")]));
        provider.add("foo", package("Foo", &[("1.0.0", vec![]), ("1.5.0", vec![])]));
        provider.add("bar", package("Bar", &[("1.0.0", vec![on("foo", "1.0.0")])]));

        let resolution = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap();
        assert_eq!(version_of(&resolution, "foo"), v("1.0.0"));
        assert_eq!(version_of(&resolution, "bar"), v("1.0.0"));
    }

    #[test]
    fn test_conflicting_requirements_are_reported() {
        let mut provider = MockProvider::default();
        provider.add("a", package("A", &[("1.0.0", vec![on("aa", "1.0.0")])]));
        provider.add("b", package("B", &[("1.0.0", vec![on("aa", "2.0.0")])]));
        provider.add("aa", package("AA", &[("1.0.0", vec![]), ("2.0.0", vec![])]));

        let err = Resolver::new(&provider)
            .resolve(vec![on("a", "1.0.0"), on("b", "1.0.0")])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Dependencies could not be resolved because 'a' 1.0.0 depends on 'aa' 1.0.0 and 'b' 1.0.0 depends on 'aa' 2.0.0"
        );
    }

    #[test]
    fn test_unsatisfiable_transitive_requirement() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "^1.0.0"), on("bar", "1.0.0")]));
        provider.add("foo", package("Foo", &[("1.5.0", vec![])]));
        provider.add("bar", package("Bar", &[("1.0.0", vec![on("foo", "1.0.0")])]));

        let err = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap_err();
        let ResolutionError::Conflict(requirements) = &err else {
            panic!("unexpected error: {}", err);
        };
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].package, PackageIdentity::plain("foo"));
        assert_eq!(requirements[0].requirement, Requirement::parse("1.0.0").unwrap());
        assert!(err.to_string().starts_with("Dependencies could not be resolved because 'bar' 1.0.0"));
    }

    #[test]
    fn test_root_package_overrides_remote_dependency() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("bar", "^1.0.0")]));
        provider.add("foo", root_package("Foo", vec![]));
        provider.add("bar", package("Bar", &[("1.0.0", vec![on("foo", "^1.0.0")])]));

        let resolution = Resolver::new(&provider)
            .resolve(vec![root_constraint("r"), root_constraint("foo")])
            .unwrap();
        let foo = resolution.get(&PackageIdentity::plain("foo")).unwrap();
        assert!(foo.package.is_root());
        assert_eq!(foo.binding, BoundVersion::Unversioned);
        assert!(!provider
            .requested
            .lock()
            .iter()
            .any(|p| p.identity.as_str() == "foo" && p.kind == PackageKind::Remote));
    }

    #[test]
    fn test_transitive_local_conflicts_with_version() {
        let mut provider = MockProvider::default();
        let local = PackageConstraint::new(
            PackageReference::local(Path::new("/ws/pkgs/foo")),
            Requirement::Unversioned,
            ProductFilter::specific(["foo"]),
        );
        provider.add("r", root_package("R", vec![on("bar", "^1.0.0"), on("foo", "^1.0.0")]));
        provider.add("bar", package("Bar", &[("1.0.0", vec![local])]));
        provider.add("foo", package("Foo", &[("1.0.0", vec![])]));

        let err = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap_err();
        assert!(matches!(err, ResolutionError::Conflict(_)), "{}", err);
    }

    #[test]
    fn test_edited_override_satisfies_any_requirement() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "^2.0.0")]));
        provider.add("foo", package("Foo", &[("1.0.0", vec![])]));

        let edited = PackageConstraint::new(remote("foo"), Requirement::Unversioned, ProductFilter::default());
        let resolution = Resolver::new(&provider)
            .resolve(vec![root_constraint("r"), edited])
            .unwrap();
        let foo = resolution.get(&PackageIdentity::plain("foo")).unwrap();
        assert_eq!(foo.binding, BoundVersion::Unversioned);
        assert_eq!(foo.products, ProductFilter::specific(["foo"]));
    }

    #[test]
    fn test_root_branch_beats_transitive_versions() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "branch:develop"), on("bar", "1.0.0")]));
        provider.add("bar", package("Bar", &[("1.0.0", vec![on("foo", "^1.0.0")])]));
        let mut foo = package("Foo", &[("1.0.0", vec![])]);
        foo.revisions.insert("develop".to_string(), Vec::new());
        provider.add("foo", foo);

        let resolution = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap();
        assert_eq!(
            version_of(&resolution, "foo"),
            BoundVersion::Revision {
                revision: Revision::new("develop-tip"),
                branch: Some("develop".to_string()),
            }
        );
    }

    #[test]
    fn test_branch_pin_keeps_revision() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "branch:main")]));
        let mut foo = package("Foo", &[]);
        foo.revisions.insert("main".to_string(), Vec::new());
        provider.add("foo", foo);

        let pins = BTreeMap::from([(
            PackageIdentity::plain("foo"),
            CheckoutState::branch("main", Revision::new("old")),
        )]);
        let resolution = Resolver::new(&provider)
            .with_pins(pins)
            .resolve(vec![root_constraint("r")])
            .unwrap();
        assert_eq!(
            version_of(&resolution, "foo"),
            BoundVersion::Revision {
                revision: Revision::new("old"),
                branch: Some("main".to_string()),
            }
        );
    }

    #[test]
    fn test_revision_dependency_on_local_package() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "branch:develop")]));
        let mut foo = package("Foo", &[]);
        foo.revisions.insert(
            "develop".to_string(),
            vec![(
                None,
                PackageConstraint::new(
                    PackageReference::local(Path::new("/ws/pkgs/Local")),
                    Requirement::Unversioned,
                    ProductFilter::specific(["Local"]),
                ),
            )],
        );
        provider.add("foo", foo);

        let err = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "package 'Foo' is required using a revision-based requirement and it depends on local package 'Local', which is not supported"
        );
    }

    #[test]
    fn test_cycle_is_reported_by_name() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("Root", vec![on("a", "^1.0.0")]));
        provider.add("a", package("A", &[("1.0.0", vec![on("b", "^1.0.0")])]));
        provider.add("b", package("B", &[("1.0.0", vec![on("a", "^1.0.0")])]));

        let err = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap_err();
        assert_eq!(err.to_string(), "cyclic dependency declaration found: Root -> A -> B -> A");
    }

    #[test]
    fn test_widening_products_adds_dependencies() {
        let mut provider = MockProvider::default();
        let foo_kit = PackageConstraint::new(remote("foo"), Requirement::parse("^1.0.0").unwrap(), ProductFilter::specific(["FooKit"]));
        let foo_cli = PackageConstraint::new(remote("foo"), Requirement::parse("^1.0.0").unwrap(), ProductFilter::specific(["FooCli"]));
        provider.add("r", root_package("R", vec![foo_kit, on("bar", "^1.0.0")]));
        provider.add("bar", package("Bar", &[("1.0.0", vec![foo_cli])]));
        let mut foo = package("Foo", &[]);
        foo.versions.insert(
            Version::new(1, 0, 0),
            vec![(Some("FooCli"), on("args", "^1.0.0"))],
        );
        provider.add("foo", foo);
        provider.add("args", package("Args", &[("1.2.0", vec![])]));

        let resolution = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap();
        let foo = resolution.get(&PackageIdentity::plain("foo")).unwrap();
        assert_eq!(foo.products, ProductFilter::Specific(BTreeSet::from(["FooCli".to_string(), "FooKit".to_string()])));
        assert_eq!(foo.dependencies, vec![PackageIdentity::plain("args")]);
        assert_eq!(version_of(&resolution, "args"), v("1.2.0"));
    }

    #[test]
    fn test_locked_resolution_uses_pins_only() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "^1.0.0")]));
        provider.add("foo", package("Foo", &[("1.0.0", vec![]), ("1.5.0", vec![])]));
        let pinned = |version: Version| {
            BTreeMap::from([(
                PackageIdentity::plain("foo"),
                CheckoutState::version(version, Revision::new("r")),
            )])
        };

        let resolution = Resolver::new(&provider)
            .with_pins(pinned(Version::new(1, 0, 0)))
            .locked()
            .resolve(vec![root_constraint("r")])
            .unwrap();
        assert_eq!(version_of(&resolution, "foo"), v("1.0.0"));

        let err = Resolver::new(&provider)
            .locked()
            .resolve(vec![root_constraint("r")])
            .unwrap_err();
        assert_eq!(err, ResolutionError::NotPinned(PackageIdentity::plain("foo")));

        let err = Resolver::new(&provider)
            .with_pins(pinned(Version::new(2, 0, 0)))
            .locked()
            .resolve(vec![root_constraint("r")])
            .unwrap_err();
        assert!(matches!(err, ResolutionError::PinNotSatisfying { .. }));
    }

    #[test]
    fn test_prerelease_policy() {
        let mut provider = MockProvider::default();
        provider.add("r", root_package("R", vec![on("foo", "^1.0.0")]));
        provider.add("foo", package("Foo", &[("1.0.0", vec![]), ("1.1.0-beta.1", vec![])]));

        let excluded = Resolver::new(&provider).resolve(vec![root_constraint("r")]).unwrap();
        assert_eq!(version_of(&excluded, "foo"), v("1.0.0"));

        let included = Resolver::new(&provider)
            .with_prerelease_policy(PrereleasePolicy::Include)
            .resolve(vec![root_constraint("r")])
            .unwrap();
        assert_eq!(version_of(&included, "foo"), v("1.1.0-beta.1"));
    }
}
