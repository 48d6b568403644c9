//! Requirements, product filters and package constraints
//!
//! Constraints are what the resolver consumes: a package reference, a
//! requirement on its version or revision, and the products used from it.

use crate::identity::PackageReference;
use crate::manifest::{Manifest, PackageDependency, TargetDependency};
use crate::semver::{PrereleasePolicy, SemverError, Version, VersionRange};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

/// What a consumer asks of a dependency
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// Exactly this version
    Exact(Version),

    /// Any version in `lower..<upper`
    Range(VersionRange),

    /// Tip of a branch
    Branch(String),

    /// A specific revision
    Revision(String),

    /// A path dependency or an override; never version-solved
    Unversioned,
}

impl Requirement {
    /// `^1.2.3` style shorthand
    pub fn up_to_next_major(version: Version) -> Self {
        Requirement::Range(VersionRange::up_to_next_major(version))
    }

    /// `~1.2.3` style shorthand
    pub fn up_to_next_minor(version: Version) -> Self {
        Requirement::Range(VersionRange::up_to_next_minor(version))
    }

    pub fn is_versioned(&self) -> bool {
        matches!(self, Requirement::Exact(_) | Requirement::Range(_))
    }

    pub fn is_revision_based(&self) -> bool {
        matches!(self, Requirement::Branch(_) | Requirement::Revision(_))
    }

    /// Whether a version satisfies this requirement
    pub fn admits_version(&self, version: &Version, policy: PrereleasePolicy) -> bool {
        match self {
            Requirement::Exact(exact) => exact == version,
            Requirement::Range(range) => range.admits(version, policy),
            Requirement::Branch(_) | Requirement::Revision(_) | Requirement::Unversioned => false,
        }
    }

    /// Parse the textual form
    ///
    /// `1.2.3` or `=1.2.3` (exact), `^1.2.3`, `~1.2.3`, `1.0.0..<2.0.0`,
    /// `branch:NAME`, `revision:ID` and `unversioned`.
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        let s = s.trim();
        if s == "unversioned" {
            return Ok(Requirement::Unversioned);
        }
        if let Some(name) = s.strip_prefix("branch:") {
            return Ok(Requirement::Branch(name.to_string()));
        }
        if let Some(id) = s.strip_prefix("revision:") {
            return Ok(Requirement::Revision(id.to_string()));
        }
        if let Some(v) = s.strip_prefix('^') {
            return Ok(Requirement::up_to_next_major(Version::parse(v)?));
        }
        if let Some(v) = s.strip_prefix('~') {
            return Ok(Requirement::up_to_next_minor(Version::parse(v)?));
        }
        if s.contains("..<") {
            return Ok(Requirement::Range(VersionRange::parse(s)?));
        }
        let v = s.strip_prefix('=').unwrap_or(s);
        Ok(Requirement::Exact(Version::parse(v)?))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Exact(version) => write!(f, "{}", version),
            Requirement::Range(range) => write!(f, "{}", range),
            Requirement::Branch(name) => write!(f, "branch:{}", name),
            Requirement::Revision(id) => write!(f, "revision:{}", id),
            Requirement::Unversioned => f.write_str("unversioned"),
        }
    }
}

impl FromStr for Requirement {
    type Err = SemverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Requirement::parse(s)
    }
}

impl Serialize for Requirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Requirement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Requirement::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Which products of a package are used
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductFilter {
    /// Every product; used for root packages
    Everything,

    /// Only the named products (possibly none)
    Specific(BTreeSet<String>),
}

impl Default for ProductFilter {
    fn default() -> Self {
        ProductFilter::Specific(BTreeSet::new())
    }
}

impl ProductFilter {
    pub fn specific<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProductFilter::Specific(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, product: &str) -> bool {
        match self {
            ProductFilter::Everything => true,
            ProductFilter::Specific(set) => set.contains(product),
        }
    }

    /// Union of two filters
    pub fn merge(&self, other: &ProductFilter) -> ProductFilter {
        match (self, other) {
            (ProductFilter::Everything, _) | (_, ProductFilter::Everything) => {
                ProductFilter::Everything
            }
            (ProductFilter::Specific(a), ProductFilter::Specific(b)) => {
                ProductFilter::Specific(a.union(b).cloned().collect())
            }
        }
    }

    /// Whether `self` already covers everything in `other`
    pub fn covers(&self, other: &ProductFilter) -> bool {
        match (self, other) {
            (ProductFilter::Everything, _) => true,
            (ProductFilter::Specific(_), ProductFilter::Everything) => false,
            (ProductFilter::Specific(a), ProductFilter::Specific(b)) => b.is_subset(a),
        }
    }
}

/// `(package, requirement, products)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageConstraint {
    pub package: PackageReference,
    pub requirement: Requirement,
    pub products: ProductFilter,
}

impl PackageConstraint {
    pub fn new(package: PackageReference, requirement: Requirement, products: ProductFilter) -> Self {
        PackageConstraint {
            package,
            requirement,
            products,
        }
    }
}

impl fmt::Display for PackageConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {}", self.package.identity, self.requirement)
    }
}

impl Manifest {
    /// Dependencies required for `filter`, each with the products used from it
    ///
    /// With [`ProductFilter::Everything`] every declared dependency is required,
    /// even one no target uses. Otherwise only dependencies referenced by the
    /// targets reachable from the requested products are.
    pub fn dependencies_required(&self, filter: &ProductFilter) -> Vec<(PackageDependency, ProductFilter)> {
        let targets = self.targets_required(filter);
        let mut used: Vec<BTreeSet<String>> = vec![BTreeSet::new(); self.dependencies.len()];
        let mut referenced = vec![false; self.dependencies.len()];

        for target in self.targets.iter().filter(|t| targets.contains(t.name.as_str())) {
            for dependency in &target.dependencies {
                let (product, package) = match dependency {
                    TargetDependency::Target { .. } => continue,
                    TargetDependency::Product { product, package } => (product, Some(package.as_str())),
                    TargetDependency::ByName(name) => {
                        if self.target(name).is_some() {
                            continue;
                        }
                        (name, None)
                    }
                };
                if let Some(index) = self.dependency_index(package.unwrap_or(product.as_str())) {
                    used[index].insert(product.clone());
                    referenced[index] = true;
                }
            }
        }

        self.dependencies
            .iter()
            .enumerate()
            .filter(|(index, _)| filter == &ProductFilter::Everything || referenced[*index])
            .map(|(index, dependency)| {
                let products = dependency
                    .products
                    .clone()
                    .unwrap_or_else(|| ProductFilter::Specific(used[index].clone()));
                (dependency.clone(), products)
            })
            .collect()
    }

    /// Constraints this manifest imposes when used with `filter`
    pub fn dependency_constraints(&self, filter: &ProductFilter) -> Vec<PackageConstraint> {
        self.dependencies_required(filter)
            .into_iter()
            .map(|(dependency, products)| PackageConstraint {
                package: dependency.package_ref(),
                requirement: dependency.requirement.clone(),
                products,
            })
            .collect()
    }

    fn targets_required(&self, filter: &ProductFilter) -> HashSet<&str> {
        let mut queue: VecDeque<&str> = match filter {
            ProductFilter::Everything => self.targets.iter().map(|t| t.name.as_str()).collect(),
            ProductFilter::Specific(products) => self
                .products
                .iter()
                .filter(|p| products.contains(&p.name))
                .flat_map(|p| p.targets.iter().map(String::as_str))
                .collect(),
        };

        let mut required = HashSet::new();
        while let Some(name) = queue.pop_front() {
            if !required.insert(name) {
                continue;
            }
            let Some(target) = self.target(name) else {
                continue;
            };
            for dependency in &target.dependencies {
                match dependency {
                    TargetDependency::Target { target } => queue.push_back(target.as_str()),
                    TargetDependency::ByName(name) if self.target(name).is_some() => {
                        queue.push_back(name.as_str())
                    }
                    _ => {}
                }
            }
        }
        required
    }

    /// Index of the dependency a product reference names, by explicit name or identity
    fn dependency_index(&self, package: &str) -> Option<usize> {
        let lowered = package.to_lowercase();
        self.dependencies.iter().position(|dependency| {
            dependency
                .name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(package))
                || dependency.identity().as_str() == lowered
        })
    }
}
