//! Package identities and references
//!
//! An identity is derived from a dependency's location alone: the last path
//! component, without scheme or `.git` suffix, lowercased. Explicit names never
//! contribute to identity, but they are tracked by [`IdentityRegistry`] to
//! detect naming conflicts across the dependency graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Identity and naming conflicts between dependency declarations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityConflictError {
    #[error("'{scope}' dependency on '{location}' conflicts with dependency on '{other_location}' which has the same identity '{identity}'")]
    SameIdentity {
        scope: String,
        location: String,
        other_location: String,
        identity: PackageIdentity,
    },

    #[error("'{scope}' dependency on '{location}' conflicts with dependency on '{other_location}' which has the same explicit name '{name}'")]
    SameExplicitName {
        scope: String,
        location: String,
        other_location: String,
        name: String,
    },

    #[error("'{scope}' dependency on '{location}' has an explicit name '{name}' which conflicts with the explicit name '{other_name}' used for identity '{identity}'")]
    ConflictingExplicitNames {
        scope: String,
        location: String,
        name: String,
        other_name: String,
        identity: PackageIdentity,
    },

    #[error("'{scope}' dependency on '{location}' has an explicit name '{name}' which does not match the name '{manifest_name}' set for '{location}'")]
    ExplicitNameMismatch {
        scope: String,
        location: String,
        name: String,
        manifest_name: String,
    },

    #[error("found multiple top-level packages named '{0}'")]
    DuplicateRootName(String),

    #[error("unable to override package '{name}' because its identity '{identity}' doesn't match override's identity (directory name) '{override_identity}'")]
    OverrideIdentityMismatch {
        name: String,
        identity: PackageIdentity,
        override_identity: PackageIdentity,
    },
}

/// Canonical, location-derived package key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageIdentity(String);

impl PackageIdentity {
    /// Derive the identity of a path or URL
    pub fn from_location(location: &str) -> Self {
        let trimmed = location.trim().trim_end_matches(['/', '\\']);
        let without_scheme = match trimmed.find("://") {
            Some(pos) => &trimmed[pos + 3..],
            None => trimmed,
        };

        let mut last = without_scheme
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(without_scheme);
        // scp-style `git@host:name.git`
        if let Some((_, tail)) = last.rsplit_once(':') {
            if !tail.is_empty() {
                last = tail;
            }
        }

        let lowered = last.to_lowercase();
        let stripped = lowered.strip_suffix(".git").unwrap_or(&lowered);
        if stripped.is_empty() {
            PackageIdentity(trimmed.to_lowercase())
        } else {
            PackageIdentity(stripped.to_string())
        }
    }

    /// Identity of a filesystem path
    pub fn from_path(path: &Path) -> Self {
        Self::from_location(&path.to_string_lossy())
    }

    /// Identity from a bare package name (lowercased as-is)
    pub fn plain(name: &str) -> Self {
        PackageIdentity(name.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a package comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// A top-level package of the workspace
    Root,

    /// A path dependency
    Local,

    /// A source-control dependency
    Remote,
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageKind::Root => "root",
            PackageKind::Local => "local",
            PackageKind::Remote => "remote",
        })
    }
}

/// Location of a remote repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositorySpecifier {
    pub location: String,
}

impl RepositorySpecifier {
    pub fn new(location: impl Into<String>) -> Self {
        RepositorySpecifier {
            location: location.into(),
        }
    }

    /// Directory-safe name: identity plus a short hash of the full location
    pub fn storage_name(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = hex::encode(Sha256::digest(self.location.as_bytes()));
        format!("{}-{}", PackageIdentity::from_location(&self.location), &digest[..8])
    }
}

impl fmt::Display for RepositorySpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}

/// A package identity bound to the location it is fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageReference {
    pub identity: PackageIdentity,
    pub kind: PackageKind,
    pub location: String,
}

impl PackageReference {
    pub fn root(path: &Path) -> Self {
        PackageReference {
            identity: PackageIdentity::from_path(path),
            kind: PackageKind::Root,
            location: path.to_string_lossy().into_owned(),
        }
    }

    pub fn local(path: &Path) -> Self {
        PackageReference {
            identity: PackageIdentity::from_path(path),
            kind: PackageKind::Local,
            location: path.to_string_lossy().into_owned(),
        }
    }

    pub fn remote(location: impl Into<String>) -> Self {
        let location = location.into();
        PackageReference {
            identity: PackageIdentity::from_location(&location),
            kind: PackageKind::Remote,
            location,
        }
    }

    /// The repository of the package, only for remote references
    pub fn repository(&self) -> Option<RepositorySpecifier> {
        match self.kind {
            PackageKind::Remote => Some(RepositorySpecifier::new(self.location.clone())),
            PackageKind::Root | PackageKind::Local => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == PackageKind::Root
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)
    }
}

#[derive(Debug, Clone)]
struct Declaration {
    location: String,
    name: Option<String>,
}

/// Graph-wide record of declarations, used to detect identity and name conflicts
///
/// The first declaration of an identity or explicit name wins; later ones are
/// checked against it and reported in the scope of their consumer.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    roots: BTreeSet<PackageIdentity>,
    by_identity: HashMap<PackageIdentity, Declaration>,
    by_name: HashMap<String, (PackageIdentity, String)>,
}

impl IdentityRegistry {
    /// Create a registry; declarations of root identities are elided
    pub fn new(roots: impl IntoIterator<Item = PackageIdentity>) -> Self {
        IdentityRegistry {
            roots: roots.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Register one declaration made by `scope`
    pub fn register(
        &mut self,
        scope: &PackageIdentity,
        location: &str,
        explicit_name: Option<&str>,
    ) -> Result<PackageIdentity, IdentityConflictError> {
        let identity = PackageIdentity::from_location(location);
        if self.roots.contains(&identity) {
            return Ok(identity);
        }

        if let Some(existing) = self.by_identity.get(&identity) {
            if normalize_location(&existing.location) != normalize_location(location) {
                return Err(IdentityConflictError::SameIdentity {
                    scope: scope.to_string(),
                    location: location.to_string(),
                    other_location: existing.location.clone(),
                    identity,
                });
            }
            if let (Some(name), Some(other)) = (explicit_name, existing.name.as_deref()) {
                if !name.eq_ignore_ascii_case(other) {
                    return Err(IdentityConflictError::ConflictingExplicitNames {
                        scope: scope.to_string(),
                        location: location.to_string(),
                        name: name.to_string(),
                        other_name: other.to_string(),
                        identity,
                    });
                }
            }
        }

        if let Some(name) = explicit_name {
            if let Some((other_identity, other_location)) = self.by_name.get(&name.to_lowercase()) {
                if other_identity != &identity {
                    return Err(IdentityConflictError::SameExplicitName {
                        scope: scope.to_string(),
                        location: location.to_string(),
                        other_location: other_location.clone(),
                        name: name.to_string(),
                    });
                }
            }
            self.by_name
                .insert(name.to_lowercase(), (identity.clone(), location.to_string()));
        }

        let entry = self
            .by_identity
            .entry(identity.clone())
            .or_insert_with(|| Declaration {
                location: location.to_string(),
                name: None,
            });
        if entry.name.is_none() {
            entry.name = explicit_name.map(str::to_string);
        }
        Ok(identity)
    }
}

fn normalize_location(location: &str) -> &str {
    location.trim().trim_end_matches(['/', '\\'])
}
