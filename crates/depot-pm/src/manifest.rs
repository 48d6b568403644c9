//! Package manifests (Package.toml)
//!
//! A manifest starts with a `# tools-version: X.Y` header followed by a TOML
//! document. The header is read without evaluating the document so it can take
//! part in cache keys and compatibility checks.

use crate::constraint::{ProductFilter, Requirement};
use crate::identity::{PackageIdentity, PackageKind, PackageReference};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Manifest file name inside a package directory
pub const MANIFEST_FILE_NAME: &str = "Package.toml";

const TOOLS_VERSION_PREFIX: &str = "# tools-version:";

/// Errors that can occur while loading or evaluating a manifest
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// The document is not a valid manifest
    #[error("invalid manifest at '{}': {message}", path.display())]
    InvalidFormat { path: PathBuf, message: String },

    /// The evaluator failed while producing the manifest
    #[error("manifest evaluation failed for '{}': {message}", path.display())]
    Runtime { path: PathBuf, message: String },

    /// A feature is used that the declared tools version does not offer
    #[error("package at '{}' uses {api}, which requires tools version {required} or later (declared {declared})", path.display())]
    UnsupportedApi {
        path: PathBuf,
        api: String,
        declared: ToolsVersion,
        required: ToolsVersion,
    },

    #[error("manifest at '{}' is missing a '{}' header", path.display(), TOOLS_VERSION_PREFIX)]
    MissingToolsVersion { path: PathBuf },

    #[error("package at '{}' is using tools version {version} but the installed version is {current}", path.display())]
    ToolsVersionTooNew {
        path: PathBuf,
        version: ToolsVersion,
        current: ToolsVersion,
    },

    #[error("package at '{}' is using tools version {version} which is no longer supported", path.display())]
    ToolsVersionObsolete { path: PathBuf, version: ToolsVersion },

    #[error("the package at '{}' cannot be accessed ({} doesn't exist in file system)", path.display(), path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read manifest at '{}': {message}", path.display())]
    Io { path: PathBuf, message: String },
}

/// Version of the manifest format a package declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolsVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ToolsVersion {
    /// Tools version implemented by this crate
    pub const CURRENT: ToolsVersion = ToolsVersion::new(1, 2, 0);

    /// Oldest tools version still accepted
    pub const MINIMUM: ToolsVersion = ToolsVersion::new(1, 0, 0);

    /// First tools version with binary targets
    pub const BINARY_TARGETS: ToolsVersion = ToolsVersion::new(1, 1, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        ToolsVersion { major, minor, patch }
    }

    /// Parse `X.Y` or `X.Y.Z`
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return None;
        }
        let mut numbers = parts.iter().map(|p| p.parse::<u64>().ok());
        let major = numbers.next()??;
        let minor = numbers.next()??;
        let patch = match numbers.next() {
            Some(patch) => patch?,
            None => 0,
        };
        Some(ToolsVersion::new(major, minor, patch))
    }

    /// Read the header from the first line of a manifest
    pub fn from_manifest_contents(path: &Path, contents: &str) -> Result<Self, ManifestError> {
        contents
            .lines()
            .next()
            .and_then(|line| line.trim().strip_prefix(TOOLS_VERSION_PREFIX))
            .and_then(ToolsVersion::parse)
            .ok_or_else(|| ManifestError::MissingToolsVersion {
                path: path.to_path_buf(),
            })
    }

    /// Check this declared version against the supported window
    pub fn validate(
        &self,
        path: &Path,
        minimum: ToolsVersion,
        current: ToolsVersion,
    ) -> Result<(), ManifestError> {
        if *self > current {
            return Err(ManifestError::ToolsVersionTooNew {
                path: path.to_path_buf(),
                version: *self,
                current,
            });
        }
        if *self < minimum {
            return Err(ManifestError::ToolsVersionObsolete {
                path: path.to_path_buf(),
                version: *self,
            });
        }
        Ok(())
    }
}

impl Default for ToolsVersion {
    fn default() -> Self {
        ToolsVersion::CURRENT
    }
}

impl fmt::Display for ToolsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for ToolsVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ToolsVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ToolsVersion::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid tools version '{}'", s)))
    }
}

/// Evaluated package manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,

    /// Filled from the header, not from the document body
    #[serde(default, rename = "tools-version")]
    pub tools_version: ToolsVersion,

    #[serde(default)]
    pub dependencies: Vec<PackageDependency>,

    #[serde(default)]
    pub targets: Vec<Target>,

    #[serde(default)]
    pub products: Vec<Product>,
}

/// A declared dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDependency {
    /// Path or repository URL; determines identity
    pub location: String,

    /// Explicit package name, if the consumer gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// `unversioned` marks a path dependency
    pub requirement: Requirement,

    /// Products used; computed from target usage when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<ProductFilter>,
}

impl PackageDependency {
    pub fn remote(location: impl Into<String>, requirement: Requirement) -> Self {
        PackageDependency {
            location: location.into(),
            name: None,
            requirement,
            products: None,
        }
    }

    pub fn local(path: &Path) -> Self {
        PackageDependency {
            location: path.to_string_lossy().into_owned(),
            name: None,
            requirement: Requirement::Unversioned,
            products: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_products(mut self, products: ProductFilter) -> Self {
        self.products = Some(products);
        self
    }

    pub fn is_local(&self) -> bool {
        self.requirement == Requirement::Unversioned
    }

    pub fn identity(&self) -> PackageIdentity {
        PackageIdentity::from_location(&self.location)
    }

    pub fn package_ref(&self) -> PackageReference {
        if self.is_local() {
            PackageReference::local(Path::new(&self.location))
        } else {
            PackageReference::remote(self.location.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Regular,
    Test,
    Binary,
}

/// A dependency of a target on another target or on a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetDependency {
    /// A target of this package, or a product of the dependency of that name
    ByName(String),

    Target { target: String },

    Product { product: String, package: String },
}

impl TargetDependency {
    pub fn by_name(name: &str) -> Self {
        TargetDependency::ByName(name.to_string())
    }

    pub fn target(name: &str) -> Self {
        TargetDependency::Target {
            target: name.to_string(),
        }
    }

    pub fn product(name: &str, package: &str) -> Self {
        TargetDependency::Product {
            product: name.to_string(),
            package: package.to_string(),
        }
    }
}

/// Where a binary target's payload comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinarySource {
    /// Archive (or archive index) to download and verify
    Remote { url: String, checksum: String },

    /// Path relative to the package root
    Local { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,

    #[serde(default)]
    pub kind: TargetKind,

    #[serde(default)]
    pub dependencies: Vec<TargetDependency>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Target {
    pub fn regular(name: &str, dependencies: Vec<TargetDependency>) -> Self {
        Target {
            name: name.to_string(),
            kind: TargetKind::Regular,
            dependencies,
            url: None,
            checksum: None,
            path: None,
        }
    }

    pub fn remote_binary(name: &str, url: &str, checksum: &str) -> Self {
        Target {
            kind: TargetKind::Binary,
            url: Some(url.to_string()),
            checksum: Some(checksum.to_string()),
            ..Target::regular(name, Vec::new())
        }
    }

    pub fn local_binary(name: &str, path: &str) -> Self {
        Target {
            kind: TargetKind::Binary,
            path: Some(path.to_string()),
            ..Target::regular(name, Vec::new())
        }
    }

    /// Source of a binary target; `None` for other kinds
    pub fn binary_source(&self) -> Option<BinarySource> {
        if self.kind != TargetKind::Binary {
            return None;
        }
        match (&self.url, &self.checksum, &self.path) {
            (Some(url), Some(checksum), None) => Some(BinarySource::Remote {
                url: url.clone(),
                checksum: checksum.clone(),
            }),
            (None, None, Some(path)) => Some(BinarySource::Local {
                path: PathBuf::from(path),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

impl Product {
    pub fn new(name: &str, targets: Vec<&str>) -> Self {
        Product {
            name: name.to_string(),
            targets: targets.into_iter().map(str::to_string).collect(),
        }
    }
}

impl Manifest {
    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Structural checks that do not depend on other packages
    pub fn validate(&self, path: &Path) -> Result<(), ManifestError> {
        let invalid = |message: String| ManifestError::InvalidFormat {
            path: path.to_path_buf(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("package name cannot be empty".to_string()));
        }

        for target in &self.targets {
            if target.kind == TargetKind::Binary {
                if target.binary_source().is_none() {
                    return Err(invalid(format!(
                        "binary target '{}' needs either 'url' and 'checksum' or 'path'",
                        target.name
                    )));
                }
                if self.tools_version < ToolsVersion::BINARY_TARGETS {
                    return Err(ManifestError::UnsupportedApi {
                        path: path.to_path_buf(),
                        api: format!("binary target '{}'", target.name),
                        declared: self.tools_version,
                        required: ToolsVersion::BINARY_TARGETS,
                    });
                }
            }
        }

        for product in &self.products {
            if let Some(missing) = product.targets.iter().find(|t| self.target(t).is_none()) {
                return Err(invalid(format!(
                    "product '{}' references unknown target '{}'",
                    product.name, missing
                )));
            }
        }

        Ok(())
    }

    /// Resolve relative local dependency paths against the package directory
    pub fn resolve_local_paths(&mut self, package_path: &Path) {
        for dependency in &mut self.dependencies {
            if dependency.is_local() && Path::new(&dependency.location).is_relative() {
                dependency.location = package_path
                    .join(&dependency.location)
                    .to_string_lossy()
                    .into_owned();
            }
        }
    }
}

/// Input handed to a [`ManifestEvaluator`]
#[derive(Debug, Clone, Copy)]
pub struct ManifestSource<'a> {
    /// Manifest path, for diagnostics
    pub path: &'a Path,
    pub contents: &'a str,
    pub tools_version: ToolsVersion,
    pub kind: PackageKind,
}

/// Turns manifest source text into a [`Manifest`]
pub trait ManifestEvaluator: Send + Sync {
    fn evaluate(&self, source: &ManifestSource<'_>) -> Result<Manifest, ManifestError>;
}

/// Evaluator for plain TOML manifests
#[derive(Debug, Default, Clone, Copy)]
pub struct TomlManifestEvaluator;

impl ManifestEvaluator for TomlManifestEvaluator {
    fn evaluate(&self, source: &ManifestSource<'_>) -> Result<Manifest, ManifestError> {
        let mut manifest: Manifest =
            toml::from_str(source.contents).map_err(|e| ManifestError::InvalidFormat {
                path: source.path.to_path_buf(),
                message: e.message().to_string(),
            })?;
        manifest.tools_version = source.tools_version;
        manifest.validate(source.path)?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"# tools-version: 1.1
name = "Foo"

[[dependencies]]
location = "https://example.com/bar.git"
requirement = "^1.0.0"

[[dependencies]]
location = "../local"
requirement = "unversioned"

[[targets]]
name = "Foo"
dependencies = ["Core", { product = "BarKit", package = "bar" }]

[[targets]]
name = "Core"

[[targets]]
name = "Blob"
kind = "binary"
url = "https://example.com/blob.zip"
checksum = "abc"

[[products]]
name = "Foo"
targets = ["Foo"]
"#;

    fn evaluate(contents: &str) -> Result<Manifest, ManifestError> {
        let path = Path::new("/pkg/Package.toml");
        let tools_version = ToolsVersion::from_manifest_contents(path, contents)?;
        TomlManifestEvaluator.evaluate(&ManifestSource {
            path,
            contents,
            tools_version,
            kind: PackageKind::Root,
        })
    }

    #[test]
    fn test_evaluate_manifest() {
        let manifest = evaluate(MANIFEST).unwrap();
        assert_eq!(manifest.name, "Foo");
        assert_eq!(manifest.tools_version, ToolsVersion::new(1, 1, 0));
        assert_eq!(manifest.dependencies.len(), 2);
        assert!(manifest.dependencies[1].is_local());
        assert_eq!(
            manifest.targets[0].dependencies[1],
            TargetDependency::product("BarKit", "bar")
        );
        assert_eq!(
            manifest.target("Blob").unwrap().binary_source(),
            Some(BinarySource::Remote {
                url: "https://example.com/blob.zip".to_string(),
                checksum: "abc".to_string(),
            })
        );
    }

    #[test]
    fn test_missing_header() {
        let err = evaluate("name = \"Foo\"\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingToolsVersion { .. }));
    }

    #[test]
    fn test_invalid_format() {
        let err = evaluate("# tools-version: 1.2\nname = [\n").unwrap_err();
        assert!(matches!(err, ManifestError::InvalidFormat { .. }));
    }

    #[test]
    fn test_binary_target_requires_newer_tools_version() {
        let contents = MANIFEST.replacen("1.1", "1.0", 1);
        let err = evaluate(&contents).unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedApi { .. }));
    }

    #[test]
    fn test_tools_version_window() {
        let path = Path::new("/pkg");
        assert!(ToolsVersion::new(1, 2, 0).validate(path, ToolsVersion::MINIMUM, ToolsVersion::CURRENT).is_ok());
        let err = ToolsVersion::new(9, 0, 0)
            .validate(path, ToolsVersion::MINIMUM, ToolsVersion::CURRENT)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "package at '/pkg' is using tools version 9.0.0 but the installed version is 1.2.0"
        );
        let err = ToolsVersion::new(0, 9, 0)
            .validate(path, ToolsVersion::MINIMUM, ToolsVersion::CURRENT)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "package at '/pkg' is using tools version 0.9.0 which is no longer supported"
        );
    }

    #[test]
    fn test_resolve_local_paths() {
        let mut manifest = evaluate(MANIFEST).unwrap();
        manifest.resolve_local_paths(Path::new("/pkg/foo"));
        assert_eq!(manifest.dependencies[1].location, "/pkg/foo/../local");
        assert_eq!(manifest.dependencies[0].location, "https://example.com/bar.git");
    }
}
