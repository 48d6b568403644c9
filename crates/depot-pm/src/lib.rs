//! Depot Package Manager Engine
//!
//! This crate provides the dependency engine behind depot workspaces, including:
//! - Package identities and conflict detection between declarations
//! - Manifest loading (Package.toml) with a content-addressed cache
//! - Semver requirements and backtracking dependency resolution
//! - Pins (depot.resolved) and the managed dependency ledger
//! - Checkouts, editable working copies and local path dependencies
//! - Binary artifact download, verification and extraction
//! - Resolution precomputation to skip work when nothing changed

pub mod artifacts;
pub mod config;
pub mod constraint;
pub mod container;
pub mod delegate;
pub mod error;
pub mod executor;
pub mod identity;
pub mod manifest;
pub mod manifest_cache;
pub mod pins;
pub mod precompute;
pub mod resolver;
pub mod semver;
pub mod source_control;
pub mod state;
pub mod workspace;

mod fsutil;

pub use artifacts::{
    ArchiveError, Archiver, ArtifactError, ArtifactPipeline, BinaryTarget, ChecksumAlgorithm,
    FileArchiver, HttpTransport, Sha256Checksum, Transport, TransportError,
};
pub use config::{ConfigError, Configuration, Mirrors, CONFIG_FILE_NAME};
pub use constraint::{PackageConstraint, ProductFilter, Requirement};
pub use container::{BoundVersion, ContainerError, ContainerProvider, PackageContainer};
pub use delegate::{NoopDelegate, WorkspaceDelegate};
pub use error::{Diagnostics, StaleStateError, StateTransitionError, WorkspaceError};
pub use executor::{Executor, TaskError, TaskHandle};
pub use identity::{IdentityConflictError, PackageIdentity, PackageKind, PackageReference, RepositorySpecifier};
pub use manifest::{
    BinarySource, Manifest, ManifestError, ManifestEvaluator, PackageDependency, Product, Target,
    TargetDependency, TomlManifestEvaluator, ToolsVersion, MANIFEST_FILE_NAME,
};
pub use manifest_cache::ManifestCache;
pub use pins::{Pin, PinsError, PinsStore, PINS_FILE_NAME};
pub use precompute::{PrecomputeResult, ResolutionReason};
pub use resolver::{Resolution, ResolutionError, ResolvedBinding, Resolver};
pub use semver::{PrereleasePolicy, SemverError, Version, VersionRange};
pub use source_control::{
    Repository, RepositoryManager, RepositoryProvider, Revision, SourceControlError, WorkingCopy,
};
pub use state::{
    ArtifactSource, CheckoutState, DependencyState, ManagedArtifact, ManagedDependency, StateError,
    WorkspaceState,
};
pub use workspace::{
    ResolvedGraph, ResolvedPackage, UpdateReport, Workspace, WorkspaceBuilder, WorkspaceLocation,
};
