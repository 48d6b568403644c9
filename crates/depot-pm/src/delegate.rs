//! Observation hooks for workspace operations
//!
//! Every method has an empty default, so implementors only override what they
//! care about. Calls can arrive from worker threads.

use crate::identity::{PackageKind, RepositorySpecifier};
use crate::manifest::{Manifest, ManifestError};
use crate::precompute::ResolutionReason;
use std::path::Path;

pub trait WorkspaceDelegate: Send + Sync {
    /// A repository is about to be fetched for the first time
    fn will_fetch(&self, _repository: &RepositorySpecifier) {}

    fn did_fetch(&self, _repository: &RepositorySpecifier, _error: Option<&str>) {}

    /// An existing repository copy is about to be refreshed
    fn will_update(&self, _repository: &RepositorySpecifier) {}

    fn did_update(&self, _repository: &RepositorySpecifier) {}

    /// A working copy is about to be created at `path`
    fn will_checkout(&self, _repository: &RepositorySpecifier, _revision: &str, _path: &Path) {}

    /// A managed checkout is about to be deleted
    fn will_remove(&self, _path: &Path) {}

    fn will_resolve_dependencies(&self, _reason: Option<&ResolutionReason>) {}

    /// An update found nothing to change
    fn dependencies_up_to_date(&self) {}

    /// Called once per manifest load request, even when served from cache
    fn will_load_manifest(&self, _path: &Path, _kind: PackageKind) {}

    fn did_load_manifest(
        &self,
        _path: &Path,
        _kind: PackageKind,
        _result: Result<&Manifest, &ManifestError>,
    ) {
    }

    /// Called once per distinct manifest content, right before evaluation
    fn will_parse_manifest(&self, _path: &Path) {}

    fn will_download_artifact(&self, _url: &str) {}

    fn did_download_artifact(&self, _url: &str, _error: Option<&str>) {}

    /// Recoverable problems that were healed
    fn warning(&self, _message: &str) {}
}

/// Delegate that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl WorkspaceDelegate for NoopDelegate {}
