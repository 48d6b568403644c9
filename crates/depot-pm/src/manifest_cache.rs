//! Manifest cache
//!
//! Manifests are memoised by a content key: SHA-256 over the raw manifest
//! bytes, the declared tools version, the package kind and a fingerprint of the
//! evaluator-relevant environment. The file is re-read on every request, but a
//! known key is never evaluated twice.
//!
//! Concurrent requests for one key share a single `OnceCell`: the first caller
//! evaluates, the others block on the cell and then share its result. Parsed
//! manifests are also written to an on-disk layer keyed by the same hash.

use crate::config::Mirrors;
use crate::delegate::WorkspaceDelegate;
use crate::executor::{Executor, TaskHandle};
use crate::fsutil;
use crate::identity::PackageKind;
use crate::manifest::{
    Manifest, ManifestError, ManifestEvaluator, ManifestSource, ToolsVersion, MANIFEST_FILE_NAME,
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Entry = Arc<OnceCell<Result<Arc<Manifest>, ManifestError>>>;

/// Content-keyed manifest cache, one per workspace
pub struct ManifestCache {
    evaluator: Arc<dyn ManifestEvaluator>,
    delegate: Arc<dyn WorkspaceDelegate>,
    directory: Option<PathBuf>,
    tools_version: ToolsVersion,
    minimum_tools_version: ToolsVersion,
    mirrors: Mirrors,
    environment: RwLock<BTreeMap<String, String>>,
    entries: DashMap<String, Entry>,
}

impl ManifestCache {
    /// Create an in-memory cache
    pub fn new(evaluator: Arc<dyn ManifestEvaluator>, delegate: Arc<dyn WorkspaceDelegate>) -> Self {
        ManifestCache {
            evaluator,
            delegate,
            directory: None,
            tools_version: ToolsVersion::CURRENT,
            minimum_tools_version: ToolsVersion::MINIMUM,
            mirrors: Mirrors::default(),
            environment: RwLock::new(BTreeMap::new()),
            entries: DashMap::new(),
        }
    }

    /// Persist parsed manifests under `directory`
    pub fn with_directory(mut self, directory: PathBuf) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Reject manifests newer than `tools_version`
    pub fn with_tools_version(mut self, tools_version: ToolsVersion) -> Self {
        self.tools_version = tools_version;
        self
    }

    /// Reject manifests older than `minimum`
    pub fn with_minimum_tools_version(mut self, minimum: ToolsVersion) -> Self {
        self.minimum_tools_version = minimum;
        self
    }

    /// Rewrite remote dependency locations of every loaded manifest
    pub fn with_mirrors(mut self, mirrors: Mirrors) -> Self {
        self.mirrors = mirrors;
        self
    }

    /// Replace the environment the evaluator is sensitive to
    pub fn set_environment(&self, environment: BTreeMap<String, String>) {
        *self.environment.write() = environment;
    }

    /// Snapshot the named variables from the process environment
    pub fn capture_environment(&self, names: &[String]) {
        let environment = names
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();
        self.set_environment(environment);
    }

    /// Load the manifest of the package at `package_path`
    pub fn load(&self, package_path: &Path, kind: PackageKind) -> Result<Arc<Manifest>, ManifestError> {
        let manifest_path = package_path.join(MANIFEST_FILE_NAME);
        self.delegate.will_load_manifest(&manifest_path, kind);

        let result = self.read_manifest(package_path, &manifest_path).and_then(|bytes| {
            let manifest = self.load_bytes(&manifest_path, &bytes, kind)?;
            Ok(with_local_paths(manifest, package_path))
        });

        self.delegate
            .did_load_manifest(&manifest_path, kind, result.as_deref());
        result
    }

    /// Load a manifest whose bytes were obtained elsewhere (e.g. a repository revision)
    pub fn load_contents(
        &self,
        manifest_path: &Path,
        contents: &[u8],
        kind: PackageKind,
    ) -> Result<Arc<Manifest>, ManifestError> {
        self.delegate.will_load_manifest(manifest_path, kind);
        let result = self.load_bytes(manifest_path, contents, kind);
        self.delegate.did_load_manifest(manifest_path, kind, result.as_deref());
        result
    }

    /// [`ManifestCache::load`] on a worker thread
    pub fn load_async(
        self: &Arc<Self>,
        executor: &Executor,
        package_path: PathBuf,
        kind: PackageKind,
    ) -> TaskHandle<Result<Arc<Manifest>, ManifestError>> {
        let cache = self.clone();
        executor.spawn(move || cache.load(&package_path, kind))
    }

    /// Forget everything, including the on-disk layer
    pub fn purge(&self) -> std::io::Result<()> {
        self.entries.clear();
        match &self.directory {
            Some(directory) => fsutil::remove_path(directory),
            None => Ok(()),
        }
    }

    fn read_manifest(&self, package_path: &Path, manifest_path: &Path) -> Result<Vec<u8>, ManifestError> {
        if !package_path.is_dir() {
            return Err(ManifestError::NotFound {
                path: package_path.to_path_buf(),
            });
        }
        fs::read(manifest_path).map_err(|e| ManifestError::Io {
            path: manifest_path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn load_bytes(&self, path: &Path, bytes: &[u8], kind: PackageKind) -> Result<Arc<Manifest>, ManifestError> {
        let contents = std::str::from_utf8(bytes).map_err(|e| ManifestError::InvalidFormat {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let tools_version = ToolsVersion::from_manifest_contents(path, contents)?;
        tools_version.validate(path, self.minimum_tools_version, self.tools_version)?;

        let key = self.cache_key(bytes, tools_version, kind);
        // Clone the cell out so the map shard is not locked during evaluation.
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        entry
            .get_or_init(|| {
                if let Some(manifest) = self.read_persisted(&key) {
                    tracing::debug!(path = %path.display(), %key, "Manifest served from disk cache");
                    return Ok(Arc::new(manifest));
                }
                self.delegate.will_parse_manifest(path);
                tracing::debug!(path = %path.display(), %key, "Evaluating manifest");
                let source = ManifestSource {
                    path,
                    contents,
                    tools_version,
                    kind,
                };
                let mut manifest = self.evaluator.evaluate(&source)?;
                self.apply_mirrors(&mut manifest);
                self.persist(&key, &manifest);
                Ok(Arc::new(manifest))
            })
            .clone()
    }

    fn cache_key(&self, bytes: &[u8], tools_version: ToolsVersion, kind: PackageKind) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.update([0u8]);
        hasher.update(tools_version.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(kind.to_string().as_bytes());
        for (name, value) in self.environment.read().iter() {
            hasher.update([0u8]);
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(self.mirrors.fingerprint().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn apply_mirrors(&self, manifest: &mut Manifest) {
        if self.mirrors.is_empty() {
            return;
        }
        for dependency in manifest.dependencies.iter_mut().filter(|d| !d.is_local()) {
            dependency.location = self.mirrors.effective(&dependency.location);
        }
    }

    fn read_persisted(&self, key: &str) -> Option<Manifest> {
        let path = self.directory.as_ref()?.join(format!("{}.json", key));
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt manifest cache entry");
                None
            }
        }
    }

    fn persist(&self, key: &str, manifest: &Manifest) {
        let Some(directory) = &self.directory else {
            return;
        };
        let path = directory.join(format!("{}.json", key));
        let written = serde_json::to_vec_pretty(manifest)
            .map_err(std::io::Error::from)
            .and_then(|bytes| fsutil::write_atomic(&path, &bytes));
        if let Err(e) = written {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist manifest cache entry");
        }
    }
}

/// Relative local dependency paths depend on where the package lives, not on
/// its content, so they are resolved after the cache lookup.
fn with_local_paths(manifest: Arc<Manifest>, package_path: &Path) -> Arc<Manifest> {
    let needs_rewrite = manifest
        .dependencies
        .iter()
        .any(|d| d.is_local() && Path::new(&d.location).is_relative());
    if !needs_rewrite {
        return manifest;
    }
    let mut manifest = (*manifest).clone();
    manifest.resolve_local_paths(package_path);
    Arc::new(manifest)
}
