//! Shared fixtures for workspace integration tests
//!
//! Repositories live in memory: every revision is just a manifest. Working
//! copies are real directories holding that manifest plus a `.revision` marker,
//! so checkout and edit behavior can be observed on disk.

#![allow(dead_code)]

use depot_pm::artifacts::{ArchiveError, Archiver, ChecksumAlgorithm, Transport, TransportError};
use depot_pm::identity::{PackageIdentity, RepositorySpecifier};
use depot_pm::source_control::{Repository, RepositoryProvider, Revision, SourceControlError, WorkingCopy};
use depot_pm::{Configuration, ResolutionReason, WorkspaceBuilder, WorkspaceDelegate, MANIFEST_FILE_NAME};
use depot_pm::Workspace;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const REVISION_MARKER: &str = ".revision";
pub const UNCOMMITTED_MARKER: &str = "UNCOMMITTED";
const LOCATION_MARKER: &str = ".location";
const BRANCH_MARKER: &str = ".branch";

/// Remote location of a test repository
pub fn url(name: &str) -> String {
    format!("https://example.com/{}.git", name)
}

/// Builder for `Package.toml` contents
///
/// Every dependency uses all products of its target, so transitive
/// dependencies are always part of the graph.
pub struct ManifestBuilder {
    name: String,
    tools_version: String,
    sections: Vec<String>,
}

impl ManifestBuilder {
    pub fn new(name: &str) -> Self {
        ManifestBuilder {
            name: name.to_string(),
            tools_version: "1.2".to_string(),
            sections: Vec::new(),
        }
    }

    pub fn tools_version(mut self, version: &str) -> Self {
        self.tools_version = version.to_string();
        self
    }

    /// Depend on the test repository `name`
    pub fn dependency(self, name: &str, requirement: &str) -> Self {
        self.dependency_at(&url(name), requirement)
    }

    pub fn dependency_at(mut self, location: &str, requirement: &str) -> Self {
        self.sections.push(format!(
            "[[dependencies]]\nlocation = {:?}\nrequirement = {:?}\nproducts = \"everything\"\n",
            location, requirement
        ));
        self
    }

    pub fn named_dependency(mut self, location: &str, name: &str, requirement: &str) -> Self {
        self.sections.push(format!(
            "[[dependencies]]\nlocation = {:?}\nname = {:?}\nrequirement = {:?}\nproducts = \"everything\"\n",
            location, name, requirement
        ));
        self
    }

    pub fn local_dependency(self, path: &Path) -> Self {
        self.dependency_at(&path.to_string_lossy(), "unversioned")
    }

    pub fn remote_binary(mut self, target: &str, url: &str, checksum: &str) -> Self {
        self.sections.push(format!(
            "[[targets]]\nname = {:?}\nkind = \"binary\"\nurl = {:?}\nchecksum = {:?}\n",
            target, url, checksum
        ));
        self
    }

    pub fn local_binary(mut self, target: &str, path: &str) -> Self {
        self.sections.push(format!(
            "[[targets]]\nname = {:?}\nkind = \"binary\"\npath = {:?}\n",
            target, path
        ));
        self
    }

    pub fn build(&self) -> String {
        let mut contents = format!("# tools-version: {}\nname = {:?}\n", self.tools_version, self.name);
        for section in &self.sections {
            contents.push('\n');
            contents.push_str(section);
        }
        contents
    }

    /// Write the manifest into `dir`, creating it
    pub fn write(&self, dir: &Path) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE_NAME), self.build()).unwrap();
        dir.to_path_buf()
    }
}

#[derive(Debug, Clone, Default)]
struct RepositoryData {
    tags: BTreeMap<String, String>,
    branches: BTreeMap<String, String>,
    manifests: BTreeMap<String, String>,
}

type Repositories = Arc<Mutex<HashMap<String, RepositoryData>>>;

/// In-memory repository host
///
/// Local copies only see what was published when they were last fetched or
/// updated, like a real clone.
#[derive(Default)]
pub struct MockRepositories {
    repositories: Repositories,
    copies: Repositories,
    failing: Mutex<HashSet<String>>,
    fetches: AtomicUsize,
    updates: AtomicUsize,
}

impl MockRepositories {
    pub fn new() -> Arc<Self> {
        Arc::new(MockRepositories::default())
    }

    /// Tag `version` of repository `name` with `manifest`; returns the revision
    pub fn add_version(&self, name: &str, version: &str, manifest: &ManifestBuilder) -> String {
        self.add_version_at(&url(name), version, manifest)
    }

    /// Like [`MockRepositories::add_version`] for a repository at any location
    pub fn add_version_at(&self, location: &str, version: &str, manifest: &ManifestBuilder) -> String {
        let revision = format!("{}-{}", PackageIdentity::from_location(location), version);
        let mut repositories = self.repositories.lock();
        let data = repositories.entry(location.to_string()).or_default();
        data.tags.insert(version.to_string(), revision.clone());
        data.manifests.insert(revision.clone(), manifest.build());
        revision
    }

    /// Point `branch` of repository `name` at a new revision holding `manifest`
    pub fn add_branch(&self, name: &str, branch: &str, revision: &str, manifest: &ManifestBuilder) {
        let mut repositories = self.repositories.lock();
        let data = repositories.entry(url(name)).or_default();
        data.branches.insert(branch.to_string(), revision.to_string());
        data.manifests.insert(revision.to_string(), manifest.build());
    }

    /// Make fetches of repository `name` fail
    pub fn fail(&self, name: &str) {
        self.failing.lock().insert(url(name));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn snapshot(&self, location: &str) {
        let data = self.repositories.lock().get(location).cloned().unwrap_or_default();
        self.copies.lock().insert(location.to_string(), data);
    }
}

impl RepositoryProvider for MockRepositories {
    fn fetch(&self, repository: &RepositorySpecifier, path: &Path) -> Result<(), SourceControlError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let known = self.repositories.lock().contains_key(&repository.location);
        if !known || self.failing.lock().contains(&repository.location) {
            return Err(SourceControlError::FetchFailed {
                repository: repository.location.clone(),
                message: "repository not found".to_string(),
            });
        }
        fs::create_dir_all(path).map_err(|e| io_error(path, e))?;
        fs::write(path.join(LOCATION_MARKER), &repository.location).map_err(|e| io_error(path, e))?;
        self.snapshot(&repository.location);
        Ok(())
    }

    fn update(&self, repository: &RepositorySpecifier, _path: &Path) -> Result<(), SourceControlError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.snapshot(&repository.location);
        Ok(())
    }

    fn open(&self, repository: &RepositorySpecifier, _path: &Path) -> Result<Arc<dyn Repository>, SourceControlError> {
        let data = self
            .copies
            .lock()
            .get(&repository.location)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(MockRepository { data }))
    }

    fn create_working_copy(
        &self,
        repository: &RepositorySpecifier,
        _source: &Path,
        destination: &Path,
        _editable: bool,
    ) -> Result<Box<dyn WorkingCopy>, SourceControlError> {
        fs::create_dir_all(destination).map_err(|e| io_error(destination, e))?;
        fs::write(destination.join(LOCATION_MARKER), &repository.location)
            .map_err(|e| io_error(destination, e))?;
        Ok(Box::new(MockWorkingCopy {
            path: destination.to_path_buf(),
            location: repository.location.clone(),
            repositories: self.repositories.clone(),
        }))
    }

    fn open_working_copy(&self, path: &Path) -> Result<Box<dyn WorkingCopy>, SourceControlError> {
        let location = fs::read_to_string(path.join(LOCATION_MARKER))
            .map_err(|_| SourceControlError::MissingWorkingCopy(path.to_path_buf()))?;
        Ok(Box::new(MockWorkingCopy {
            path: path.to_path_buf(),
            location,
            repositories: self.repositories.clone(),
        }))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> SourceControlError {
    SourceControlError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

struct MockRepository {
    data: RepositoryData,
}

impl Repository for MockRepository {
    fn tags(&self) -> Result<Vec<String>, SourceControlError> {
        Ok(self.data.tags.keys().cloned().collect())
    }

    fn resolve_revision(&self, identifier: &str) -> Result<Revision, SourceControlError> {
        self.data
            .tags
            .get(identifier)
            .or_else(|| self.data.branches.get(identifier))
            .cloned()
            .or_else(|| {
                self.data
                    .manifests
                    .contains_key(identifier)
                    .then(|| identifier.to_string())
            })
            .map(Revision::new)
            .ok_or_else(|| SourceControlError::UnknownReference(identifier.to_string()))
    }

    fn exists(&self, revision: &Revision) -> bool {
        self.data.manifests.contains_key(revision.as_str())
    }

    fn read_file(&self, revision: &Revision, path: &Path) -> Result<Vec<u8>, SourceControlError> {
        match self.data.manifests.get(revision.as_str()) {
            Some(manifest) if path == Path::new(MANIFEST_FILE_NAME) => Ok(manifest.clone().into_bytes()),
            _ => Err(SourceControlError::FileNotFound {
                path: path.to_path_buf(),
                revision: revision.to_string(),
            }),
        }
    }
}

struct MockWorkingCopy {
    path: PathBuf,
    location: String,
    repositories: Repositories,
}

impl WorkingCopy for MockWorkingCopy {
    fn current_revision(&self) -> Result<Revision, SourceControlError> {
        fs::read_to_string(self.path.join(REVISION_MARKER))
            .map(Revision::new)
            .map_err(|e| io_error(&self.path, e))
    }

    fn checkout_revision(&mut self, revision: &Revision) -> Result<(), SourceControlError> {
        let manifest = self
            .repositories
            .lock()
            .get(&self.location)
            .and_then(|data| data.manifests.get(revision.as_str()).cloned())
            .ok_or_else(|| SourceControlError::RevisionNotFound(revision.to_string()))?;
        fs::write(self.path.join(MANIFEST_FILE_NAME), manifest).map_err(|e| io_error(&self.path, e))?;
        fs::write(self.path.join(REVISION_MARKER), revision.as_str()).map_err(|e| io_error(&self.path, e))
    }

    fn checkout_new_branch(&mut self, name: &str) -> Result<(), SourceControlError> {
        let remote = self
            .repositories
            .lock()
            .get(&self.location)
            .is_some_and(|data| data.branches.contains_key(name));
        let local = fs::read_to_string(self.path.join(BRANCH_MARKER)).is_ok_and(|branch| branch == name);
        if remote || local {
            return Err(SourceControlError::BranchExists(name.to_string()));
        }
        fs::write(self.path.join(BRANCH_MARKER), name).map_err(|e| io_error(&self.path, e))
    }

    fn has_uncommitted_changes(&self) -> bool {
        self.path.join(UNCOMMITTED_MARKER).exists()
    }

    fn exists(&self, revision: &Revision) -> bool {
        self.repositories
            .lock()
            .get(&self.location)
            .is_some_and(|data| data.manifests.contains_key(revision.as_str()))
    }
}

/// Serves fixed bytes per URL
#[derive(Default)]
pub struct MockTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport::default())
    }

    pub fn serve(&self, url: &str, contents: &str) {
        self.files.lock().insert(url.to_string(), contents.as_bytes().to_vec());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        self.requests.lock().push(url.to_string());
        self.files
            .lock()
            .get(url)
            .cloned()
            .ok_or(TransportError::BadResponseStatus(404))
    }
}

impl Transport for MockTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        self.fetch(url)
    }

    fn download(&self, url: &str, destination: &Path) -> Result<(), TransportError> {
        let bytes = self.fetch(url)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, bytes)?;
        Ok(())
    }
}

/// Treats every line of an archive as a directory to create
pub struct MockArchiver;

impl Archiver for MockArchiver {
    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
        let contents = fs::read_to_string(archive)?;
        for entry in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let directory = destination.join(entry);
            fs::create_dir_all(&directory)?;
            fs::write(directory.join("payload"), entry)?;
        }
        Ok(())
    }
}

/// Uses the content itself as its checksum
pub struct ContentChecksum;

impl ChecksumAlgorithm for ContentChecksum {
    fn checksum(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).trim().to_string()
    }
}

/// Records delegate events as short strings
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingDelegate::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix("warning: ").map(str::to_string))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl WorkspaceDelegate for RecordingDelegate {
    fn will_fetch(&self, repository: &RepositorySpecifier) {
        self.record(format!("will_fetch: {}", repository));
    }

    fn will_update(&self, repository: &RepositorySpecifier) {
        self.record(format!("will_update: {}", repository));
    }

    fn will_checkout(&self, repository: &RepositorySpecifier, revision: &str, _path: &Path) {
        self.record(format!("will_checkout: {} at {}", repository, revision));
    }

    fn will_remove(&self, path: &Path) {
        self.record(format!("will_remove: {}", path.display()));
    }

    fn will_resolve_dependencies(&self, reason: Option<&ResolutionReason>) {
        match reason {
            Some(reason) => self.record(format!("will_resolve: {}", reason)),
            None => self.record("will_resolve".to_string()),
        }
    }

    fn dependencies_up_to_date(&self) {
        self.record("up_to_date".to_string());
    }

    fn will_parse_manifest(&self, path: &Path) {
        self.record(format!("will_parse: {}", path.display()));
    }

    fn will_download_artifact(&self, url: &str) {
        self.record(format!("will_download: {}", url));
    }

    fn did_download_artifact(&self, url: &str, error: Option<&str>) {
        match error {
            Some(error) => self.record(format!("did_download: {} failed: {}", url, error)),
            None => self.record(format!("did_download: {}", url)),
        }
    }

    fn warning(&self, message: &str) {
        self.record(format!("warning: {}", message));
    }
}

/// A workspace in a temporary directory wired to the mocks
pub struct TestWorkspace {
    pub dir: TempDir,
    pub repositories: Arc<MockRepositories>,
    pub transport: Arc<MockTransport>,
    pub delegate: Arc<RecordingDelegate>,
    pub configuration: Configuration,
    pub workspace: Workspace,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self::with_configuration(test_configuration())
    }

    pub fn with_configuration(configuration: Configuration) -> Self {
        let dir = TempDir::new().unwrap();
        let repositories = MockRepositories::new();
        let transport = MockTransport::new();
        let delegate = RecordingDelegate::new();
        let workspace = build(dir.path(), &repositories, &transport, &delegate, configuration.clone());
        TestWorkspace {
            dir,
            repositories,
            transport,
            delegate,
            configuration,
            workspace,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a root package under `roots/<name>` and return its path
    pub fn add_root(&self, name: &str, manifest: &ManifestBuilder) -> PathBuf {
        manifest.write(&self.root().join("roots").join(name))
    }

    /// Reopen the workspace from disk, as a new process would
    pub fn reopen(&mut self) {
        self.reopen_with(self.configuration.clone());
    }

    pub fn reopen_with(&mut self, configuration: Configuration) {
        self.configuration = configuration.clone();
        self.workspace = build(
            self.dir.path(),
            &self.repositories,
            &self.transport,
            &self.delegate,
            configuration,
        );
    }

    pub fn checkout_path(&self, name: &str) -> PathBuf {
        let identity = PackageIdentity::plain(name);
        let state = self.workspace.state();
        let dependency = state.dependency(&identity).unwrap();
        self.workspace.path_of(dependency)
    }

    /// Revision recorded in the working copy of `name`
    pub fn revision_on_disk(&self, name: &str) -> String {
        fs::read_to_string(self.checkout_path(name).join(REVISION_MARKER)).unwrap()
    }

    pub fn pinned_revision(&self, name: &str) -> Option<String> {
        self.workspace
            .pins()
            .get(&PackageIdentity::plain(name))
            .map(|pin| pin.state.revision.to_string())
    }
}

pub fn test_configuration() -> Configuration {
    Configuration {
        worker_threads: 2,
        host_triple: "x86_64-unknown-linux-gnu".to_string(),
        ..Configuration::default()
    }
}

fn build(
    root: &Path,
    repositories: &Arc<MockRepositories>,
    transport: &Arc<MockTransport>,
    delegate: &Arc<RecordingDelegate>,
    configuration: Configuration,
) -> Workspace {
    WorkspaceBuilder::new(root, repositories.clone())
        .with_configuration(configuration)
        .with_delegate(delegate.clone())
        .with_transport(transport.clone())
        .with_archiver(Arc::new(MockArchiver))
        .with_checksum_algorithm(Arc::new(ContentChecksum))
        .build()
        .unwrap()
}
