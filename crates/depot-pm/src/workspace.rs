//! Workspace operations
//!
//! A [`Workspace`] owns everything materialized for a set of root packages:
//! the managed dependency ledger, the pins file, checkouts, editable working
//! copies and binary artifacts. Every mutating operation takes the operation
//! lock, works on a copy of the ledger and pins, and publishes them only once
//! the operation has produced its result. Readers never wait for I/O.
//!
//! Layout under the workspace root:
//!
//! ```text
//! depot.resolved            pins
//! Packages/<name>           editable working copies
//! .depot/checkouts/<name>   managed checkouts
//! .depot/repositories/      repository copies
//! .depot/artifacts/         binary artifacts
//! .depot/manifest-cache/    evaluated manifests
//! .depot/workspace-state.json
//! ```

use crate::artifacts::{
    Archiver, ArtifactPipeline, BinaryTarget, ChecksumAlgorithm, FileArchiver, HttpTransport,
    Sha256Checksum, Transport,
};
use crate::config::Configuration;
use crate::constraint::{PackageConstraint, ProductFilter, Requirement};
use crate::container::{BoundVersion, ContainerProvider, WorkspaceContainerProvider};
use crate::delegate::{NoopDelegate, WorkspaceDelegate};
use crate::error::{Diagnostics, StaleStateError, StateTransitionError, WorkspaceError};
use crate::executor::{spawn_detached, wait_all, Executor, TaskHandle};
use crate::fsutil;
use crate::identity::{IdentityConflictError, IdentityRegistry, PackageIdentity, PackageKind, PackageReference};
use crate::manifest::{Manifest, ManifestEvaluator, PackageDependency, TomlManifestEvaluator};
use crate::manifest_cache::ManifestCache;
use crate::pins::{PinsStore, PINS_FILE_NAME};
use crate::precompute::{Precomputation, PrecomputeResult};
use crate::resolver::{Resolution, ResolutionError, Resolver};
use crate::source_control::{RepositoryManager, RepositoryProvider, Revision, SourceControlError};
use crate::state::{
    default_subpath, CheckoutState, DependencyState, ManagedDependency, WorkspaceState, STATE_FILE_NAME,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Data directory name under the workspace root
pub const DATA_DIR_NAME: &str = ".depot";

/// Default editables directory name under the workspace root
pub const EDITABLES_DIR_NAME: &str = "Packages";

/// Where a workspace keeps its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLocation {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub editables_dir: PathBuf,
    pub pins_file: PathBuf,
}

impl WorkspaceLocation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        WorkspaceLocation {
            data_dir: root.join(DATA_DIR_NAME),
            editables_dir: root.join(EDITABLES_DIR_NAME),
            pins_file: root.join(PINS_FILE_NAME),
            root,
        }
    }

    pub fn checkouts_dir(&self) -> PathBuf {
        self.data_dir.join("checkouts")
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.data_dir.join("repositories")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn manifest_cache_dir(&self) -> PathBuf {
        self.data_dir.join("manifest-cache")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }
}

/// A package of the resolved graph and where its sources are
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub package: PackageReference,
    pub manifest: Arc<Manifest>,
    pub path: PathBuf,
}

/// Packages of the resolved graph in discovery order, roots first
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    pub packages: Vec<ResolvedPackage>,
}

impl ResolvedGraph {
    pub fn package(&self, identity: &str) -> Option<&ResolvedPackage> {
        let identity = PackageIdentity::plain(identity);
        self.packages.iter().find(|p| p.package.identity == identity)
    }

    pub fn identities(&self) -> Vec<String> {
        self.packages
            .iter()
            .map(|p| p.package.identity.to_string())
            .collect()
    }
}

/// What an update changed, or would change in a dry run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub added: Vec<(PackageReference, DependencyState)>,
    pub removed: Vec<PackageReference>,
    pub updated: Vec<(PackageReference, DependencyState, DependencyState)>,
}

impl UpdateReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Builds a [`Workspace`]; only the repository provider is mandatory
pub struct WorkspaceBuilder {
    location: WorkspaceLocation,
    configuration: Configuration,
    repository_provider: Arc<dyn RepositoryProvider>,
    delegate: Arc<dyn WorkspaceDelegate>,
    evaluator: Arc<dyn ManifestEvaluator>,
    transport: Option<Arc<dyn Transport>>,
    archiver: Arc<dyn Archiver>,
    checksum: Arc<dyn ChecksumAlgorithm>,
}

impl WorkspaceBuilder {
    pub fn new(root: impl Into<PathBuf>, repository_provider: Arc<dyn RepositoryProvider>) -> Self {
        WorkspaceBuilder {
            location: WorkspaceLocation::new(root),
            configuration: Configuration::default(),
            repository_provider,
            delegate: Arc::new(NoopDelegate),
            evaluator: Arc::new(TomlManifestEvaluator),
            transport: None,
            archiver: Arc::new(FileArchiver),
            checksum: Arc::new(Sha256Checksum),
        }
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn WorkspaceDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ManifestEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_checksum_algorithm(mut self, checksum: Arc<dyn ChecksumAlgorithm>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_editables_dir(mut self, editables_dir: PathBuf) -> Self {
        self.location.editables_dir = editables_dir;
        self
    }

    pub fn build(self) -> Result<Workspace, WorkspaceError> {
        let configuration = self.configuration;
        let location = self.location;
        let executor = Arc::new(Executor::new(configuration.worker_threads)?);

        let manifests = ManifestCache::new(self.evaluator, self.delegate.clone())
            .with_directory(location.manifest_cache_dir())
            .with_tools_version(configuration.tools_version)
            .with_minimum_tools_version(configuration.minimum_tools_version)
            .with_mirrors(configuration.mirrors.clone());
        manifests.capture_environment(&configuration.manifest_environment);

        let repositories_dir = configuration
            .shared_cache_directory()
            .map(|dir| dir.join("repositories"))
            .unwrap_or_else(|| location.repositories_dir());
        let repositories = RepositoryManager::new(repositories_dir, self.repository_provider, self.delegate.clone());

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let artifacts = ArtifactPipeline::new(
            location.artifacts_dir(),
            configuration.host_triple.clone(),
            transport,
            self.archiver,
            self.checksum,
            self.delegate.clone(),
            executor.clone(),
        );

        let state = WorkspaceState::load(&location.state_file())?;
        let pins = PinsStore::load(&location.pins_file)?;
        tracing::debug!(
            root = %location.root.display(),
            dependencies = state.dependencies().count(),
            pins = pins.len(),
            "Opened workspace"
        );

        Ok(Workspace {
            location,
            configuration,
            delegate: self.delegate,
            manifests: Arc::new(manifests),
            repositories: Arc::new(repositories),
            executor,
            artifacts,
            operation: Mutex::new(()),
            state: RwLock::new(state),
            pins: RwLock::new(pins),
        })
    }
}

/// Inputs of one operation: loaded roots and the root-level constraints
struct Session {
    roots: Vec<(PackageReference, Arc<Manifest>)>,
    /// Packages the caller asked for next to the roots
    requested: Vec<PackageIdentity>,
    constraints: Vec<PackageConstraint>,
}

impl Session {
    fn root_identities(&self) -> HashSet<PackageIdentity> {
        self.roots.iter().map(|(p, _)| p.identity.clone()).collect()
    }
}

/// A successful resolution and the ledger state it calls for
struct Plan {
    resolution: Resolution,
    desired: Vec<(PackageReference, DependencyState)>,
}

/// The dependency workspace of a set of root packages
pub struct Workspace {
    location: WorkspaceLocation,
    configuration: Configuration,
    delegate: Arc<dyn WorkspaceDelegate>,
    manifests: Arc<ManifestCache>,
    repositories: Arc<RepositoryManager>,
    executor: Arc<Executor>,
    artifacts: ArtifactPipeline,
    /// Held by every mutating operation
    operation: Mutex<()>,
    state: RwLock<WorkspaceState>,
    pins: RwLock<PinsStore>,
}

impl Workspace {
    pub fn location(&self) -> &WorkspaceLocation {
        &self.location
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn manifests(&self) -> &Arc<ManifestCache> {
        &self.manifests
    }

    /// Snapshot of the managed dependency ledger
    pub fn state(&self) -> WorkspaceState {
        self.state.read().clone()
    }

    /// Snapshot of the pins
    pub fn pins(&self) -> PinsStore {
        self.pins.read().clone()
    }

    /// Where the sources of a managed dependency live
    pub fn path_of(&self, dependency: &ManagedDependency) -> PathBuf {
        match &dependency.state {
            DependencyState::Checkout(_) => self.checkout_path(dependency),
            DependencyState::Edited { .. } => self.edit_path(dependency),
            DependencyState::Local => PathBuf::from(&dependency.package.location),
        }
    }

    /// Resolve the dependencies of `roots` and materialize them
    ///
    /// Resolution only runs when the current checkouts no longer satisfy the
    /// declared requirements; otherwise the graph is loaded from disk.
    #[tracing::instrument(skip_all, fields(roots = roots.len()))]
    pub fn resolve(
        &self,
        roots: &[PathBuf],
        dependencies: &[PackageDependency],
    ) -> Result<ResolvedGraph, WorkspaceError> {
        let _operation = self.operation.lock();
        self.repositories.begin_operation();
        let mut state = self.state.read().clone();
        let mut pins = self.pins.read().clone();
        let mut diagnostics = Diagnostics::new();

        if self.heal(&mut state, &mut pins, &mut diagnostics) {
            self.store(&state, None)?;
        }
        let session = self.prepare(&state, roots, dependencies)?;

        let graph = if self.configuration.force_resolved_versions {
            let plan = self.resolve_forced(&session, &state, &pins)?;
            let graph = self.graph_from_resolution(&plan.resolution, &state);
            self.validate(&graph)?;
            self.apply(&plan, &mut state, None, &mut diagnostics);
            self.release_orphaned_edits(&session, &graph, &mut state);
            graph
        } else {
            match self.precompute(&session, &state, &pins) {
                PrecomputeResult::NotRequired => {
                    tracing::debug!("Dependencies are up to date; skipping resolution");
                    let graph = self.graph_from_disk(&session, &state)?;
                    self.validate(&graph)?;
                    self.release_orphaned_edits(&session, &graph, &mut state);
                    graph
                }
                PrecomputeResult::Required(reason) => {
                    tracing::info!(%reason, "Resolving dependencies");
                    self.delegate.will_resolve_dependencies(Some(&reason));
                    let plan = self.solve(&session, &state, pins.states(), false)?;
                    let graph = self.graph_from_resolution(&plan.resolution, &state);
                    self.validate(&graph)?;
                    self.apply(&plan, &mut state, Some(&mut pins), &mut diagnostics);
                    self.release_orphaned_edits(&session, &graph, &mut state);
                    graph
                }
            }
        };

        if diagnostics.is_empty() {
            self.update_artifacts(&graph, &mut state, &mut diagnostics);
        }
        self.store(&state, Some(pins))?;
        diagnostics.into_result()?;
        Ok(graph)
    }

    /// Re-resolve ignoring the pins of `packages` (all pins when empty)
    #[tracing::instrument(skip_all, fields(packages = ?packages, dry_run))]
    pub fn update(&self, roots: &[PathBuf], packages: &[String], dry_run: bool) -> Result<UpdateReport, WorkspaceError> {
        let _operation = self.operation.lock();
        self.repositories.begin_operation();
        let mut state = self.state.read().clone();
        let mut pins = self.pins.read().clone();
        let mut diagnostics = Diagnostics::new();

        if !dry_run && self.heal(&mut state, &mut pins, &mut diagnostics) {
            self.store(&state, None)?;
        }
        let session = self.prepare(&state, roots, &[])?;

        let selected: HashSet<PackageIdentity> = packages.iter().map(|name| PackageIdentity::plain(name)).collect();
        let mut hints = pins.states();
        if selected.is_empty() {
            hints.clear();
        } else {
            hints.retain(|identity, _| !selected.contains(identity));
        }

        self.delegate.will_resolve_dependencies(None);
        let plan = self.solve(&session, &state, hints, false)?;
        let graph = self.graph_from_resolution(&plan.resolution, &state);
        self.validate(&graph)?;

        let report = Self::report(&plan, &state);
        if dry_run {
            return Ok(report);
        }

        self.apply(&plan, &mut state, Some(&mut pins), &mut diagnostics);
        self.release_orphaned_edits(&session, &graph, &mut state);
        if diagnostics.is_empty() {
            self.update_artifacts(&graph, &mut state, &mut diagnostics);
        }
        self.store(&state, Some(pins))?;
        diagnostics.into_result()?;

        if report.is_empty() {
            self.delegate.dependencies_up_to_date();
        }
        Ok(report)
    }

    /// Pin one dependency to `requirement` and resolve everything else around it
    ///
    /// The new pin is kept by later resolutions until an update selects it.
    #[tracing::instrument(skip_all, fields(package = %name, %requirement))]
    pub fn resolve_to(&self, roots: &[PathBuf], name: &str, requirement: Requirement) -> Result<(), WorkspaceError> {
        let _operation = self.operation.lock();
        if requirement == Requirement::Unversioned {
            return Err(StateTransitionError::UnversionedRequirement(name.to_string()).into());
        }
        self.repositories.begin_operation();
        let mut state = self.state.read().clone();
        let mut pins = self.pins.read().clone();
        let mut diagnostics = Diagnostics::new();

        let identity = PackageIdentity::plain(name);
        let dependency = state
            .dependency(&identity)
            .cloned()
            .ok_or_else(|| StateTransitionError::UnknownDependency(name.to_string()))?;
        match &dependency.state {
            DependencyState::Local => return Err(StateTransitionError::LocalNotEditable(name.to_string()).into()),
            DependencyState::Edited { .. } => return Err(StateTransitionError::AlreadyEdited(name.to_string()).into()),
            DependencyState::Checkout(_) => {}
        }

        let mut session = self.prepare(&state, roots, &[])?;
        session.constraints.push(PackageConstraint::new(
            dependency.package.clone(),
            requirement,
            ProductFilter::default(),
        ));
        let mut hints = pins.states();
        hints.remove(&identity);

        self.delegate.will_resolve_dependencies(None);
        let plan = self.solve(&session, &state, hints, false)?;
        let graph = self.graph_from_resolution(&plan.resolution, &state);
        self.validate(&graph)?;

        self.apply(&plan, &mut state, Some(&mut pins), &mut diagnostics);
        self.release_orphaned_edits(&session, &graph, &mut state);
        if diagnostics.is_empty() {
            self.update_artifacts(&graph, &mut state, &mut diagnostics);
        }
        self.store(&state, Some(pins))?;
        diagnostics.into_result()
    }

    /// Replace the managed checkout of `name` with an editable working copy
    ///
    /// The copy goes to `path` when given (and is then never deleted by the
    /// workspace), otherwise to the editables directory. An existing working
    /// copy at the destination is reused.
    #[tracing::instrument(skip_all, fields(package = %name))]
    pub fn edit(
        &self,
        name: &str,
        path: Option<PathBuf>,
        revision: Option<Revision>,
        branch: Option<String>,
    ) -> Result<(), WorkspaceError> {
        let _operation = self.operation.lock();
        let mut state = self.state.read().clone();
        let mut pins = self.pins.read().clone();

        let identity = PackageIdentity::plain(name);
        let dependency = state
            .dependency(&identity)
            .cloned()
            .ok_or_else(|| StateTransitionError::UnknownDependency(name.to_string()))?;
        let checkout = match &dependency.state {
            DependencyState::Local => return Err(StateTransitionError::LocalNotEditable(name.to_string()).into()),
            DependencyState::Edited { .. } => {
                return Err(StateTransitionError::AlreadyEdited(name.to_string()).into())
            }
            DependencyState::Checkout(checkout) => checkout.clone(),
        };
        let repository = dependency
            .package
            .repository()
            .ok_or_else(|| StateTransitionError::LocalNotEditable(name.to_string()))?;

        let handle = self.repositories.lookup(&repository, true)?;
        if let Some(revision) = &revision {
            if !handle.open()?.exists(revision) {
                return Err(StateTransitionError::RevisionNotFound(revision.to_string()).into());
            }
        }

        let destination = path
            .clone()
            .unwrap_or_else(|| self.location.editables_dir.join(&dependency.subpath));
        let mut working_copy = if destination.exists() {
            tracing::info!(path = %destination.display(), "Using existing working copy");
            self.repositories.provider().open_working_copy(&destination)?
        } else {
            self.delegate
                .will_checkout(&repository, checkout.revision.as_str(), &destination);
            let mut working_copy = handle.create_working_copy(&destination, true)?;
            working_copy.checkout_revision(&checkout.revision)?;
            working_copy
        };
        if let Some(revision) = &revision {
            working_copy.checkout_revision(revision)?;
        }
        if let Some(branch) = &branch {
            working_copy.checkout_new_branch(branch).map_err(|e| match e {
                SourceControlError::BranchExists(branch) => StateTransitionError::BranchExists(branch).into(),
                other => WorkspaceError::from(other),
            })?;
        }

        self.remove_checkout(&dependency);
        state.add_dependency(dependency.edited(path));
        pins.unpin(&identity);
        self.store(&state, Some(pins))
    }

    /// Leave edit mode and restore the checkout the edit started from
    ///
    /// Refuses to drop uncommitted changes unless `force` is set.
    #[tracing::instrument(skip_all, fields(package = %name, force))]
    pub fn unedit(&self, name: &str, force: bool) -> Result<(), WorkspaceError> {
        let _operation = self.operation.lock();
        let mut state = self.state.read().clone();
        let mut pins = self.pins.read().clone();

        let identity = PackageIdentity::plain(name);
        let dependency = state
            .dependency(&identity)
            .cloned()
            .ok_or_else(|| StateTransitionError::UnknownDependency(name.to_string()))?;
        let DependencyState::Edited { basis, unmanaged_path } = &dependency.state else {
            return Err(StateTransitionError::NotEdited(name.to_string()).into());
        };

        let edit_path = self.edit_path(&dependency);
        if edit_path.exists() {
            if !force {
                let working_copy = self.repositories.provider().open_working_copy(&edit_path)?;
                if working_copy.has_uncommitted_changes() {
                    return Err(StateTransitionError::UncommittedChanges {
                        name: name.to_string(),
                        path: edit_path,
                    }
                    .into());
                }
            }
            if unmanaged_path.is_none() {
                self.delegate.will_remove(&edit_path);
                fsutil::remove_path(&edit_path)?;
                if let Err(e) = fs::remove_dir(&self.location.editables_dir) {
                    tracing::debug!(error = %e, "Keeping editables directory");
                }
            }
        }

        match basis {
            Some(basis) => {
                let basis = (**basis).clone();
                state.add_dependency(basis.clone());
                if let Some(checkout) = basis.checkout_state() {
                    pins.pin(basis.package.clone(), checkout.clone());
                    if !self.checkout_path(&basis).exists() {
                        for result in self.materialize(vec![basis]) {
                            result?;
                        }
                    }
                }
            }
            None => {
                state.remove_dependency(&identity);
                pins.unpin(&identity);
            }
        }
        self.store(&state, Some(pins))
    }

    /// Whether [`Workspace::resolve`] would need to run the resolver
    pub fn precompute_resolution(
        &self,
        roots: &[PathBuf],
        dependencies: &[PackageDependency],
    ) -> Result<PrecomputeResult, WorkspaceError> {
        let state = self.state.read().clone();
        let pins = self.pins.read().clone();
        let session = self.prepare(&state, roots, dependencies)?;
        Ok(self.precompute(&session, &state, &pins))
    }

    /// Remove derived data, keeping repositories, checkouts and the ledger
    pub fn clean(&self) -> Result<(), WorkspaceError> {
        let _operation = self.operation.lock();
        self.manifests.purge()?;
        if !self.location.data_dir.exists() {
            return Ok(());
        }
        let keep = [
            self.location.checkouts_dir(),
            self.location.repositories_dir(),
            self.location.state_file(),
        ];
        for entry in fs::read_dir(&self.location.data_dir)? {
            let path = entry?.path();
            if !keep.contains(&path) {
                fsutil::remove_path(&path)?;
            }
        }
        Ok(())
    }

    /// Remove the whole data directory and forget the ledger; pins are kept
    pub fn reset(&self) -> Result<(), WorkspaceError> {
        let _operation = self.operation.lock();
        self.repositories.reset()?;
        self.manifests.purge()?;
        fsutil::remove_path(&self.location.data_dir)?;
        self.state.write().clear();
        Ok(())
    }

    /// [`Workspace::resolve`] on its own thread
    pub fn resolve_async(
        self: &Arc<Self>,
        roots: Vec<PathBuf>,
        dependencies: Vec<PackageDependency>,
    ) -> TaskHandle<Result<ResolvedGraph, WorkspaceError>> {
        let workspace = self.clone();
        spawn_detached("depot-resolve", move || workspace.resolve(&roots, &dependencies))
    }

    /// [`Workspace::update`] on its own thread
    pub fn update_async(
        self: &Arc<Self>,
        roots: Vec<PathBuf>,
        packages: Vec<String>,
        dry_run: bool,
    ) -> TaskHandle<Result<UpdateReport, WorkspaceError>> {
        let workspace = self.clone();
        spawn_detached("depot-update", move || workspace.update(&roots, &packages, dry_run))
    }

    /// [`Workspace::precompute_resolution`] on its own thread
    pub fn precompute_resolution_async(
        self: &Arc<Self>,
        roots: Vec<PathBuf>,
        dependencies: Vec<PackageDependency>,
    ) -> TaskHandle<Result<PrecomputeResult, WorkspaceError>> {
        let workspace = self.clone();
        spawn_detached("depot-precompute", move || {
            workspace.precompute_resolution(&roots, &dependencies)
        })
    }

    fn checkout_path(&self, dependency: &ManagedDependency) -> PathBuf {
        self.location.checkouts_dir().join(&dependency.subpath)
    }

    fn edit_path(&self, dependency: &ManagedDependency) -> PathBuf {
        match &dependency.state {
            DependencyState::Edited {
                unmanaged_path: Some(path),
                ..
            } => path.clone(),
            _ => self.location.editables_dir.join(&dependency.subpath),
        }
    }

    fn warn(&self, message: String) {
        tracing::warn!("{}", message);
        self.delegate.warning(&message);
    }

    /// Load roots and build the root-level constraints
    ///
    /// Edited packages become unversioned root-level constraints, so their
    /// working copy overrides every other requirement on them.
    fn prepare(
        &self,
        state: &WorkspaceState,
        roots: &[PathBuf],
        dependencies: &[PackageDependency],
    ) -> Result<Session, WorkspaceError> {
        let mut loaded = Vec::with_capacity(roots.len());
        let mut names = HashSet::new();
        for path in roots {
            let manifest = self.manifests.load(path, PackageKind::Root)?;
            if !names.insert(manifest.name.to_lowercase()) {
                return Err(IdentityConflictError::DuplicateRootName(manifest.name.clone()).into());
            }
            loaded.push((PackageReference::root(path), manifest));
        }

        let mut constraints: Vec<PackageConstraint> = loaded
            .iter()
            .map(|(package, _)| {
                PackageConstraint::new(package.clone(), Requirement::Unversioned, ProductFilter::Everything)
            })
            .collect();
        let mut requested = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let mut dependency = dependency.clone();
            if !dependency.is_local() {
                dependency.location = self.configuration.mirrors.effective(&dependency.location);
            }
            requested.push(dependency.identity());
            constraints.push(PackageConstraint::new(
                dependency.package_ref(),
                dependency.requirement.clone(),
                dependency.products.clone().unwrap_or(ProductFilter::Everything),
            ));
        }

        let root_identities: HashSet<&PackageIdentity> = loaded.iter().map(|(p, _)| &p.identity).collect();
        constraints.extend(
            state
                .dependencies()
                .filter(|d| d.is_edited() && !root_identities.contains(&d.package.identity))
                .map(|d| {
                    PackageConstraint::new(d.package.clone(), Requirement::Unversioned, ProductFilter::default())
                }),
        );
        Ok(Session {
            roots: loaded,
            requested,
            constraints,
        })
    }

    fn container_provider(&self, state: &WorkspaceState) -> WorkspaceContainerProvider {
        let edited: HashMap<PackageIdentity, PathBuf> = state
            .dependencies()
            .filter(|d| d.is_edited())
            .map(|d| (d.package.identity.clone(), self.edit_path(d)))
            .collect();
        WorkspaceContainerProvider::new(
            self.repositories.clone(),
            self.manifests.clone(),
            self.executor.clone(),
            self.configuration.skip_update,
        )
        .with_edited(edited)
    }

    fn precompute(&self, session: &Session, state: &WorkspaceState, pins: &PinsStore) -> PrecomputeResult {
        let checkouts = self.location.checkouts_dir();
        Precomputation {
            state,
            pins,
            manifests: &self.manifests,
            checkouts: &checkouts,
            editables: &self.location.editables_dir,
            policy: self.configuration.prerelease_policy,
        }
        .compute(&session.constraints)
    }

    fn solve(
        &self,
        session: &Session,
        state: &WorkspaceState,
        hints: BTreeMap<PackageIdentity, CheckoutState>,
        locked: bool,
    ) -> Result<Plan, WorkspaceError> {
        let provider = self.container_provider(state);
        let mut resolver = Resolver::new(&provider)
            .with_pins(hints)
            .with_prerelease_policy(self.configuration.prerelease_policy);
        if locked {
            resolver = resolver.locked();
        }
        let resolution = resolver.resolve(session.constraints.clone())?;

        let mut desired = Vec::new();
        for binding in resolution.iter().filter(|b| !b.package.is_root()) {
            let identity = &binding.package.identity;
            let target = match &binding.binding {
                BoundVersion::Unversioned => match state.dependency(identity) {
                    Some(current) if current.is_edited() => current.state.clone(),
                    _ if binding.package.kind == PackageKind::Local => DependencyState::Local,
                    _ => continue,
                },
                BoundVersion::Version(version) => {
                    let revision = provider
                        .container(&binding.package)?
                        .revision_for_version(version)?;
                    DependencyState::Checkout(CheckoutState::version(version.clone(), revision))
                }
                BoundVersion::Revision {
                    revision,
                    branch: Some(branch),
                } => DependencyState::Checkout(CheckoutState::branch(branch.clone(), revision.clone())),
                BoundVersion::Revision { revision, branch: None } => {
                    DependencyState::Checkout(CheckoutState::revision(revision.clone()))
                }
            };
            desired.push((binding.package.clone(), target));
        }
        Ok(Plan { resolution, desired })
    }

    /// Resolve strictly from the pins file
    fn resolve_forced(&self, session: &Session, state: &WorkspaceState, pins: &PinsStore) -> Result<Plan, WorkspaceError> {
        if !pins.file_exists() {
            return Err(StaleStateError::ResolvedFileRequired {
                path: pins.path().to_path_buf(),
            }
            .into());
        }
        let out_of_date = |reason: String| -> WorkspaceError {
            StaleStateError::OutOfDate {
                path: pins.path().to_path_buf(),
                reason,
            }
            .into()
        };

        let plan = match self.solve(session, state, pins.states(), true) {
            Ok(plan) => plan,
            Err(WorkspaceError::Resolution(
                e @ (ResolutionError::Conflict(_)
                | ResolutionError::NotPinned(_)
                | ResolutionError::PinNotSatisfying { .. }),
            )) => return Err(out_of_date(e.to_string())),
            Err(e) => return Err(e),
        };

        let checkouts: HashSet<&PackageIdentity> = plan
            .desired
            .iter()
            .filter(|(_, s)| matches!(s, DependencyState::Checkout(_)))
            .map(|(p, _)| &p.identity)
            .collect();
        if let Some(extra) = pins.iter().find(|pin| !checkouts.contains(&pin.package.identity)) {
            return Err(out_of_date(format!("'{}' is no longer required", extra.package.identity)));
        }
        Ok(plan)
    }

    /// Materialize `plan` into `state`; pins follow the resulting checkouts
    ///
    /// Checkout failures are collected and leave the package in its previous
    /// state; the other packages are still committed.
    fn apply(
        &self,
        plan: &Plan,
        state: &mut WorkspaceState,
        pins: Option<&mut PinsStore>,
        diagnostics: &mut Diagnostics,
    ) {
        let wanted: HashSet<&PackageIdentity> = plan.desired.iter().map(|(p, _)| &p.identity).collect();
        let removed: Vec<ManagedDependency> = state
            .dependencies()
            .filter(|d| !wanted.contains(&d.package.identity) && !d.is_edited())
            .cloned()
            .collect();
        for dependency in removed {
            tracing::info!(package = %dependency.package.identity, "Removing dependency");
            self.remove_checkout(&dependency);
            state.remove_dependency(&dependency.package.identity);
        }

        let mut jobs = Vec::new();
        for (package, target) in &plan.desired {
            let current = state.dependency(&package.identity).cloned();
            match target {
                DependencyState::Edited { .. } => {}
                DependencyState::Local => {
                    if let Some(current) = &current {
                        self.remove_checkout(current);
                    }
                    state.add_dependency(ManagedDependency::local(package.clone()));
                }
                DependencyState::Checkout(checkout) => {
                    if let Some(current) = &current {
                        let up_to_date = current.package.location == package.location
                            && current.checkout_state() == Some(checkout)
                            && self.checkout_path(current).exists();
                        if up_to_date {
                            continue;
                        }
                        if current.package.location != package.location {
                            self.remove_checkout(current);
                        }
                    }
                    jobs.push(ManagedDependency::checkout(package.clone(), checkout.clone()));
                }
            }
        }

        for result in self.materialize(jobs) {
            match result {
                Ok(dependency) => state.add_dependency(dependency),
                Err(e) => diagnostics.push(e),
            }
        }

        if let Some(pins) = pins {
            pins.clear();
            for dependency in state.dependencies() {
                if let Some(checkout) = dependency.checkout_state() {
                    pins.pin(dependency.package.clone(), checkout.clone());
                }
            }
        }
    }

    /// Create or move checkouts in parallel, in submission order
    fn materialize(&self, dependencies: Vec<ManagedDependency>) -> Vec<Result<ManagedDependency, WorkspaceError>> {
        let handles: Vec<_> = dependencies
            .into_iter()
            .map(|dependency| {
                let repositories = self.repositories.clone();
                let delegate = self.delegate.clone();
                let path = self.checkout_path(&dependency);
                let skip_update = self.configuration.skip_update;
                self.executor.spawn(move || {
                    checkout(&repositories, delegate.as_ref(), dependency, &path, skip_update)
                })
            })
            .collect();
        wait_all(handles)
            .into_iter()
            .map(|result| {
                result
                    .map_err(|e| WorkspaceError::Interrupted(e.to_string()))
                    .and_then(|checked_out| checked_out)
            })
            .collect()
    }

    /// Forget what edited packages nobody requires any more were based on
    ///
    /// Only the roots and the requested packages count as requirements, so an
    /// edit that is merely kept alive by its own override is released and
    /// unediting it drops the package.
    fn release_orphaned_edits(&self, session: &Session, graph: &ResolvedGraph, state: &mut WorkspaceState) {
        let manifests: HashMap<&PackageIdentity, &Manifest> = graph
            .packages
            .iter()
            .map(|p| (&p.package.identity, p.manifest.as_ref()))
            .collect();

        let mut required: HashSet<PackageIdentity> = HashSet::new();
        let mut queue: VecDeque<PackageIdentity> = session
            .roots
            .iter()
            .map(|(package, _)| package.identity.clone())
            .chain(session.requested.iter().cloned())
            .collect();
        while let Some(identity) = queue.pop_front() {
            if let Some(manifest) = manifests.get(&identity) {
                if !required.contains(&identity) {
                    queue.extend(manifest.dependencies.iter().map(PackageDependency::identity));
                }
            }
            required.insert(identity);
        }

        let orphaned: Vec<ManagedDependency> = state
            .dependencies()
            .filter(|d| d.basis().is_some() && !required.contains(&d.package.identity))
            .cloned()
            .collect();
        for dependency in orphaned {
            tracing::info!(package = %dependency.package.identity, "Edited dependency is no longer required");
            state.add_dependency(dependency.without_basis());
        }
    }

    /// Delete the managed checkout of `dependency`, if it has one
    fn remove_checkout(&self, dependency: &ManagedDependency) {
        if dependency.checkout_state().is_none() {
            return;
        }
        let path = self.checkout_path(dependency);
        if !path.exists() {
            return;
        }
        self.delegate.will_remove(&path);
        if let Err(e) = fsutil::remove_path(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove checkout");
        }
    }

    /// Repair checkouts and edits removed behind the workspace's back
    ///
    /// Returns whether the ledger changed.
    fn heal(&self, state: &mut WorkspaceState, pins: &mut PinsStore, diagnostics: &mut Diagnostics) -> bool {
        let mut changed = false;
        let mut jobs = Vec::new();
        let dependencies: Vec<ManagedDependency> = state.dependencies().cloned().collect();

        for dependency in dependencies {
            let identity = dependency.package.identity.clone();
            match &dependency.state {
                DependencyState::Checkout(_) if !self.checkout_path(&dependency).exists() => {
                    self.warn(format!("dependency '{}' is missing; cloning again", identity));
                    jobs.push(dependency.clone());
                }
                DependencyState::Edited { basis, .. } if !self.edit_path(&dependency).exists() => {
                    self.warn(format!(
                        "dependency '{}' was being edited but is missing; falling back to original checkout",
                        identity
                    ));
                    changed = true;
                    match basis {
                        Some(basis) => {
                            let basis = (**basis).clone();
                            state.add_dependency(basis.clone());
                            if let Some(checkout) = basis.checkout_state() {
                                pins.pin(basis.package.clone(), checkout.clone());
                                if !self.checkout_path(&basis).exists() {
                                    jobs.push(basis);
                                }
                            }
                        }
                        None => {
                            state.remove_dependency(&identity);
                        }
                    }
                }
                _ => {}
            }
        }

        for result in self.materialize(jobs) {
            if let Err(e) = result {
                diagnostics.push(e);
            }
        }
        changed
    }

    fn graph_from_resolution(&self, resolution: &Resolution, state: &WorkspaceState) -> ResolvedGraph {
        let packages = resolution
            .iter()
            .map(|binding| {
                let path = match (binding.package.kind, state.dependency(&binding.package.identity)) {
                    (PackageKind::Root | PackageKind::Local, _) => PathBuf::from(&binding.package.location),
                    (PackageKind::Remote, Some(current)) if current.is_edited() => self.edit_path(current),
                    (PackageKind::Remote, _) => self
                        .location
                        .checkouts_dir()
                        .join(default_subpath(&binding.package)),
                };
                ResolvedPackage {
                    package: binding.package.clone(),
                    manifest: binding.manifest.clone(),
                    path,
                }
            })
            .collect();
        ResolvedGraph { packages }
    }

    /// Walk the graph through the manifests already on disk
    fn graph_from_disk(&self, session: &Session, state: &WorkspaceState) -> Result<ResolvedGraph, WorkspaceError> {
        let roots = session.root_identities();
        let mut packages = Vec::new();
        let mut visited: HashMap<PackageIdentity, ProductFilter> = HashMap::new();
        let mut queue: VecDeque<PackageConstraint> = session.constraints.iter().cloned().collect();

        while let Some(constraint) = queue.pop_front() {
            let identity = constraint.package.identity.clone();
            if roots.contains(&identity) && !constraint.package.is_root() {
                continue;
            }
            let products = match visited.get(&identity) {
                Some(seen) if seen.covers(&constraint.products) => continue,
                Some(seen) => seen.merge(&constraint.products),
                None => constraint.products.clone(),
            };
            let first_visit = visited.insert(identity.clone(), products.clone()).is_none();

            let (package, path, kind) = if constraint.package.is_root() {
                (
                    constraint.package.clone(),
                    PathBuf::from(&constraint.package.location),
                    PackageKind::Root,
                )
            } else {
                let Some(dependency) = state.dependency(&identity) else {
                    continue;
                };
                let kind = match dependency.state {
                    DependencyState::Checkout(_) => PackageKind::Remote,
                    DependencyState::Edited { .. } | DependencyState::Local => PackageKind::Local,
                };
                (dependency.package.clone(), self.path_of(dependency), kind)
            };

            let manifest = self.manifests.load(&path, kind)?;
            queue.extend(manifest.dependency_constraints(&products));
            if first_visit {
                packages.push(ResolvedPackage { package, manifest, path });
            }
        }
        Ok(ResolvedGraph { packages })
    }

    /// Identity and naming rules that need every manifest of the graph
    fn validate(&self, graph: &ResolvedGraph) -> Result<(), WorkspaceError> {
        let roots: Vec<&ResolvedPackage> = graph.packages.iter().filter(|p| p.package.is_root()).collect();
        let by_identity: HashMap<&PackageIdentity, &ResolvedPackage> = graph
            .packages
            .iter()
            .map(|p| (&p.package.identity, p))
            .collect();

        let mut registry = IdentityRegistry::new(roots.iter().map(|r| r.package.identity.clone()));
        for package in &graph.packages {
            for dependency in &package.manifest.dependencies {
                let identity = registry.register(
                    &package.package.identity,
                    &dependency.location,
                    dependency.name.as_deref(),
                )?;
                let (Some(name), Some(target)) = (&dependency.name, by_identity.get(&identity)) else {
                    continue;
                };
                if !target.package.is_root() && !target.manifest.name.eq_ignore_ascii_case(name) {
                    return Err(IdentityConflictError::ExplicitNameMismatch {
                        scope: package.package.identity.to_string(),
                        location: dependency.location.clone(),
                        name: name.clone(),
                        manifest_name: target.manifest.name.clone(),
                    }
                    .into());
                }
            }
        }

        for package in graph.packages.iter().filter(|p| !p.package.is_root()) {
            if let Some(root) = roots
                .iter()
                .find(|r| r.manifest.name.eq_ignore_ascii_case(&package.manifest.name))
            {
                return Err(IdentityConflictError::OverrideIdentityMismatch {
                    name: package.manifest.name.clone(),
                    identity: package.package.identity.clone(),
                    override_identity: root.package.identity.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn update_artifacts(&self, graph: &ResolvedGraph, state: &mut WorkspaceState, diagnostics: &mut Diagnostics) {
        let targets: Vec<BinaryTarget> = graph
            .packages
            .iter()
            .flat_map(|resolved| {
                resolved.manifest.targets.iter().filter_map(move |target| {
                    target.binary_source().map(|source| BinaryTarget {
                        package: resolved.package.clone(),
                        target_name: target.name.clone(),
                        source,
                        package_path: resolved.path.clone(),
                    })
                })
            })
            .collect();
        for error in self.artifacts.update(state, targets) {
            diagnostics.push(error);
        }
    }

    fn report(plan: &Plan, state: &WorkspaceState) -> UpdateReport {
        let mut report = UpdateReport::default();
        for (package, target) in &plan.desired {
            match state.dependency(&package.identity) {
                None => report.added.push((package.clone(), target.clone())),
                Some(current) if &current.state != target => {
                    report
                        .updated
                        .push((package.clone(), current.state.clone(), target.clone()))
                }
                Some(_) => {}
            }
        }
        let wanted: HashSet<&PackageIdentity> = plan.desired.iter().map(|(p, _)| &p.identity).collect();
        report.removed = state
            .dependencies()
            .filter(|d| !wanted.contains(&d.package.identity) && !d.is_edited())
            .map(|d| d.package.clone())
            .collect();
        report
    }

    /// Persist and publish the ledger, and the pins when given and changed
    fn store(&self, state: &WorkspaceState, pins: Option<PinsStore>) -> Result<(), WorkspaceError> {
        state.save()?;
        *self.state.write() = state.clone();
        if let Some(pins) = pins {
            if pins != *self.pins.read() || (!pins.is_empty() && !pins.file_exists()) {
                pins.save()?;
            }
            *self.pins.write() = pins;
        }
        Ok(())
    }
}

/// Bring the checkout of `dependency` at `path` to its recorded revision
fn checkout(
    repositories: &RepositoryManager,
    delegate: &dyn WorkspaceDelegate,
    dependency: ManagedDependency,
    path: &Path,
    skip_update: bool,
) -> Result<ManagedDependency, WorkspaceError> {
    let (Some(state), Some(repository)) = (dependency.checkout_state(), dependency.package.repository()) else {
        return Ok(dependency);
    };
    let handle = repositories.lookup(&repository, skip_update)?;
    let mut working_copy = if path.exists() {
        repositories.provider().open_working_copy(path)?
    } else {
        delegate.will_checkout(&repository, state.revision.as_str(), path);
        handle.create_working_copy(path, false)?
    };
    working_copy.checkout_revision(&state.revision)?;
    tracing::info!(package = %dependency.package.identity, state = %state, "Checked out dependency");
    Ok(dependency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_layout() {
        let location = WorkspaceLocation::new("/ws");
        assert_eq!(location.pins_file, PathBuf::from("/ws/depot.resolved"));
        assert_eq!(location.editables_dir, PathBuf::from("/ws/Packages"));
        assert_eq!(location.checkouts_dir(), PathBuf::from("/ws/.depot/checkouts"));
        assert_eq!(location.state_file(), PathBuf::from("/ws/.depot/workspace-state.json"));
    }

    #[test]
    fn test_update_report_is_empty() {
        let mut report = UpdateReport::default();
        assert!(report.is_empty());
        report
            .removed
            .push(PackageReference::remote("https://example.com/foo.git"));
        assert!(!report.is_empty());
    }
}
