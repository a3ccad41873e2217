//! The code loader orchestrator.
//!
//! One [`CodeLoader`] serves one hosted application: it owns the
//! application's repositories and archives, a name-keyed cache of
//! materialized code units, the delegation relationship with its parent
//! loader, and the retirement machinery that runs when the application is
//! undeployed.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use berth_core::{
    context, CodeUnit, DriverRegistry, LoaderId, LoaderLineage, Materializer, ResourceOrigin,
    ThreadSlotRegistry,
};
use dashmap::{DashMap, DashSet};

use crate::archive::ArchiveManager;
use crate::cleaner::{CleanupReport, ReferenceCleaner};
use crate::entry::{Provenance, ResourceEntry};
use crate::error::{LoaderError, LoaderResult};
use crate::locks;
use crate::materialize::WasmMaterializer;
use crate::policy::{self, DelegationPolicy, ResolutionOrder, SealPolicy};
use crate::repository::RepositoryManager;
use crate::transform::CodeTransformer;
use crate::CODE_UNIT_SUFFIX;

/// The loader's lifecycle state.
///
/// Configuration happens in `New`, loading in `Running`, and `Closed` is
/// terminal: a closed loader answers nothing and is never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created but not started; accepts configuration only.
    New,
    /// Started; serves load and resource requests.
    Running,
    /// Retired; every operation fails, the state never changes again.
    Closed,
}

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSED: u8 = 2;

fn decode_state(raw: u8) -> Lifecycle {
    match raw {
        STATE_NEW => Lifecycle::New,
        STATE_RUNNING => Lifecycle::Running,
        _ => Lifecycle::Closed,
    }
}

/// Recorded last-modified time of one backing file, used by
/// [`CodeLoader::modified`] to detect redeploys.
#[derive(Debug, Clone)]
pub struct PathTimestamp {
    /// The backing file.
    pub path: PathBuf,
    /// Its modification time when first seen.
    pub last_modified: SystemTime,
}

/// The parent side of the delegation protocol.
///
/// [`CodeLoader`] implements this itself, so loaders chain naturally; a
/// hosting layer may also supply a custom root that serves host-runtime
/// namespaces.
pub trait DelegateLoader: Send + Sync {
    /// Load a code unit by fully-qualified dotted name.
    ///
    /// # Errors
    ///
    /// [`LoaderError::NotFound`] when this loader (and its own ancestry)
    /// cannot serve the name; other variants are fatal and propagate.
    fn load_code_unit(&self, name: &str) -> LoaderResult<Arc<CodeUnit>>;

    /// Raw bytes of a non-code resource by slash-separated path.
    fn resource_bytes(&self, path: &str) -> Option<Vec<u8>>;

    /// The delegate's ancestry chain.
    fn lineage(&self) -> LoaderLineage;
}

struct WatchedDir {
    dir: PathBuf,
    names: Vec<String>,
}

/// Per-application code loader.
pub struct CodeLoader {
    id: LoaderId,
    lineage: LoaderLineage,
    state: AtomicU8,
    parent: Option<Arc<dyn DelegateLoader>>,
    policy: RwLock<DelegationPolicy>,
    seal: RwLock<SealPolicy>,
    repositories: RepositoryManager,
    archives: ArchiveManager,
    entries: DashMap<String, Arc<ResourceEntry>>,
    // Memoized local misses. Guards the local search only; delegation to
    // the parent is never short-circuited by it.
    not_found: DashSet<String>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    transformers: RwLock<Vec<Arc<dyn CodeTransformer>>>,
    materializer: Arc<dyn Materializer>,
    drivers: Arc<DriverRegistry>,
    thread_slots: Arc<ThreadSlotRegistry>,
    anti_locking: AtomicBool,
    clear_statics: AtomicBool,
    work_dir: RwLock<Option<PathBuf>>,
    scratch: RwLock<Option<PathBuf>>,
    path_timestamps: Mutex<Vec<PathTimestamp>>,
    watched: Mutex<Option<WatchedDir>>,
}

impl CodeLoader {
    /// A root loader with the default WASM materializer and an enforcing
    /// seal policy.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None, Arc::new(WasmMaterializer))
    }

    /// A loader delegating to `parent`; its lineage extends the parent's.
    #[must_use]
    pub fn with_parent(parent: Arc<dyn DelegateLoader>) -> Self {
        let materializer: Arc<dyn Materializer> = Arc::new(WasmMaterializer);
        Self::build(Some(parent), materializer)
    }

    /// A loader with a custom materializer.
    #[must_use]
    pub fn with_materializer(
        parent: Option<Arc<dyn DelegateLoader>>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        Self::build(parent, materializer)
    }

    fn build(parent: Option<Arc<dyn DelegateLoader>>, materializer: Arc<dyn Materializer>) -> Self {
        let id = LoaderId::next();
        let lineage = match &parent {
            Some(p) => LoaderLineage::child(id, &p.lineage()),
            None => LoaderLineage::root(id),
        };
        tracing::debug!(loader = %id, %lineage, "Created loader");
        Self {
            id,
            lineage,
            state: AtomicU8::new(STATE_NEW),
            parent,
            policy: RwLock::new(DelegationPolicy::default()),
            seal: RwLock::new(SealPolicy::enforcing()),
            repositories: RepositoryManager::new(),
            archives: ArchiveManager::new(),
            entries: DashMap::new(),
            not_found: DashSet::new(),
            name_locks: DashMap::new(),
            transformers: RwLock::new(Vec::new()),
            materializer,
            drivers: Arc::new(DriverRegistry::new()),
            thread_slots: Arc::new(ThreadSlotRegistry::new()),
            anti_locking: AtomicBool::new(false),
            clear_statics: AtomicBool::new(true),
            work_dir: RwLock::new(None),
            scratch: RwLock::new(None),
            path_timestamps: Mutex::new(Vec::new()),
            watched: Mutex::new(None),
        }
    }

    /// Share process-wide registries with other loaders. Intended for the
    /// hosting layer, before the loader is handed out.
    pub fn share_registries(
        &mut self,
        drivers: Arc<DriverRegistry>,
        thread_slots: Arc<ThreadSlotRegistry>,
    ) {
        self.drivers = drivers;
        self.thread_slots = thread_slots;
    }

    /// This loader's id.
    #[must_use]
    pub fn id(&self) -> LoaderId {
        self.id
    }

    /// This loader's ancestry chain.
    #[must_use]
    pub fn lineage(&self) -> &LoaderLineage {
        &self.lineage
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> Lifecycle {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// The driver registry hosted code registers into.
    #[must_use]
    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// The thread-slot registry hosted code registers into.
    #[must_use]
    pub fn thread_slots(&self) -> &Arc<ThreadSlotRegistry> {
        &self.thread_slots
    }

    // ---- configuration (New state only, unless noted) ----

    /// Append a repository root searched for loose resources.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`.
    pub fn add_repository(
        &self,
        prefix: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> LoaderResult<()> {
        self.require_state(Lifecycle::New, "add_repository")?;
        self.repositories.add_repository(prefix, dir);
        Ok(())
    }

    /// Register an archive file; its current timestamp is recorded for
    /// [`CodeLoader::modified`].
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`.
    pub fn add_archive(&self, file: impl Into<PathBuf>) -> LoaderResult<()> {
        self.require_state(Lifecycle::New, "add_archive")?;
        let file = file.into();
        if let Ok(last_modified) = fs::metadata(&file).and_then(|m| m.modified()) {
            locks::lock(&self.path_timestamps).push(PathTimestamp {
                path: file.clone(),
                last_modified,
            });
        }
        self.archives.add_archive(file);
        Ok(())
    }

    /// Watch `dir` for archives appearing or disappearing; the listing is
    /// snapshotted at [`CodeLoader::start`] and compared by
    /// [`CodeLoader::modified`].
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`.
    pub fn watch_archive_dir(&self, dir: impl Into<PathBuf>) -> LoaderResult<()> {
        self.require_state(Lifecycle::New, "watch_archive_dir")?;
        *locks::lock(&self.watched) = Some(WatchedDir {
            dir: dir.into(),
            names: Vec::new(),
        });
        Ok(())
    }

    /// Set the directory under which this loader creates its private
    /// scratch directory for anti-locking extraction.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`.
    pub fn set_work_dir(&self, dir: impl Into<PathBuf>) -> LoaderResult<()> {
        self.require_state(Lifecycle::New, "set_work_dir")?;
        *locks::write(&self.work_dir) = Some(dir.into());
        Ok(())
    }

    /// Replace the delegation policy.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] when the loader is closed.
    pub fn set_policy(&self, policy: DelegationPolicy) -> LoaderResult<()> {
        self.require_open("set_policy")?;
        *locks::write(&self.policy) = policy;
        Ok(())
    }

    /// Switch between parent-first and local-first delegation for
    /// ordinary (non-reserved) names.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] when the loader is closed.
    pub fn set_parent_first(&self, parent_first: bool) -> LoaderResult<()> {
        self.require_open("set_parent_first")?;
        locks::write(&self.policy).parent_first = parent_first;
        Ok(())
    }

    /// Replace the prefixes exempt from the reserved-namespace rule.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] when the loader is closed.
    pub fn set_overridable(&self, prefixes: Vec<String>) -> LoaderResult<()> {
        self.require_open("set_overridable")?;
        locks::write(&self.policy).overridable = prefixes;
        Ok(())
    }

    /// Replace the seal policy.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`.
    pub fn set_seal_policy(&self, seal: SealPolicy) -> LoaderResult<()> {
        self.require_state(Lifecycle::New, "set_seal_policy")?;
        *locks::write(&self.seal) = seal;
        Ok(())
    }

    /// Register a transformer hook; hooks run in registration order.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] when the loader is closed.
    pub fn add_transformer(&self, transformer: Arc<dyn CodeTransformer>) -> LoaderResult<()> {
        self.require_open("add_transformer")?;
        locks::write(&self.transformers).push(transformer);
        Ok(())
    }

    /// Enable or disable anti-locking extraction of archive resources.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`.
    pub fn set_anti_locking(&self, enabled: bool) -> LoaderResult<()> {
        self.require_state(Lifecycle::New, "set_anti_locking")?;
        self.anti_locking.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Enable or disable the static-cell phase of retirement cleanup.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`.
    pub fn set_clear_statics(&self, enabled: bool) -> LoaderResult<()> {
        self.require_state(Lifecycle::New, "set_clear_statics")?;
        self.clear_statics.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Idle window after which unused archive handles are closed.
    pub fn set_archive_idle_window(&self, window: std::time::Duration) {
        self.archives.set_idle_window(window);
    }

    // ---- lifecycle ----

    /// Transition `New` -> `Running`: create the scratch directory and
    /// snapshot the watched archive directory.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `New`;
    /// [`LoaderError::Io`] if the scratch directory cannot be created.
    pub fn start(&self) -> LoaderResult<()> {
        if self
            .state
            .compare_exchange(
                STATE_NEW,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(LoaderError::IllegalState {
                operation: "start",
                state: self.state(),
            });
        }
        let scratch = locks::read(&self.work_dir)
            .as_ref()
            .map(|dir| dir.join(self.id.to_string()));
        if let Some(dir) = &scratch {
            fs::create_dir_all(dir)?;
        }
        *locks::write(&self.scratch) = scratch;
        if let Some(watch) = locks::lock(&self.watched).as_mut() {
            watch.names = list_archive_names(&watch.dir);
        }
        tracing::info!(
            loader = %self.id,
            repositories = self.repositories.len(),
            archives = self.archives.len(),
            "Loader started"
        );
        Ok(())
    }

    /// Retire the loader: run the reference-cleanup pass, drop every
    /// cache, close the archives and remove the scratch directory.
    ///
    /// Idempotent; a second call returns an empty report. The state is
    /// terminal, so anything still holding the loader gets
    /// [`LoaderError::IllegalState`] from then on.
    pub fn close(&self) -> CleanupReport {
        let previous = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if previous == STATE_CLOSED {
            return CleanupReport::default();
        }
        // Cleanup hooks resolve against the retiring loader.
        let _ctx = context::enter(self.id);
        let units: Vec<Arc<CodeUnit>> = self
            .entries
            .iter()
            .filter_map(|entry| entry.value().unit())
            .collect();
        let report = ReferenceCleaner::new(self.id, &self.drivers, &self.thread_slots)
            .clear_references(&units, self.clear_statics.load(Ordering::Relaxed));

        self.archives.close_all();
        self.repositories.close();
        self.entries.clear();
        self.not_found.clear();
        self.name_locks.clear();
        locks::write(&self.transformers).clear();
        locks::lock(&self.path_timestamps).clear();
        if let Some(dir) = locks::write(&self.scratch).take() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        loader = %self.id,
                        dir = %dir.display(),
                        error = %e,
                        "Could not remove the scratch directory"
                    );
                }
            }
        }
        tracing::info!(
            loader = %self.id,
            units = units.len(),
            drivers_removed = report.drivers_removed.len(),
            leaked_slots = report.leaked_slots.len(),
            statics_cleared = report.statics_cleared,
            "Loader closed"
        );
        report
    }

    /// Release the open archive handles so the backing files can be
    /// replaced on disk. The hosting layer calls this before a redeploy;
    /// the replacement application gets a fresh loader.
    ///
    /// # Errors
    ///
    /// [`LoaderError::IllegalState`] unless the loader is `Running`.
    pub fn reload(&self) -> LoaderResult<()> {
        self.require_state(Lifecycle::Running, "reload")?;
        tracing::info!(loader = %self.id, "Releasing archive handles for redeploy");
        self.archives.close_all();
        Ok(())
    }

    /// Whether any backing file changed since it was first seen, or the
    /// watched archive directory's listing changed. Used by the hosting
    /// layer to decide whether a redeploy is needed. Always false unless
    /// the loader is `Running`.
    #[must_use]
    pub fn modified(&self) -> bool {
        if self.state() != Lifecycle::Running {
            return false;
        }
        for stamp in locks::lock(&self.path_timestamps).iter() {
            let current = fs::metadata(&stamp.path).and_then(|m| m.modified());
            match current {
                Ok(current) if current == stamp.last_modified => {},
                _ => {
                    tracing::info!(
                        loader = %self.id,
                        path = %stamp.path.display(),
                        "Backing file changed or disappeared"
                    );
                    return true;
                },
            }
        }
        if let Some(watch) = locks::lock(&self.watched).as_ref() {
            let current = list_archive_names(&watch.dir);
            if current != watch.names {
                tracing::info!(
                    loader = %self.id,
                    dir = %watch.dir.display(),
                    "Archive directory listing changed"
                );
                return true;
            }
        }
        false
    }

    /// The ordered code sources: repository roots first, then archives.
    /// Empty once the loader is closed.
    #[must_use]
    pub fn search_paths(&self) -> Vec<PathBuf> {
        if self.state() == Lifecycle::Closed {
            return Vec::new();
        }
        let mut paths = self.repositories.directories();
        paths.extend(self.archives.archive_paths());
        paths
    }

    // ---- loading ----

    /// Load a code unit by fully-qualified dotted name, following the
    /// delegation protocol.
    ///
    /// `resolve` is a hint that the caller wants the unit fully resolved;
    /// units resolve during materialization here, so the hint only
    /// affects tracing.
    ///
    /// # Errors
    ///
    /// [`LoaderError::NotFound`] when neither the delegation parent nor
    /// the local sources serve the name (local misses are memoized);
    /// [`LoaderError::Malformed`] / [`LoaderError::TransformFailed`] /
    /// [`LoaderError::SealViolation`] for bad bytes;
    /// [`LoaderError::IllegalState`] unless the loader is `Running`.
    pub fn load(&self, name: &str, resolve: bool) -> LoaderResult<Arc<CodeUnit>> {
        self.require_state(Lifecycle::Running, "load")?;
        if let Some(entry) = self.entries.get(name) {
            if let Some(unit) = entry.unit() {
                return Ok(unit);
            }
        }

        let name_lock = self.name_lock(name);
        let _guard = locks::lock(&name_lock);
        // Another thread may have finished this name while we waited.
        if let Some(entry) = self.entries.get(name) {
            if let Some(unit) = entry.unit() {
                return Ok(unit);
            }
            if let Some(reason) = entry.failure() {
                return Err(LoaderError::Malformed {
                    name: name.to_string(),
                    reason: reason.to_string(),
                });
            }
        }

        let policy = locks::read(&self.policy).clone();
        let unit = match policy::resolution_order(name, &policy) {
            ResolutionOrder::ParentFirst => {
                if let Some(unit) = self.try_parent(name)? {
                    tracing::trace!(loader = %self.id, name, "Delegated to parent");
                    return Ok(unit);
                }
                if policy::is_reserved(name, &policy) {
                    // Reserved namespaces never resolve locally.
                    self.not_found.insert(name.to_string());
                    return Err(LoaderError::NotFound(name.to_string()));
                }
                self.find_locked(name)
            },
            ResolutionOrder::LocalFirst => match self.find_locked(name) {
                Err(LoaderError::NotFound(_)) => match self.try_parent(name)? {
                    Some(unit) => {
                        tracing::trace!(loader = %self.id, name, "Delegated to parent");
                        return Ok(unit);
                    },
                    None => Err(LoaderError::NotFound(name.to_string())),
                },
                other => other,
            },
        };
        if resolve && unit.is_ok() {
            tracing::trace!(loader = %self.id, name, "Resolved at materialization");
        }
        unit
    }

    /// Load a code unit from this loader's own sources only, without
    /// delegating.
    ///
    /// # Errors
    ///
    /// As for [`CodeLoader::load`], except the parent is never consulted.
    /// Local misses are memoized; the memo never affects later delegation
    /// through [`CodeLoader::load`].
    pub fn find_code_unit(&self, name: &str) -> LoaderResult<Arc<CodeUnit>> {
        self.require_state(Lifecycle::Running, "find_code_unit")?;
        if policy::is_reserved(name, &locks::read(&self.policy)) {
            return Err(LoaderError::NotFound(name.to_string()));
        }
        let name_lock = self.name_lock(name);
        let _guard = locks::lock(&name_lock);
        self.find_locked(name)
    }

    /// Raw bytes of a non-code resource by slash-separated path,
    /// following the delegation protocol. `None` when the resource is
    /// absent everywhere or the loader is not running.
    #[must_use]
    pub fn resource_bytes(&self, path: &str) -> Option<Vec<u8>> {
        if self.state() != Lifecycle::Running {
            return None;
        }
        if let Some(entry) = self.entries.get(path) {
            if let Some(bytes) = entry.bytes() {
                return Some(bytes);
            }
        }
        let policy = locks::read(&self.policy).clone();
        let dotted = dotted_name(path);
        match policy::resolution_order(&dotted, &policy) {
            ResolutionOrder::ParentFirst => {
                let from_parent = self
                    .parent
                    .as_ref()
                    .and_then(|parent| parent.resource_bytes(path));
                match from_parent {
                    Some(bytes) => Some(bytes),
                    None if policy::is_reserved(&dotted, &policy) => None,
                    None => self.local_resource_bytes(path),
                }
            },
            ResolutionOrder::LocalFirst => self.local_resource_bytes(path).or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|parent| parent.resource_bytes(path))
            }),
        }
    }

    /// Locate a resource by slash-separated path without materializing
    /// it, returning where its bytes live. With anti-locking on, archive
    /// entries report their extracted on-disk copy.
    #[must_use]
    pub fn find_resource(&self, path: &str) -> Option<ResourceOrigin> {
        if self.state() != Lifecycle::Running {
            return None;
        }
        if let Some(entry) = self.entries.get(path) {
            if let Some(origin) = entry.origin() {
                return Some(origin);
            }
            if let Some(unit) = entry.unit() {
                return Some(unit.origin().clone());
            }
        }
        if self.not_found.contains(path) {
            return None;
        }
        match self.locate_local(path, false) {
            Ok(Some(provenance)) => {
                let origin = provenance.origin.clone();
                let entry = Arc::new(ResourceEntry::new(provenance));
                self.entries.entry(path.to_string()).or_insert(entry);
                Some(origin)
            },
            Ok(None) => {
                self.not_found.insert(path.to_string());
                None
            },
            Err(e) => {
                tracing::warn!(loader = %self.id, path, error = %e, "Resource lookup failed");
                None
            },
        }
    }

    /// A reader over a resource's bytes. Cached bytes stream from
    /// memory; extracted resources stream from the scratch file so the
    /// archive need not stay open.
    #[must_use]
    pub fn resource_reader(&self, path: &str) -> Option<Box<dyn Read + Send>> {
        let bytes = self.resource_bytes(path)?;
        if let Some(entry) = self.entries.get(path) {
            if let Some(extracted) = entry.extracted_path() {
                if let Ok(file) = fs::File::open(extracted) {
                    return Some(Box::new(file));
                }
            }
        }
        Some(Box::new(io::Cursor::new(bytes)))
    }

    // ---- internals ----

    fn try_parent(&self, name: &str) -> LoaderResult<Option<Arc<CodeUnit>>> {
        let Some(parent) = &self.parent else {
            return Ok(None);
        };
        match parent.load_code_unit(name) {
            Ok(unit) => Ok(Some(unit)),
            Err(LoaderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Local search and materialization. Caller holds the name lock.
    fn find_locked(&self, name: &str) -> LoaderResult<Arc<CodeUnit>> {
        if self.not_found.contains(name) {
            return Err(LoaderError::NotFound(name.to_string()));
        }
        let entry = match self.entries.get(name) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let path = unit_path(name);
                let Some(provenance) = self.locate_local(&path, true)? else {
                    self.not_found.insert(name.to_string());
                    return Err(LoaderError::NotFound(name.to_string()));
                };
                tracing::debug!(loader = %self.id, name, origin = %provenance.origin, "Located code unit");
                let fresh = Arc::new(ResourceEntry::new(provenance));
                Arc::clone(&self.entries.entry(name.to_string()).or_insert(fresh))
            },
        };
        self.materialize_entry(name, &entry)
    }

    /// Turn an entry's provenance into the materialized handle. Runs at
    /// most once per name; the outcome (handle or failure) is sticky.
    fn materialize_entry(
        &self,
        name: &str,
        entry: &Arc<ResourceEntry>,
    ) -> LoaderResult<Arc<CodeUnit>> {
        if let Some(unit) = entry.unit() {
            return Ok(unit);
        }
        if let Some(reason) = entry.failure() {
            return Err(LoaderError::Malformed {
                name: name.to_string(),
                reason: reason.to_string(),
            });
        }
        let Some(provenance) = entry.take_provenance() else {
            // Provenance gone without an outcome: treat as absent.
            return Err(LoaderError::NotFound(name.to_string()));
        };

        let sealed = provenance
            .manifest
            .as_ref()
            .is_some_and(|m| m.seals(policy::namespace_of(name)));
        if let Err(e) = locks::read(&self.seal).check(name, sealed, &provenance.code_base) {
            entry.record_failure(e.to_string());
            return Err(e);
        }

        let mut bytes = provenance.bytes;
        let transformers = locks::read(&self.transformers).clone();
        for transformer in transformers {
            match transformer.transform(name, &bytes) {
                Ok(Some(replaced)) => bytes = replaced,
                Ok(None) => {},
                Err(e) => {
                    entry.record_failure(format!("transformer: {e}"));
                    return Err(LoaderError::TransformFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                },
            }
        }

        match self
            .materializer
            .materialize(name, &bytes, &provenance.origin, self.id)
        {
            Ok(unit) => {
                entry.set_unit(Arc::clone(&unit));
                tracing::debug!(
                    loader = %self.id,
                    name,
                    size = unit.size(),
                    "Materialized code unit"
                );
                Ok(unit)
            },
            Err(e) => {
                entry.record_failure(e.reason.clone());
                Err(LoaderError::Malformed {
                    name: name.to_string(),
                    reason: e.reason,
                })
            },
        }
    }

    /// Search the local sources for `path`: repositories in registration
    /// order, then archives.
    fn locate_local(&self, path: &str, record_timestamp: bool) -> LoaderResult<Option<Provenance>> {
        let dirs = self.repositories.directories();
        for (candidate, dir) in self.repositories.get_resources(path).into_iter().zip(dirs) {
            let Ok(meta) = fs::metadata(&candidate.file) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let bytes = fs::read(&candidate.file)?;
            let last_modified = meta.modified().ok();
            if record_timestamp {
                if let Some(stamp) = last_modified {
                    locks::lock(&self.path_timestamps).push(PathTimestamp {
                        path: candidate.file.clone(),
                        last_modified: stamp,
                    });
                }
            }
            return Ok(Some(Provenance {
                bytes,
                origin: ResourceOrigin::File(candidate.file),
                code_base: dir,
                last_modified,
                manifest: None,
                extracted: None,
            }));
        }
        let scratch = locks::read(&self.scratch).clone();
        let extract = self.anti_locking.load(Ordering::Relaxed);
        self.archives.find_resource(path, scratch.as_deref(), extract)
    }

    fn local_resource_bytes(&self, path: &str) -> Option<Vec<u8>> {
        if self.not_found.contains(path) {
            return None;
        }
        match self.locate_local(path, false) {
            Ok(Some(provenance)) => {
                let bytes = provenance.bytes.clone();
                let entry = Arc::new(ResourceEntry::new(provenance));
                self.entries.entry(path.to_string()).or_insert(entry);
                Some(bytes)
            },
            Ok(None) => {
                self.not_found.insert(path.to_string());
                None
            },
            Err(e) => {
                tracing::warn!(loader = %self.id, path, error = %e, "Resource lookup failed");
                None
            },
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .name_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn require_state(&self, required: Lifecycle, operation: &'static str) -> LoaderResult<()> {
        let state = self.state();
        if state == required {
            Ok(())
        } else {
            Err(LoaderError::IllegalState { operation, state })
        }
    }

    fn require_open(&self, operation: &'static str) -> LoaderResult<()> {
        let state = self.state();
        if state == Lifecycle::Closed {
            Err(LoaderError::IllegalState { operation, state })
        } else {
            Ok(())
        }
    }
}

impl Default for CodeLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CodeLoader {
    fn drop(&mut self) {
        if self.state() != Lifecycle::Closed {
            self.close();
        }
    }
}

impl std::fmt::Display for CodeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CodeLoader[{}, state={:?}, repositories={}, archives={}, cached={}, misses={}]",
            self.id,
            self.state(),
            self.repositories.len(),
            self.archives.len(),
            self.entries.len(),
            self.not_found.len()
        )
    }
}

impl std::fmt::Debug for CodeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeLoader")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("repositories", &self.repositories.len())
            .field("archives", &self.archives.len())
            .field("cached", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl DelegateLoader for CodeLoader {
    fn load_code_unit(&self, name: &str) -> LoaderResult<Arc<CodeUnit>> {
        self.load(name, false)
    }

    fn resource_bytes(&self, path: &str) -> Option<Vec<u8>> {
        CodeLoader::resource_bytes(self, path)
    }

    fn lineage(&self) -> LoaderLineage {
        self.lineage.clone()
    }
}

/// `pkg.sub.Foo` -> `pkg/sub/Foo.wasm`.
fn unit_path(name: &str) -> String {
    format!("{}{CODE_UNIT_SUFFIX}", name.replace('.', "/"))
}

/// `pkg/config.txt` -> `pkg.config.txt`, for policy matching.
fn dotted_name(path: &str) -> String {
    path.trim_end_matches(CODE_UNIT_SUFFIX).replace('/', ".")
}

/// Sorted archive file names directly under `dir`.
fn list_archive_names(dir: &Path) -> Vec<String> {
    let Ok(listing) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = listing
        .filter_map(Result::ok)
        .filter(|e| {
            let path = e.path();
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("zip" | "jar")
            )
        })
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort_unstable();
    names
}
