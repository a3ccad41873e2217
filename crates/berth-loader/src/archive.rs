//! Archive lifetime management.
//!
//! Owns the set of ZIP-structured archives registered with one loader:
//! opens them lazily as a group (all-or-nothing), serves entry lookups
//! under a read lock, extracts non-code resources to a scratch directory
//! when anti-locking is on, and closes the whole set after an idle window
//! so long-idle applications do not pin file handles.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use crate::entry::Provenance;
use crate::error::{LoaderError, LoaderResult};
use crate::locks;
use crate::CODE_UNIT_SUFFIX;

/// Name of the optional key/value metadata entry inside an archive.
pub const MANIFEST_ENTRY: &str = "archive.toml";

/// Archives are closed after this much time without an access, unless
/// configured otherwise.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(90);

/// Optional archive metadata parsed from [`MANIFEST_ENTRY`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Archive format/version marker.
    pub version: Option<String>,
    /// Namespaces this archive declares sealed: once a sealed namespace
    /// is loaded from this archive, no other code base may serve it.
    #[serde(default)]
    pub sealed: Vec<String>,
}

impl ArchiveManifest {
    /// Whether this manifest seals `namespace`.
    #[must_use]
    pub fn seals(&self, namespace: &str) -> bool {
        self.sealed.iter().any(|s| s == namespace)
    }
}

struct ArchiveRecord {
    path: PathBuf,
    handle: Mutex<Option<ZipArchive<File>>>,
    manifest: Option<ArchiveManifest>,
}

struct Shared {
    records: RwLock<Vec<ArchiveRecord>>,
    open: AtomicBool,
    last_access: Mutex<Instant>,
    idle_window: Mutex<Duration>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

/// Owns the open/closed lifecycle of one loader's archive set.
///
/// Lookups take the read lock and proceed concurrently; opening, closing
/// and adding archives take the write lock. All records transition
/// open/closed together: a single failed open aborts the whole attempt
/// and leaves every record closed.
pub struct ArchiveManager {
    shared: Arc<Shared>,
    checker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ArchiveManager {
    /// Create a manager with the default idle window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                records: RwLock::new(Vec::new()),
                open: AtomicBool::new(false),
                last_access: Mutex::new(Instant::now()),
                idle_window: Mutex::new(DEFAULT_IDLE_WINDOW),
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
            }),
            checker: Mutex::new(None),
        }
    }

    /// Change the idle window after which unused archives are closed.
    pub fn set_idle_window(&self, window: Duration) {
        *locks::lock(&self.shared.idle_window) = window;
    }

    /// Register an archive file; the record starts closed.
    pub fn add_archive(&self, file: impl Into<PathBuf>) {
        let path = file.into();
        tracing::debug!(archive = %path.display(), "Registered archive");
        let mut records = locks::write(&self.shared.records);
        records.push(ArchiveRecord {
            path,
            handle: Mutex::new(None),
            manifest: None,
        });
        // The set transitions as a group: force a reopen so the new
        // record is not the only closed one.
        if self.shared.open.load(Ordering::Acquire) {
            Self::close_handles_locked(&records);
            self.shared.open.store(false, Ordering::Release);
        }
    }

    /// Open every registered archive, in registration order. No-op when
    /// the set is already open.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::ArchiveOpen`] if any archive fails to open;
    /// in that case nothing opened in this pass stays open.
    pub fn open_all(&self) -> LoaderResult<()> {
        {
            let mut records = locks::write(&self.shared.records);
            if self.shared.open.load(Ordering::Acquire) {
                return Ok(());
            }
            // Two-phase: open everything into a temporary list first so a
            // failure drops the whole pass and the shared state is never
            // partially open.
            let mut opened = Vec::with_capacity(records.len());
            for record in records.iter() {
                let file = File::open(&record.path).map_err(|e| LoaderError::ArchiveOpen {
                    path: record.path.clone(),
                    reason: e.to_string(),
                })?;
                let mut archive =
                    ZipArchive::new(file).map_err(|e| LoaderError::ArchiveOpen {
                        path: record.path.clone(),
                        reason: e.to_string(),
                    })?;
                let manifest = read_manifest(&mut archive, &record.path);
                opened.push((archive, manifest));
            }
            for (record, (archive, manifest)) in records.iter_mut().zip(opened) {
                *locks::lock(&record.handle) = Some(archive);
                record.manifest = manifest;
            }
            self.shared.open.store(true, Ordering::Release);
            *locks::lock(&self.shared.last_access) = Instant::now();
            tracing::debug!(archives = records.len(), "Opened archive set");
        }
        self.start_checker();
        Ok(())
    }

    /// Scan the open archives for `path`, in registration order.
    ///
    /// When the entry is found, is not a code unit, and `extract` is set,
    /// the bytes are also copied below `scratch` so later reads need not
    /// keep the archive open.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::ArchiveOpen`] if the set had to be
    /// (re)opened and the open failed.
    pub fn find_resource(
        &self,
        path: &str,
        scratch: Option<&Path>,
        extract: bool,
    ) -> LoaderResult<Option<Provenance>> {
        if locks::read(&self.shared.records).is_empty() {
            return Ok(None);
        }
        // The idle checker may close the set between ensure-open and the
        // read lock; retry until the scan runs under an open set, so a
        // lost race is never mistaken for an absent entry.
        loop {
            self.ensure_open()?;
            *locks::lock(&self.shared.last_access) = Instant::now();
            let records = locks::read(&self.shared.records);
            if !self.shared.open.load(Ordering::Acquire) {
                continue;
            }
            return Ok(Self::scan(&records, path, scratch, extract));
        }
    }

    /// Close every open handle and cancel the idle checker. Idempotent;
    /// safe to call even if the set was never opened.
    pub fn close_all(&self) {
        self.stop_checker();
        let records = locks::write(&self.shared.records);
        Self::close_handles_locked(&records);
        self.shared.open.store(false, Ordering::Release);
        tracing::debug!("Closed archive set");
    }

    /// Whether the set is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Paths of the registered archives, in registration order.
    #[must_use]
    pub fn archive_paths(&self) -> Vec<PathBuf> {
        locks::read(&self.shared.records)
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }

    /// Number of registered archives.
    #[must_use]
    pub fn len(&self) -> usize {
        locks::read(&self.shared.records).len()
    }

    /// Whether no archives are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> LoaderResult<()> {
        if self.shared.open.load(Ordering::Acquire) {
            return Ok(());
        }
        self.open_all()
    }

    fn scan(
        records: &[ArchiveRecord],
        path: &str,
        scratch: Option<&Path>,
        extract: bool,
    ) -> Option<Provenance> {
        for record in records {
            let mut guard = locks::lock(&record.handle);
            let Some(archive) = guard.as_mut() else {
                continue;
            };
            let Some(index) = archive.index_for_name(path) else {
                continue;
            };
            let bytes = match read_entry(archive, index) {
                Ok(bytes) => bytes,
                Err(reason) => {
                    // A corrupt entry inside an otherwise valid archive is
                    // skipped; the scan continues with the next archive.
                    tracing::warn!(
                        archive = %record.path.display(),
                        entry = path,
                        %reason,
                        "Skipping corrupt archive entry"
                    );
                    continue;
                },
            };
            drop(guard);

            let last_modified = fs::metadata(&record.path)
                .ok()
                .and_then(|m| m.modified().ok());
            let mut extracted = None;
            let origin = match scratch {
                Some(dir) if extract && !path.ends_with(CODE_UNIT_SUFFIX) => {
                    match extract_to(dir, path, &bytes) {
                        Ok(target) => {
                            extracted = Some(target.clone());
                            berth_core::ResourceOrigin::Extracted {
                                archive: record.path.clone(),
                                file: target,
                            }
                        },
                        Err(e) => {
                            tracing::warn!(
                                archive = %record.path.display(),
                                entry = path,
                                error = %e,
                                "Extraction failed; serving entry from the archive"
                            );
                            berth_core::ResourceOrigin::ArchiveEntry {
                                archive: record.path.clone(),
                                entry: path.to_string(),
                            }
                        },
                    }
                },
                _ => berth_core::ResourceOrigin::ArchiveEntry {
                    archive: record.path.clone(),
                    entry: path.to_string(),
                },
            };
            return Some(Provenance {
                bytes,
                origin,
                code_base: record.path.clone(),
                last_modified,
                manifest: record.manifest.clone(),
                extracted,
            });
        }
        None
    }

    fn close_handles_locked(records: &[ArchiveRecord]) {
        for record in records {
            *locks::lock(&record.handle) = None;
        }
    }

    fn start_checker(&self) {
        let mut slot = locks::lock(&self.checker);
        if slot.is_some() {
            return;
        }
        *locks::lock(&self.shared.shutdown) = false;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("berth-archive-idle".into())
            .spawn(move || idle_loop(&shared));
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Could not start the archive idle checker");
            },
        }
    }

    fn stop_checker(&self) {
        let handle = locks::lock(&self.checker).take();
        if let Some(handle) = handle {
            *locks::lock(&self.shared.shutdown) = true;
            self.shared.wake.notify_all();
            let _ = handle.join();
        }
    }
}

impl Default for ArchiveManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ArchiveManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for ArchiveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveManager")
            .field("archives", &self.len())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Background idle loop: closes the archive set after a full idle window
/// with no access. The set transparently reopens on the next lookup, so
/// only the open handles are released, never the records.
fn idle_loop(shared: &Arc<Shared>) {
    // Predicate loop: the flag is checked before the first wait, so a
    // shutdown signalled before this thread parks is observed immediately
    // instead of after a full idle window.
    let mut stop = locks::lock(&shared.shutdown);
    while !*stop {
        let window = *locks::lock(&shared.idle_window);
        let timeout = window.max(Duration::from_millis(10));
        let (guard, _) = shared
            .wake
            .wait_timeout(stop, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        stop = guard;
        if *stop {
            break;
        }
        if shared.open.load(Ordering::Acquire)
            && locks::lock(&shared.last_access).elapsed() >= window
        {
            let records = locks::write(&shared.records);
            ArchiveManager::close_handles_locked(&records);
            shared.open.store(false, Ordering::Release);
            drop(records);
            tracing::debug!("Closed idle archives");
        }
    }
}

fn read_entry(archive: &mut ZipArchive<File>, index: usize) -> Result<Vec<u8>, String> {
    let mut entry = archive.by_index(index).map_err(|e| e.to_string())?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).map_err(|e| e.to_string())?;
    Ok(bytes)
}

fn read_manifest(archive: &mut ZipArchive<File>, path: &Path) -> Option<ArchiveManifest> {
    let index = archive.index_for_name(MANIFEST_ENTRY)?;
    let text = match archive.by_index(index) {
        Ok(mut entry) => {
            let mut text = String::new();
            if let Err(e) = entry.read_to_string(&mut text) {
                tracing::warn!(
                    archive = %path.display(),
                    error = %e,
                    "Could not read the archive manifest"
                );
                return None;
            }
            text
        },
        Err(e) => {
            tracing::warn!(
                archive = %path.display(),
                error = %e,
                "Could not open the archive manifest entry"
            );
            return None;
        },
    };
    match toml::from_str(&text) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(
                archive = %path.display(),
                error = %e,
                "Ignoring malformed archive manifest"
            );
            None
        },
    }
}

fn extract_to(scratch: &Path, entry_path: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    // Entry names come from the archive and are untrusted: only plain
    // path segments are accepted, so `../` and absolute entries cannot
    // place files outside the scratch directory.
    let mut target = scratch.to_path_buf();
    for component in Path::new(entry_path).components() {
        let Component::Normal(part) = component else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("entry path '{entry_path}' escapes the scratch directory"),
            ));
        };
        target.push(part);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, bytes)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, bytes) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    fn provenance_bytes(p: &Provenance) -> &[u8] {
        &p.bytes
    }

    #[test]
    fn finds_entry_in_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.zip");
        let second = dir.path().join("b.zip");
        write_archive(&first, &[("pkg/data.txt", b"from-a")]);
        write_archive(&second, &[("pkg/data.txt", b"from-b")]);

        let manager = ArchiveManager::new();
        manager.add_archive(&first);
        manager.add_archive(&second);

        let found = manager
            .find_resource("pkg/data.txt", None, false)
            .unwrap()
            .unwrap();
        assert_eq!(provenance_bytes(&found), b"from-a");
        assert_eq!(found.code_base, first);
        assert!(manager.is_open());
    }

    #[test]
    fn open_all_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let good_a = dir.path().join("a.zip");
        let corrupt = dir.path().join("b.zip");
        let good_c = dir.path().join("c.zip");
        write_archive(&good_a, &[("x.txt", b"a")]);
        fs::write(&corrupt, b"this is not a zip archive").unwrap();
        write_archive(&good_c, &[("y.txt", b"c")]);

        let manager = ArchiveManager::new();
        manager.add_archive(&good_a);
        manager.add_archive(&corrupt);
        manager.add_archive(&good_c);

        let err = manager.open_all().unwrap_err();
        assert!(matches!(err, LoaderError::ArchiveOpen { ref path, .. } if *path == corrupt));
        assert!(!manager.is_open());
        // Lookups keep failing with the same open error; nothing is
        // independently queryable.
        assert!(manager.find_resource("x.txt", None, false).is_err());
    }

    #[test]
    fn idle_eviction_then_transparent_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(&archive, &[("pkg/data.txt", b"payload")]);

        let manager = ArchiveManager::new();
        manager.set_idle_window(Duration::from_millis(50));
        manager.add_archive(&archive);

        let first = manager
            .find_resource("pkg/data.txt", None, false)
            .unwrap()
            .unwrap();
        assert!(manager.is_open());

        // Wait out the idle window plus the checker's next pass.
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!manager.is_open(), "idle checker never closed the set");

        let second = manager
            .find_resource("pkg/data.txt", None, false)
            .unwrap()
            .unwrap();
        assert_eq!(provenance_bytes(&first), provenance_bytes(&second));
        assert!(manager.is_open());
    }

    #[test]
    fn close_all_is_idempotent_and_safe_before_open() {
        let manager = ArchiveManager::new();
        manager.close_all();
        manager.close_all();
        assert!(!manager.is_open());
    }

    #[test]
    fn extraction_copies_non_code_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(
            &archive,
            &[("pkg/config.txt", b"key=value"), ("pkg/Mod.wasm", b"\0asm")],
        );
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let manager = ArchiveManager::new();
        manager.add_archive(&archive);

        let resource = manager
            .find_resource("pkg/config.txt", Some(&scratch), true)
            .unwrap()
            .unwrap();
        let extracted = resource.extracted.clone().unwrap();
        assert_eq!(fs::read(&extracted).unwrap(), b"key=value");
        assert!(matches!(
            resource.origin,
            berth_core::ResourceOrigin::Extracted { .. }
        ));

        // Code units are never extracted.
        let unit = manager
            .find_resource("pkg/Mod.wasm", Some(&scratch), true)
            .unwrap()
            .unwrap();
        assert!(unit.extracted.is_none());
        assert!(matches!(
            unit.origin,
            berth_core::ResourceOrigin::ArchiveEntry { .. }
        ));
    }

    #[test]
    fn traversal_entry_is_served_but_never_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(&archive, &[("../evil.txt", b"payload")]);
        let work = dir.path().join("work");
        let scratch = work.join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let manager = ArchiveManager::new();
        manager.add_archive(&archive);

        let resource = manager
            .find_resource("../evil.txt", Some(&scratch), true)
            .unwrap()
            .unwrap();
        // The bytes are still served, from the archive.
        assert_eq!(provenance_bytes(&resource), b"payload");
        assert!(resource.extracted.is_none());
        assert!(matches!(
            resource.origin,
            berth_core::ResourceOrigin::ArchiveEntry { .. }
        ));
        // Nothing was written outside the scratch directory.
        assert!(!work.join("evil.txt").exists());
        assert!(!scratch.join("evil.txt").exists());
    }

    #[test]
    fn lookup_never_misses_while_idle_checker_races() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(&archive, &[("pkg/data.txt", b"payload")]);

        // An aggressive window makes the checker close the set between
        // lookups constantly; an existing entry must still never be
        // reported absent.
        let manager = ArchiveManager::new();
        manager.set_idle_window(Duration::from_millis(1));
        manager.add_archive(&archive);

        for _ in 0..200 {
            let found = manager.find_resource("pkg/data.txt", None, false).unwrap();
            assert!(found.is_some(), "entry vanished during an idle close");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn close_all_cancels_checker_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(&archive, &[("x.txt", b"x")]);

        // Default (long) idle window; the checker must still stop as soon
        // as it is told to, not at its next wakeup.
        let manager = ArchiveManager::new();
        manager.add_archive(&archive);
        manager.find_resource("x.txt", None, false).unwrap().unwrap();
        assert!(manager.is_open());

        let started = Instant::now();
        manager.close_all();
        assert!(!manager.is_open());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn manifest_is_parsed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(
            &archive,
            &[
                (
                    MANIFEST_ENTRY,
                    b"version = \"1\"\nsealed = [\"pkg.sealed\"]\n",
                ),
                ("pkg/sealed/Mod.wasm", b"\0asm"),
            ],
        );

        let manager = ArchiveManager::new();
        manager.add_archive(&archive);
        let found = manager
            .find_resource("pkg/sealed/Mod.wasm", None, false)
            .unwrap()
            .unwrap();
        let manifest = found.manifest.unwrap();
        assert_eq!(manifest.version.as_deref(), Some("1"));
        assert!(manifest.seals("pkg.sealed"));
        assert!(!manifest.seals("pkg.open"));
    }
}
