//! Cached resource entries.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;
use std::time::SystemTime;

use berth_core::{CodeUnit, ResourceOrigin};

use crate::archive::ArchiveManifest;
use crate::locks;

/// Provenance captured when a resource is located: the raw bytes plus
/// where they came from. Discarded once the entry materializes (or fails
/// to) so cached entries do not pin large buffers.
#[derive(Debug)]
pub struct Provenance {
    /// The raw resource bytes.
    pub bytes: Vec<u8>,
    /// Exact origin of the bytes.
    pub origin: ResourceOrigin,
    /// The repository directory or archive file the bytes came from.
    pub code_base: PathBuf,
    /// Last-modified time of the backing file, when known.
    pub last_modified: Option<SystemTime>,
    /// Manifest of the originating archive, if any.
    pub manifest: Option<ArchiveManifest>,
    /// Anti-locking extraction target, when the bytes were copied out.
    pub extracted: Option<PathBuf>,
}

/// A value holder for one located resource, owned exclusively by the
/// loader's name-keyed cache.
///
/// The materialized handle is set at most once; all threads racing the
/// same name observe the single resulting handle.
pub struct ResourceEntry {
    provenance: Mutex<Option<Provenance>>,
    unit: OnceLock<Arc<CodeUnit>>,
    failure: OnceLock<String>,
}

impl ResourceEntry {
    /// Create an entry holding freshly located provenance.
    #[must_use]
    pub fn new(provenance: Provenance) -> Self {
        Self {
            provenance: Mutex::new(Some(provenance)),
            unit: OnceLock::new(),
            failure: OnceLock::new(),
        }
    }

    /// The materialized handle, if materialization has happened.
    #[must_use]
    pub fn unit(&self) -> Option<Arc<CodeUnit>> {
        self.unit.get().cloned()
    }

    /// Record the materialized handle. The first writer wins; later calls
    /// are ignored (per-name locking means there are none in practice).
    pub fn set_unit(&self, unit: Arc<CodeUnit>) {
        let _ = self.unit.set(unit);
    }

    /// The recorded materialization failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Record a materialization failure; the name is never retried.
    pub fn record_failure(&self, reason: impl Into<String>) {
        let _ = self.failure.set(reason.into());
    }

    /// Take the provenance out of the entry, leaving it discarded.
    #[must_use]
    pub fn take_provenance(&self) -> Option<Provenance> {
        locks::lock(&self.provenance).take()
    }

    /// The origin, while the provenance is still held.
    #[must_use]
    pub fn origin(&self) -> Option<ResourceOrigin> {
        locks::lock(&self.provenance)
            .as_ref()
            .map(|p| p.origin.clone())
    }

    /// A copy of the raw bytes, while the provenance is still held.
    #[must_use]
    pub fn bytes(&self) -> Option<Vec<u8>> {
        locks::lock(&self.provenance)
            .as_ref()
            .map(|p| p.bytes.clone())
    }

    /// The anti-locking extraction target, while provenance is held.
    #[must_use]
    pub fn extracted_path(&self) -> Option<PathBuf> {
        locks::lock(&self.provenance)
            .as_ref()
            .and_then(|p| p.extracted.clone())
    }
}

impl fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("materialized", &self.unit.get().is_some())
            .field("failed", &self.failure.get().is_some())
            .field(
                "provenance",
                &locks::lock(&self.provenance).as_ref().map(|p| &p.origin),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::LoaderId;

    fn entry_with_bytes(bytes: &[u8]) -> ResourceEntry {
        ResourceEntry::new(Provenance {
            bytes: bytes.to_vec(),
            origin: ResourceOrigin::File(PathBuf::from("/app/classes/pkg/Foo.wasm")),
            code_base: PathBuf::from("/app/classes"),
            last_modified: None,
            manifest: None,
            extracted: None,
        })
    }

    #[test]
    fn provenance_is_taken_once() {
        let entry = entry_with_bytes(b"bytes");
        assert_eq!(entry.bytes().as_deref(), Some(b"bytes".as_slice()));
        let provenance = entry.take_provenance().unwrap();
        assert_eq!(provenance.bytes, b"bytes");
        assert!(entry.take_provenance().is_none());
        assert!(entry.bytes().is_none());
        assert!(entry.origin().is_none());
    }

    #[test]
    fn unit_is_set_at_most_once() {
        let entry = entry_with_bytes(b"bytes");
        let loader = LoaderId::next();
        let first = Arc::new(CodeUnit::new(
            "pkg.Foo",
            loader,
            ResourceOrigin::File(PathBuf::from("/x")),
            blake3::hash(b"bytes"),
            5,
        ));
        entry.set_unit(Arc::clone(&first));
        let second = Arc::new(CodeUnit::new(
            "pkg.Foo",
            loader,
            ResourceOrigin::File(PathBuf::from("/y")),
            blake3::hash(b"other"),
            5,
        ));
        entry.set_unit(second);
        assert!(Arc::ptr_eq(&entry.unit().unwrap(), &first));
    }

    #[test]
    fn failure_is_sticky() {
        let entry = entry_with_bytes(b"junk");
        entry.record_failure("bad header");
        entry.record_failure("something else");
        assert_eq!(entry.failure(), Some("bad header"));
    }
}
