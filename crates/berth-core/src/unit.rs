//! Materialized code units and their provenance.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::id::{LoaderId, LoaderLineage};

/// Where a resource's bytes came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOrigin {
    /// A loose file under a repository root.
    File(PathBuf),
    /// An entry inside a registered archive.
    ArchiveEntry {
        /// The backing archive file.
        archive: PathBuf,
        /// The entry path inside the archive.
        entry: String,
    },
    /// An archive entry copied out to the scratch directory so the archive
    /// file need not stay open while the resource is read.
    Extracted {
        /// The backing archive file the bytes were copied from.
        archive: PathBuf,
        /// The extracted file on disk.
        file: PathBuf,
    },
}

impl fmt::Display for ResourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::ArchiveEntry { archive, entry } => {
                write!(f, "{}!/{entry}", archive.display())
            },
            Self::Extracted { file, .. } => write!(f, "{}", file.display()),
        }
    }
}

/// Classification of a static cell, deciding whether the retirement pass
/// may clear it. Only [`StaticKind::Object`] cells are ever cleared;
/// primitive, enum-like and host-runtime cells are never touched to avoid
/// corrupting shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticKind {
    /// A plain value (number, flag, string); never cleared.
    Primitive,
    /// An enum-like constant; never cleared.
    Enum,
    /// A value owned by the host runtime; never cleared.
    HostRuntime,
    /// An application object that may pin the loader in memory.
    Object,
}

/// The value held by a static cell, tagged with the lineage of the loader
/// whose code produced it.
pub struct StaticValue {
    /// Ancestry of the loader that produced the value.
    pub lineage: LoaderLineage,
    /// Short human-readable description used in retirement diagnostics.
    pub description: String,
    /// The value itself, opaque to the runtime.
    pub value: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for StaticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticValue")
            .field("lineage", &self.lineage)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// The explicit stand-in for a loaded code unit's static mutable field.
///
/// Hosted code registers the cells it creates on its own code units; the
/// retirement pass enumerates them instead of introspecting live memory.
#[derive(Debug)]
pub struct StaticCell {
    name: String,
    kind: StaticKind,
    value: RwLock<Option<StaticValue>>,
}

impl StaticCell {
    /// Create a cell holding `value`.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StaticKind, value: StaticValue) -> Self {
        Self {
            name: name.into(),
            kind,
            value: RwLock::new(Some(value)),
        }
    }

    /// The field name this cell stands in for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cell's classification.
    #[must_use]
    pub fn kind(&self) -> StaticKind {
        self.kind
    }

    /// Whether the cell currently holds a value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Clear the cell if it is an [`StaticKind::Object`] cell whose value
    /// leaks with respect to `retiring`. Returns the description of the
    /// dropped value, if anything was cleared.
    pub fn clear_if_leaked(&self, retiring: LoaderId) -> Option<String> {
        if self.kind != StaticKind::Object {
            return None;
        }
        let mut slot = self.value.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(value) if value.lineage.leaks(retiring) => {
                slot.take().map(|v| v.description)
            },
            _ => None,
        }
    }
}

/// One materialized code unit: the loadable equivalent of a class.
///
/// Handles are shared as `Arc<CodeUnit>`; the loader cache guarantees that
/// a given resource name resolves to one reference-identical handle for
/// the lifetime of the loader.
pub struct CodeUnit {
    name: String,
    loader: LoaderId,
    origin: ResourceOrigin,
    digest: blake3::Hash,
    size: usize,
    statics: Mutex<Vec<Arc<StaticCell>>>,
}

impl CodeUnit {
    /// Create a handle for the unit materialized from `size` bytes with
    /// content `digest`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        loader: LoaderId,
        origin: ResourceOrigin,
        digest: blake3::Hash,
        size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            loader,
            origin,
            digest,
            size,
            statics: Mutex::new(Vec::new()),
        }
    }

    /// The fully-qualified resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loader that defined this unit.
    #[must_use]
    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    /// Where the unit's bytes were loaded from.
    #[must_use]
    pub fn origin(&self) -> &ResourceOrigin {
        &self.origin
    }

    /// Content digest of the (post-transform) bytes.
    #[must_use]
    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    /// Size in bytes of the materialized unit.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Register a static cell created by this unit's code.
    pub fn register_static(&self, cell: Arc<StaticCell>) {
        self.statics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cell);
    }

    /// Snapshot of the unit's registered static cells.
    #[must_use]
    pub fn statics(&self) -> Vec<Arc<StaticCell>> {
        self.statics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear every object cell whose value leaks with respect to
    /// `retiring`; returns the number of cells cleared.
    pub fn clear_leaked_statics(&self, retiring: LoaderId) -> usize {
        self.statics()
            .iter()
            .filter(|cell| cell.clear_if_leaked(retiring).is_some())
            .count()
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit")
            .field("name", &self.name)
            .field("loader", &self.loader)
            .field("origin", &self.origin)
            .field("digest", &self.digest.to_hex().as_str())
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Failure to turn raw bytes into a live code unit.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct MaterializeError {
    /// What was wrong with the bytes.
    pub reason: String,
}

impl MaterializeError {
    /// Create an error with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// One-time transformation of raw resource bytes into a live code unit.
///
/// Called exactly once per resource name, under the loader's per-name
/// materialization lock, after any registered transformer hooks have run.
pub trait Materializer: Send + Sync {
    /// Materialize `bytes` into a code unit handle.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError`] when the bytes do not form a valid
    /// code unit; the failure is fatal for that name only.
    fn materialize(
        &self,
        name: &str,
        bytes: &[u8],
        origin: &ResourceOrigin,
        loader: LoaderId,
    ) -> Result<Arc<CodeUnit>, MaterializeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of(lineage: LoaderLineage, description: &str) -> StaticValue {
        StaticValue {
            lineage,
            description: description.to_string(),
            value: Arc::new(42_u32),
        }
    }

    #[test]
    fn object_cell_cleared_only_when_leaked() {
        let retiring = LoaderId::next();
        let other = LoaderId::next();

        let leaked = StaticCell::new(
            "connection_pool",
            StaticKind::Object,
            value_of(LoaderLineage::root(retiring), "pool"),
        );
        let foreign = StaticCell::new(
            "shared_cache",
            StaticKind::Object,
            value_of(LoaderLineage::root(other), "cache"),
        );

        assert_eq!(leaked.clear_if_leaked(retiring).as_deref(), Some("pool"));
        assert!(!leaked.is_set());
        assert!(foreign.clear_if_leaked(retiring).is_none());
        assert!(foreign.is_set());
    }

    #[test]
    fn non_object_cells_are_never_cleared() {
        let retiring = LoaderId::next();
        for kind in [StaticKind::Primitive, StaticKind::Enum, StaticKind::HostRuntime] {
            let cell = StaticCell::new(
                "field",
                kind,
                value_of(LoaderLineage::root(retiring), "value"),
            );
            assert!(cell.clear_if_leaked(retiring).is_none());
            assert!(cell.is_set());
        }
    }

    #[test]
    fn unit_clears_only_leaked_cells() {
        let retiring = LoaderId::next();
        let other = LoaderId::next();
        let unit = CodeUnit::new(
            "app.Main",
            retiring,
            ResourceOrigin::File(PathBuf::from("/app/classes/app/Main.wasm")),
            blake3::hash(b"module"),
            6,
        );
        unit.register_static(Arc::new(StaticCell::new(
            "leaked",
            StaticKind::Object,
            value_of(LoaderLineage::root(retiring), "leaked"),
        )));
        unit.register_static(Arc::new(StaticCell::new(
            "kept",
            StaticKind::Object,
            value_of(LoaderLineage::root(other), "kept"),
        )));

        assert_eq!(unit.clear_leaked_statics(retiring), 1);
        assert_eq!(unit.clear_leaked_statics(retiring), 0);
    }
}
