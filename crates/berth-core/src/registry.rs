//! Explicit retirement registries.
//!
//! Hosted code registers the process-wide things it creates (driver
//! singletons, thread-scoped storage slots) together with the lineage of
//! the loader that created them. Retirement is then an enumeration over
//! these registries rather than an introspection of live thread state.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::id::{LoaderId, LoaderLineage};

/// An opaque connection-producing resource registered by hosted code,
/// e.g. a database driver adapter.
pub trait Driver: Send + Sync {
    /// Stable driver name used in diagnostics.
    fn name(&self) -> &str;
}

struct RegisteredDriver {
    driver: Arc<dyn Driver>,
    lineage: LoaderLineage,
}

/// Registry of driver singletons that hosted applications register and,
/// too often, never deregister. The retirement pass removes every driver
/// whose lineage leaks with respect to the retiring loader.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<Vec<RegisteredDriver>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` as created by a loader with `lineage`.
    pub fn register(&self, driver: Arc<dyn Driver>, lineage: LoaderLineage) {
        tracing::debug!(driver = driver.name(), %lineage, "Registered driver");
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RegisteredDriver { driver, lineage });
    }

    /// Deregister a driver by name. Returns true if it was present.
    pub fn deregister(&self, name: &str) -> bool {
        let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = drivers.len();
        drivers.retain(|d| d.driver.name() != name);
        drivers.len() < before
    }

    /// Remove every driver whose lineage leaks with respect to `retiring`
    /// and return their names for logging.
    pub fn deregister_leaked(&self, retiring: LoaderId) -> Vec<String> {
        let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        drivers.retain(|d| {
            if d.lineage.leaks(retiring) {
                removed.push(d.driver.name().to_string());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Names of all currently registered drivers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|d| d.driver.name().to_string())
            .collect()
    }

    /// Number of registered drivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

/// One registered thread-scoped storage slot.
#[derive(Debug, Clone)]
pub struct ThreadSlot {
    /// Label of the owning thread (its name, typically).
    pub thread_label: String,
    /// The slot key.
    pub key: String,
    /// Lineage of the loader whose code produced the slot value.
    pub value_lineage: LoaderLineage,
    /// Short description of the value for diagnostics.
    pub description: String,
}

/// Registry of thread-scoped storage slots created by hosted code.
///
/// A slot belonging to another thread cannot be cleared safely without
/// that thread's cooperation, so retirement only *diagnoses* leaked slots;
/// the owning thread (or the hosting layer driving it) is expected to
/// call [`ThreadSlotRegistry::deregister`] itself.
#[derive(Default)]
pub struct ThreadSlotRegistry {
    slots: Mutex<Vec<ThreadSlot>>,
}

impl ThreadSlotRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot.
    pub fn register(&self, slot: ThreadSlot) {
        tracing::debug!(
            thread = %slot.thread_label,
            key = %slot.key,
            "Registered thread-scoped slot"
        );
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
    }

    /// Remove a slot by owning thread and key. Returns true if present.
    pub fn deregister(&self, thread_label: &str, key: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|s| !(s.thread_label == thread_label && s.key == key));
        slots.len() < before
    }

    /// Slots whose value lineage leaks with respect to `retiring`.
    #[must_use]
    pub fn leaked_slots(&self, retiring: LoaderId) -> Vec<ThreadSlot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.value_lineage.leaks(retiring))
            .cloned()
            .collect()
    }

    /// Number of registered slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ThreadSlotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSlotRegistry")
            .field("slots", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDriver(&'static str);

    impl Driver for FakeDriver {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn deregister_leaked_removes_only_matching_lineages() {
        let retiring = LoaderId::next();
        let surviving = LoaderId::next();
        let registry = DriverRegistry::new();

        registry.register(Arc::new(FakeDriver("pg")), LoaderLineage::root(retiring));
        registry.register(Arc::new(FakeDriver("mysql")), LoaderLineage::root(surviving));
        // A child of the retiring loader leaks too.
        let child = LoaderId::next();
        registry.register(
            Arc::new(FakeDriver("redis")),
            LoaderLineage::child(child, &LoaderLineage::root(retiring)),
        );

        let mut removed = registry.deregister_leaked(retiring);
        removed.sort_unstable();
        assert_eq!(removed, vec!["pg".to_string(), "redis".to_string()]);
        assert_eq!(registry.names(), vec!["mysql".to_string()]);
    }

    #[test]
    fn explicit_deregister() {
        let registry = DriverRegistry::new();
        registry.register(
            Arc::new(FakeDriver("pg")),
            LoaderLineage::root(LoaderId::next()),
        );
        assert!(registry.deregister("pg"));
        assert!(!registry.deregister("pg"));
        assert!(registry.is_empty());
    }

    #[test]
    fn leaked_slots_are_reported_not_removed() {
        let retiring = LoaderId::next();
        let other = LoaderId::next();
        let registry = ThreadSlotRegistry::new();
        registry.register(ThreadSlot {
            thread_label: "worker-1".into(),
            key: "session".into(),
            value_lineage: LoaderLineage::root(retiring),
            description: "session holder".into(),
        });
        registry.register(ThreadSlot {
            thread_label: "worker-2".into(),
            key: "metrics".into(),
            value_lineage: LoaderLineage::root(other),
            description: "counter".into(),
        });

        let leaked = registry.leaked_slots(retiring);
        assert_eq!(leaked.len(), 1);
        assert_eq!(leaked[0].thread_label, "worker-1");
        // Diagnostics only: the slot stays registered.
        assert_eq!(registry.len(), 2);
    }
}
