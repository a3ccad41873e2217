//! Best-effort reference cleanup at loader retirement.
//!
//! A retiring loader stays pinned in memory for as long as anything
//! process-wide still points into it: a driver singleton registered by
//! hosted code, a thread-scoped storage slot, a static cell holding an
//! application object. The cleaner walks the explicit registries, removes
//! what can be removed safely and loudly diagnoses what cannot. Every
//! phase is best-effort; cleanup never fails the retirement.

use std::sync::Arc;

use berth_core::{CodeUnit, DriverRegistry, LoaderId, ThreadSlot, ThreadSlotRegistry};

/// What one retirement pass found and did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Names of drivers that were force-deregistered.
    pub drivers_removed: Vec<String>,
    /// Thread-scoped slots still holding values from the retiring loader.
    /// Reported only; clearing another thread's slot is not safe.
    pub leaked_slots: Vec<ThreadSlot>,
    /// Number of static cells cleared across all loaded units.
    pub statics_cleared: usize,
}

impl CleanupReport {
    /// Whether the pass found anything at all.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drivers_removed.is_empty() && self.leaked_slots.is_empty() && self.statics_cleared == 0
    }
}

/// Runs the retirement pass for one loader.
pub struct ReferenceCleaner<'a> {
    retiring: LoaderId,
    drivers: &'a DriverRegistry,
    thread_slots: &'a ThreadSlotRegistry,
}

impl<'a> ReferenceCleaner<'a> {
    /// Build a cleaner for `retiring` over the given registries.
    #[must_use]
    pub fn new(
        retiring: LoaderId,
        drivers: &'a DriverRegistry,
        thread_slots: &'a ThreadSlotRegistry,
    ) -> Self {
        Self {
            retiring,
            drivers,
            thread_slots,
        }
    }

    /// Run every cleanup phase. `units` is the snapshot of the loader's
    /// materialized code units; `clear_statics` gates the static-cell
    /// phase.
    pub fn clear_references(
        &self,
        units: &[Arc<CodeUnit>],
        clear_statics: bool,
    ) -> CleanupReport {
        let mut report = CleanupReport {
            drivers_removed: self.drivers.deregister_leaked(self.retiring),
            leaked_slots: self.thread_slots.leaked_slots(self.retiring),
            statics_cleared: 0,
        };
        for name in &report.drivers_removed {
            tracing::warn!(
                loader = %self.retiring,
                driver = %name,
                "Force-deregistered a driver the application failed to deregister"
            );
        }
        for slot in &report.leaked_slots {
            tracing::error!(
                loader = %self.retiring,
                thread = %slot.thread_label,
                key = %slot.key,
                value = %slot.description,
                "Thread-scoped slot still references the retiring loader"
            );
        }
        if clear_statics {
            for unit in units {
                let cleared = unit.clear_leaked_statics(self.retiring);
                if cleared > 0 {
                    tracing::debug!(
                        loader = %self.retiring,
                        unit = unit.name(),
                        cleared,
                        "Cleared leaked static cells"
                    );
                }
                report.statics_cleared = report.statics_cleared.saturating_add(cleared);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{
        Driver, LoaderLineage, ResourceOrigin, StaticCell, StaticKind, StaticValue,
    };
    use std::path::PathBuf;

    struct FakeDriver(&'static str);

    impl Driver for FakeDriver {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn unit_with_static(loader: LoaderId, lineage: LoaderLineage) -> Arc<CodeUnit> {
        let unit = CodeUnit::new(
            "app.Main",
            loader,
            ResourceOrigin::File(PathBuf::from("/app/classes/app/Main.wasm")),
            blake3::hash(b"module"),
            6,
        );
        unit.register_static(Arc::new(StaticCell::new(
            "pool",
            StaticKind::Object,
            StaticValue {
                lineage,
                description: "connection pool".into(),
                value: Arc::new(1_u8),
            },
        )));
        Arc::new(unit)
    }

    #[test]
    fn full_pass_reports_each_phase() {
        let retiring = LoaderId::next();
        let surviving = LoaderId::next();
        let drivers = DriverRegistry::new();
        let slots = ThreadSlotRegistry::new();

        drivers.register(Arc::new(FakeDriver("pg")), LoaderLineage::root(retiring));
        drivers.register(Arc::new(FakeDriver("mysql")), LoaderLineage::root(surviving));
        slots.register(ThreadSlot {
            thread_label: "worker-1".into(),
            key: "session".into(),
            value_lineage: LoaderLineage::root(retiring),
            description: "session holder".into(),
        });

        let units = vec![unit_with_static(retiring, LoaderLineage::root(retiring))];
        let report =
            ReferenceCleaner::new(retiring, &drivers, &slots).clear_references(&units, true);

        assert_eq!(report.drivers_removed, vec!["pg".to_string()]);
        assert_eq!(report.leaked_slots.len(), 1);
        assert_eq!(report.statics_cleared, 1);
        assert!(!report.is_clean());
        // The surviving loader's driver is untouched; the slot stays
        // registered for its owning thread to clear.
        assert_eq!(drivers.names(), vec!["mysql".to_string()]);
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn statics_phase_is_gated() {
        let retiring = LoaderId::next();
        let drivers = DriverRegistry::new();
        let slots = ThreadSlotRegistry::new();
        let units = vec![unit_with_static(retiring, LoaderLineage::root(retiring))];

        let report =
            ReferenceCleaner::new(retiring, &drivers, &slots).clear_references(&units, false);
        assert_eq!(report.statics_cleared, 0);
        assert!(units[0].statics()[0].is_set());
    }

    #[test]
    fn clean_retirement_reports_nothing() {
        let retiring = LoaderId::next();
        let drivers = DriverRegistry::new();
        let slots = ThreadSlotRegistry::new();
        let report = ReferenceCleaner::new(retiring, &drivers, &slots).clear_references(&[], true);
        assert!(report.is_clean());
    }
}
