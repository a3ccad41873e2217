//! Loader identity and ancestry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique, process-wide identifier of one code loader instance.
///
/// Identifiers are never reused within a process, so a retired loader's id
/// remains a valid key for leak diagnostics after the loader is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u64);

impl LoaderId {
    /// Allocate the next fresh loader id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader-{}", self.0)
    }
}

/// The ancestry chain of a loader: `[self, parent, grandparent, ...]`.
///
/// Lineages are attached to everything a hosted application registers
/// (drivers, thread-scoped slots, static cell values) so that retirement
/// can decide structurally whether a registration is "leaked" with respect
/// to a retiring loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderLineage(Vec<LoaderId>);

impl LoaderLineage {
    /// A lineage with no parent, for a root loader.
    #[must_use]
    pub fn root(id: LoaderId) -> Self {
        Self(vec![id])
    }

    /// A lineage for a loader created under `parent`.
    #[must_use]
    pub fn child(id: LoaderId, parent: &LoaderLineage) -> Self {
        let mut chain = Vec::with_capacity(parent.0.len().saturating_add(1));
        chain.push(id);
        chain.extend_from_slice(&parent.0);
        Self(chain)
    }

    /// The loader this lineage belongs to.
    #[must_use]
    pub fn defining(&self) -> LoaderId {
        self.0[0]
    }

    /// Whether this lineage is "leaked" with respect to `retiring`:
    /// true when the chain contains the retiring loader, i.e. the owner
    /// was defined by the retiring loader or one of its descendants.
    #[must_use]
    pub fn leaks(&self, retiring: LoaderId) -> bool {
        self.0.contains(&retiring)
    }

    /// The full chain, self first.
    #[must_use]
    pub fn chain(&self) -> &[LoaderId] {
        &self.0
    }
}

impl fmt::Display for LoaderLineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in &self.0 {
            if !first {
                f.write_str(" -> ")?;
            }
            write!(f, "{id}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = LoaderId::next();
        let b = LoaderId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn child_lineage_leaks_through_ancestors() {
        let root = LoaderId::next();
        let mid = LoaderId::next();
        let leaf = LoaderId::next();
        let other = LoaderId::next();

        let root_lineage = LoaderLineage::root(root);
        let mid_lineage = LoaderLineage::child(mid, &root_lineage);
        let leaf_lineage = LoaderLineage::child(leaf, &mid_lineage);

        assert_eq!(leaf_lineage.defining(), leaf);
        assert!(leaf_lineage.leaks(leaf));
        assert!(leaf_lineage.leaks(mid));
        assert!(leaf_lineage.leaks(root));
        assert!(!leaf_lineage.leaks(other));
        // An ancestor is not leaked with respect to its descendant.
        assert!(!root_lineage.leaks(leaf));
    }
}
