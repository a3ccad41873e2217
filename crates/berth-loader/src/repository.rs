//! Ordered repository roots.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::locks;

/// One candidate location for a resource: the full prefixed name and the
/// file it would live in. The caller performs the existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryResource {
    /// The repository prefix joined with the resource path.
    pub name: String,
    /// The candidate file under the repository directory.
    pub file: PathBuf,
}

#[derive(Debug, Clone)]
struct Repository {
    prefix: String,
    dir: PathBuf,
}

/// An ordered list of named directory roots searched for loose resources.
///
/// Pure lookup: this component performs no I/O itself; given a resource
/// path it yields one candidate location per registered root, in
/// registration order.
#[derive(Default)]
pub struct RepositoryManager {
    roots: Mutex<Vec<Repository>>,
}

impl RepositoryManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a root; `prefix` names the root and prefixes candidate names.
    pub fn add_repository(&self, prefix: impl Into<String>, dir: impl Into<PathBuf>) {
        let prefix = prefix.into();
        let dir = dir.into();
        tracing::debug!(%prefix, dir = %dir.display(), "Added repository root");
        locks::lock(&self.roots).push(Repository { prefix, dir });
    }

    /// Candidate locations for `path`, in registration order.
    #[must_use]
    pub fn get_resources(&self, path: &str) -> Vec<RepositoryResource> {
        locks::lock(&self.roots)
            .iter()
            .map(|root| RepositoryResource {
                name: format!("{}{path}", root.prefix),
                file: root.dir.join(path),
            })
            .collect()
    }

    /// The registered root directories, in registration order.
    #[must_use]
    pub fn directories(&self) -> Vec<PathBuf> {
        locks::lock(&self.roots)
            .iter()
            .map(|root| root.dir.clone())
            .collect()
    }

    /// Whether `dir` is one of the registered roots.
    #[must_use]
    pub fn contains_directory(&self, dir: &Path) -> bool {
        locks::lock(&self.roots).iter().any(|root| root.dir == dir)
    }

    /// Number of registered roots.
    #[must_use]
    pub fn len(&self) -> usize {
        locks::lock(&self.roots).len()
    }

    /// Whether no roots are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all roots.
    pub fn close(&self) {
        locks::lock(&self.roots).clear();
    }
}

impl fmt::Debug for RepositoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let roots = locks::lock(&self.roots);
        let mut list = f.debug_list();
        for root in roots.iter() {
            list.entry(&format_args!("{}:{}", root.prefix, root.dir.display()));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_in_registration_order() {
        let manager = RepositoryManager::new();
        manager.add_repository("/classes/", "/app/classes");
        manager.add_repository("/extra/", "/app/extra");

        let resources = manager.get_resources("pkg/Foo.wasm");
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].name, "/classes/pkg/Foo.wasm");
        assert_eq!(resources[0].file, PathBuf::from("/app/classes/pkg/Foo.wasm"));
        assert_eq!(resources[1].name, "/extra/pkg/Foo.wasm");
    }

    #[test]
    fn close_clears_roots() {
        let manager = RepositoryManager::new();
        manager.add_repository("/classes/", "/app/classes");
        assert!(!manager.is_empty());
        manager.close();
        assert!(manager.is_empty());
        assert!(manager.get_resources("x").is_empty());
    }
}
