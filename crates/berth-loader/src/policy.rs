//! Delegation and sealing policies.
//!
//! The order in which a name is resolved (parent first or locally first)
//! is a pure function of the name and the policy, decided before any lock
//! is taken; the locking and caching logic stays independent of the
//! policy table.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, LoaderResult};

/// Namespace prefixes that are always delegated first by default; they
/// belong to the host runtime and must never be overridden by a hosted
/// application.
pub const DEFAULT_RESERVED: &[&str] = &["berth", "host"];

/// Which side of the delegation protocol is consulted first for a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOrder {
    /// Ask the parent loader before the local repositories/archives.
    ParentFirst,
    /// Search local repositories/archives before the parent.
    LocalFirst,
}

/// Per-loader delegation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationPolicy {
    /// When true the parent is always consulted first (the conservative
    /// default); when false the loader is local-first except for reserved
    /// namespaces.
    pub parent_first: bool,
    /// Protected namespace prefixes (dotted), always delegated first and
    /// never resolved locally.
    pub reserved: Vec<String>,
    /// Prefixes exempt from the reserved rule: the application may always
    /// override these regardless of protection.
    pub overridable: Vec<String>,
}

impl Default for DelegationPolicy {
    fn default() -> Self {
        Self {
            parent_first: true,
            reserved: DEFAULT_RESERVED.iter().map(ToString::to_string).collect(),
            overridable: Vec::new(),
        }
    }
}

/// True when `name` equals `prefix` or lives under `prefix.`.
fn matches_prefix(name: &str, prefix: &str) -> bool {
    name == prefix
        || (name.len() > prefix.len()
            && name.starts_with(prefix)
            && name[prefix.len()..].starts_with('.'))
}

/// Whether `name` falls in a protected namespace not covered by the
/// override-exemption list. Reserved names never resolve locally.
#[must_use]
pub fn is_reserved(name: &str, policy: &DelegationPolicy) -> bool {
    if policy.overridable.iter().any(|p| matches_prefix(name, p)) {
        return false;
    }
    policy.reserved.iter().any(|p| matches_prefix(name, p))
}

/// Decide the delegation order for `name` under `policy`.
#[must_use]
pub fn resolution_order(name: &str, policy: &DelegationPolicy) -> ResolutionOrder {
    if policy.parent_first || is_reserved(name, policy) {
        ResolutionOrder::ParentFirst
    } else {
        ResolutionOrder::LocalFirst
    }
}

/// The namespace of a dotted name (`pkg.sub.Foo` -> `pkg.sub`).
#[must_use]
pub fn namespace_of(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(ns, _)| ns)
}

/// Namespace sealing policy: an explicit, independently testable object
/// instead of a check buried behind an enforcement hook.
#[derive(Debug)]
pub enum SealPolicy {
    /// Ignore seal declarations entirely.
    Permissive,
    /// Enforce that a namespace sealed by an archive manifest is only ever
    /// loaded from the code base that first sealed it.
    Enforcing(SealRegistry),
}

impl SealPolicy {
    /// An enforcing policy with an empty registry.
    #[must_use]
    pub fn enforcing() -> Self {
        Self::Enforcing(SealRegistry::default())
    }

    /// Check (and record) `name` being loaded from `code_base`, where
    /// `sealed` says whether the originating manifest seals the name's
    /// namespace.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::SealViolation`] when the namespace is sealed
    /// to a different code base.
    pub fn check(&self, name: &str, sealed: bool, code_base: &Path) -> LoaderResult<()> {
        let Self::Enforcing(registry) = self else {
            return Ok(());
        };
        let namespace = namespace_of(name);
        if namespace.is_empty() {
            return Ok(());
        }
        if sealed {
            let entry = registry
                .sealed
                .entry(namespace.to_string())
                .or_insert_with(|| code_base.to_path_buf());
            if entry.value() != code_base {
                return Err(LoaderError::SealViolation {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    sealed_by: entry.value().clone(),
                });
            }
        } else if let Some(entry) = registry.sealed.get(namespace) {
            if entry.value() != code_base {
                return Err(LoaderError::SealViolation {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    sealed_by: entry.value().clone(),
                });
            }
        }
        Ok(())
    }
}

/// Record of which code base sealed which namespace.
#[derive(Debug, Default)]
pub struct SealRegistry {
    sealed: DashMap<String, PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_is_segment_aware() {
        let policy = DelegationPolicy {
            parent_first: false,
            reserved: vec!["host".into()],
            overridable: vec![],
        };
        assert!(is_reserved("host.db.Driver", &policy));
        assert!(is_reserved("host", &policy));
        // "hostile" is not under "host".
        assert!(!is_reserved("hostile.Takeover", &policy));
    }

    #[test]
    fn overridable_exempts_reserved_prefix() {
        let policy = DelegationPolicy {
            parent_first: false,
            reserved: vec!["host".into()],
            overridable: vec!["host.ext".into()],
        };
        assert!(is_reserved("host.db.Driver", &policy));
        assert!(!is_reserved("host.ext.Plugin", &policy));
        assert_eq!(
            resolution_order("host.ext.Plugin", &policy),
            ResolutionOrder::LocalFirst
        );
        assert_eq!(
            resolution_order("host.db.Driver", &policy),
            ResolutionOrder::ParentFirst
        );
    }

    #[test]
    fn parent_first_flag_wins_for_ordinary_names() {
        let mut policy = DelegationPolicy::default();
        assert_eq!(
            resolution_order("app.Main", &policy),
            ResolutionOrder::ParentFirst
        );
        policy.parent_first = false;
        assert_eq!(
            resolution_order("app.Main", &policy),
            ResolutionOrder::LocalFirst
        );
    }

    #[test]
    fn namespace_of_dotted_names() {
        assert_eq!(namespace_of("pkg.sub.Foo"), "pkg.sub");
        assert_eq!(namespace_of("Foo"), "");
    }

    #[test]
    fn enforcing_seal_denies_second_code_base() {
        let policy = SealPolicy::enforcing();
        let a = Path::new("/lib/a.zip");
        let b = Path::new("/lib/b.zip");

        policy.check("pkg.Foo", true, a).unwrap();
        // Same namespace, same code base: fine.
        policy.check("pkg.Bar", true, a).unwrap();
        // Same namespace from another archive: violation, sealed or not.
        assert!(matches!(
            policy.check("pkg.Baz", true, b),
            Err(LoaderError::SealViolation { .. })
        ));
        assert!(matches!(
            policy.check("pkg.Qux", false, b),
            Err(LoaderError::SealViolation { .. })
        ));
        // Unrelated namespace is unaffected.
        policy.check("other.Foo", false, b).unwrap();
    }

    #[test]
    fn permissive_seal_allows_everything() {
        let policy = SealPolicy::Permissive;
        policy.check("pkg.Foo", true, Path::new("/a.zip")).unwrap();
        policy.check("pkg.Bar", true, Path::new("/b.zip")).unwrap();
    }
}
