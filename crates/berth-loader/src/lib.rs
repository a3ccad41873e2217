//! Per-application code loading for the Berth hosted-application runtime.
//!
//! Each hosted application gets one [`CodeLoader`]: it resolves dotted
//! resource names against the application's repository roots and ZIP
//! archives, delegates to a parent loader according to a configurable
//! policy, materializes bytes into reference-identical [`CodeUnit`]
//! handles exactly once per name, and runs a best-effort reference
//! cleanup pass when the application is retired.
//!
//! [`CodeUnit`]: berth_core::CodeUnit

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod archive;
pub mod cleaner;
pub mod entry;
pub mod error;
pub mod loader;
mod locks;
pub mod materialize;
pub mod policy;
pub mod repository;
pub mod transform;

/// File suffix of a loadable code unit.
pub const CODE_UNIT_SUFFIX: &str = ".wasm";

pub use archive::{ArchiveManager, ArchiveManifest};
pub use cleaner::{CleanupReport, ReferenceCleaner};
pub use entry::{Provenance, ResourceEntry};
pub use error::{LoaderError, LoaderResult};
pub use loader::{CodeLoader, DelegateLoader, Lifecycle, PathTimestamp};
pub use materialize::WasmMaterializer;
pub use policy::{DelegationPolicy, ResolutionOrder, SealPolicy};
pub use repository::{RepositoryManager, RepositoryResource};
pub use transform::{CodeTransformer, TransformError};
