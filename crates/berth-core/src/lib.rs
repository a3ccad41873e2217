//! Shared vocabulary for the Berth hosted-application code loading runtime.
//!
//! Provides the types the runtime and its external collaborators agree on:
//!
//! - [`LoaderId`] / [`LoaderLineage`]: loader identity and ancestry, the
//!   basis of the structural "leaked reference" definition
//! - [`CodeUnit`]: a materialized, reference-identical code-unit handle
//! - [`Materializer`]: the one-time bytes-to-code-unit transformation
//! - [`context`]: the thread-scoped current-loader execution context
//! - [`DriverRegistry`] / [`ThreadSlotRegistry`]: explicit registries that
//!   hosted code must use for process-wide and thread-scoped registrations,
//!   enumerated (instead of introspected) at retirement

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod context;
pub mod id;
pub mod registry;
pub mod unit;

pub use id::{LoaderId, LoaderLineage};
pub use registry::{Driver, DriverRegistry, ThreadSlot, ThreadSlotRegistry};
pub use unit::{
    CodeUnit, MaterializeError, Materializer, ResourceOrigin, StaticCell, StaticKind, StaticValue,
};
