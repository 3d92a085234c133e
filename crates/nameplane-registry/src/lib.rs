//! nameplane registry — the namespaced service table and its lifecycle.
//!
//! This crate provides:
//! - **`registry`** — the two-level namespace → name → service table,
//!   registration/deregistration, listing, paging, and search, plus the
//!   service-meta change listener
//! - **`merge`** — computation of the next instance list for a plane
//! - **`reaper`** — the periodic empty-service sweep

pub mod merge;
pub mod reaper;
pub mod registry;

pub use merge::{merge, MergeAction};
pub use reaper::{EmptyServiceReaper, MAX_FINALIZE_COUNT};
pub use registry::ServiceRegistry;
