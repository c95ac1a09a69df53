//! rts-core: static change-impact analysis and regression test selection
//! over compiled class units.
//!
//! The crate decodes class files into facts, builds a call graph with
//! virtual-dispatch fan-out, fingerprints every unit and member while
//! ignoring debug-only noise, and keeps a per-dependency record of which
//! tests reach what. Between two builds it reports the tests that cannot be
//! affected by the change.
//!
//! Most callers only need [`run_selection`] or the two-step
//! [`compute_change_data`] / [`update_store`] pair.

pub mod checksum;
pub mod config;
pub mod errors;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod indexer;
pub mod models;
pub mod query;
pub mod store;

pub use checksum::classify::compute_changed_methods;
pub use config::{Granularity, SelectionSettings, StoreEncoding};
pub use errors::{RtsError, RtsResult};
pub use indexer::filesystem::{ArtifactResolver, ClassDirResolver};
pub use indexer::pipeline::{analyze, Analysis};
pub use query::selector::{
    compute_change_data, run_selection, update_store, ChangeData, ScannedTests, TestSource,
};
