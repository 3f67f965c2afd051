//! fixkb core library: a local knowledge base of applied error fixes that
//! decides which of them are worth sharing with a community store.
//!
//! Fixes are canonicalized, stored durably, ranked against new errors and
//! linked into a lineage graph.  A novelty filter backed by a persistent
//! upload ledger gates what leaves the machine.  The crate can also be built
//! as a Python extension module (`--features python`).

pub mod config;
pub mod consensus;
pub mod engine;
pub mod errors;
pub mod models;
pub mod query;
pub mod store;
pub mod text;

#[cfg(feature = "python")]
mod python;

pub use config::EngineConfig;
pub use engine::{Collaborators, FixEngine};
pub use errors::{FixError, FixResult};
pub use models::{ApplyFixRequest, FixApplicationResult, FixRecord, RankedFix};
