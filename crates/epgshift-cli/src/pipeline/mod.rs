//! Channel catalog, run scope and the normalization pipeline.

pub mod catalog;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod scope;
pub mod task;

pub use catalog::{Catalog, SUGGESTION_LIMIT};
pub use orchestrator::{Orchestrator, RunOptions};
pub use scope::{ScopeRequest, resolve_scope};
