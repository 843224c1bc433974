//! Export pipeline core: range planning, mode analysis, ordered concurrent execution and
//! checkpointed export.

pub mod context;
pub mod driver;
pub mod error;
pub mod exporter;
pub mod interval;
pub mod scheduler;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use driver::{Pipeline, PipelineConfig, RunSummary};
pub use error::Error;
