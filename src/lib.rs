//! uph-clean: batch cleaning and aggregation of units-per-hour exports, plus process-cycle
//! reconstruction from machine logs, with optional Python bindings.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod logging;
pub mod logview;
pub mod lookup;
pub mod normalize;
pub mod outlier;
pub mod pack_type;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod remote;
pub mod rollup;
pub mod sink;
pub mod stats;
pub mod table;
pub mod types;

pub use error::{PipelineError, Result};

#[cfg(feature = "python")]
mod python;
