//! Error types shared by every pipeline stage.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::remote::RemoteError;

/// Errors raised by the pipelines.
///
/// Data-quality problems (bad dates, non-numeric UPH) never show up here: offending rows are
/// dropped and counted in the run diagnostics instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{source_name}: missing required columns {missing:?} (available: {available:?})")]
    Schema {
        source_name: String,
        missing: Vec<String>,
        available: Vec<String>,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read spreadsheet {path}: {message}")]
    Spreadsheet { path: PathBuf, message: String },

    #[error("failed to parse delimited file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write spreadsheet: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("unsupported input format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("no input files were given")]
    NoInput,

    #[error("reference table unavailable at {attempted:?}")]
    ReferenceUnavailable { attempted: Vec<PathBuf> },

    #[error("no data in the selected date range {start} to {end}")]
    EmptyDateRange { start: String, end: String },

    #[error("{0}")]
    EmptyResult(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
