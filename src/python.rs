//! PyO3 bindings: exposes the pipelines to Python.

use std::path::PathBuf;

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::{self, DateRange, PipelineContext};
use crate::reader::{self, FileSource};
use crate::types::{FrameSummary, RunReport};

fn to_py_err(e: PipelineError) -> PyErr {
    match e {
        PipelineError::Io { .. }
        | PipelineError::Spreadsheet { .. }
        | PipelineError::Csv { .. }
        | PipelineError::NoInput
        | PipelineError::ReferenceUnavailable { .. }
        | PipelineError::Xlsx(_)
        | PipelineError::Remote(_) => PyIOError::new_err(e.to_string()),
        _ => PyValueError::new_err(e.to_string()),
    }
}

fn context(config_path: Option<&str>, output_dir: Option<&str>) -> PyResult<PipelineContext> {
    let config = match config_path {
        Some(path) => PipelineConfig::load(&PathBuf::from(path)),
        None => PipelineConfig::discover(),
    }
    .map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(PipelineContext::new(pipeline::with_output_dir(
        config,
        output_dir.map(PathBuf::from),
    )))
}

/// Clean and average die-attach UPH files.
#[pyfunction]
#[pyo3(signature = (paths, start_date=None, end_date=None, config_path=None, output_dir=None))]
fn run_die_attach(
    paths: Vec<String>,
    start_date: Option<&str>,
    end_date: Option<&str>,
    config_path: Option<&str>,
    output_dir: Option<&str>,
) -> PyResult<RunReport> {
    let mut ctx = context(config_path, output_dir)?;
    let range = DateRange::from_bounds(start_date, end_date).map_err(to_py_err)?;
    let sink = ctx.xlsx_sink();
    pipeline::run_die_attach(&mut ctx, &pipeline::file_sources(&paths), range.as_ref(), &sink)
        .map_err(to_py_err)
}

/// Clean wire-bond UPH files and compute efficiency against the wire reference.
#[pyfunction]
#[pyo3(signature = (paths, start_date=None, end_date=None, config_path=None, output_dir=None))]
fn run_wire_bond(
    paths: Vec<String>,
    start_date: Option<&str>,
    end_date: Option<&str>,
    config_path: Option<&str>,
    output_dir: Option<&str>,
) -> PyResult<RunReport> {
    let mut ctx = context(config_path, output_dir)?;
    let range = DateRange::from_bounds(start_date, end_date).map_err(to_py_err)?;
    let sink = ctx.xlsx_sink();
    pipeline::run_wire_bond(&mut ctx, &pipeline::file_sources(&paths), range.as_ref(), &sink)
        .map_err(to_py_err)
}

/// Latest pack type per (product, BOM) pair.
#[pyfunction]
#[pyo3(signature = (history_paths, pairs_path=None, config_path=None, output_dir=None))]
fn run_pack_type(
    history_paths: Vec<String>,
    pairs_path: Option<&str>,
    config_path: Option<&str>,
    output_dir: Option<&str>,
) -> PyResult<RunReport> {
    let mut ctx = context(config_path, output_dir)?;
    let sink = ctx.xlsx_sink();
    let pairs = pairs_path.map(FileSource::new);
    pipeline::run_pack_type(
        &mut ctx,
        &pipeline::file_sources(&history_paths),
        pairs.as_ref().map(|p| p as &dyn reader::IngestionSource),
        &sink,
    )
    .map_err(to_py_err)
}

/// Reconstruct machine logs (plain or `.gz`) and roll timings up per package.
#[pyfunction]
#[pyo3(signature = (paths, config_path=None, output_dir=None))]
fn run_logview(paths: Vec<String>, config_path: Option<&str>, output_dir: Option<&str>) -> PyResult<RunReport> {
    let mut ctx = context(config_path, output_dir)?;
    let sink = ctx.xlsx_sink();
    pipeline::run_logview(&mut ctx, &paths, &sink).map_err(to_py_err)
}

/// `(min_date, max_date, valid_records, total_records)`, or `None` without usable dates.
#[pyfunction]
fn preview_date_range(path: &str) -> PyResult<Option<(String, String, usize, usize)>> {
    let table = reader::read_table(&PathBuf::from(path)).map_err(to_py_err)?;
    Ok(pipeline::preview_dates(&table).map(|p| {
        (
            p.min_date.to_string(),
            p.max_date.to_string(),
            p.valid_records,
            p.total_records,
        )
    }))
}

/// Python module: uph_clean
#[pymodule]
fn uph_clean(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_die_attach, m)?)?;
    m.add_function(wrap_pyfunction!(run_wire_bond, m)?)?;
    m.add_function(wrap_pyfunction!(run_pack_type, m)?)?;
    m.add_function(wrap_pyfunction!(run_logview, m)?)?;
    m.add_function(wrap_pyfunction!(preview_date_range, m)?)?;
    m.add_class::<RunReport>()?;
    m.add_class::<FrameSummary>()?;
    Ok(())
}
