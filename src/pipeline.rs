//! End-to-end pipelines: die attach, wire bond, pick-and-place pack type and logview.
//!
//! Every run owns a [`PipelineContext`] carrying the configuration, a run id used to name its
//! artifacts, and the diagnostics collected while reading inputs. Batch inputs are read one at
//! a time; when more than one input is given, an input that cannot be read or lacks required
//! columns is skipped and recorded instead of aborting the run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, NaiveDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::config::{AliasConfig, ConfigError, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::logview::{self, LogAnalysis};
use crate::lookup::{DeviceReference, LookupKey, ReferenceTable, WireResolution};
use crate::normalize::{self, SemanticField as F};
use crate::outlier::{self, OutlierMethod};
use crate::pack_type;
use crate::parser::{self, LogParser};
use crate::reader::{self, FileSource, IngestionSource};
use crate::rollup::{self, FrameStockTable};
use crate::sink::{Sink, XlsxSink};
use crate::stats;
use crate::table::{parse_datetime, Cell, Sheet, Table};
use crate::types::{FrameSummary, GroupKey, MeasurementRow, RunReport, MAPPING_NONE, NOT_FOUND};

// ── Context ─────────────────────────────────────────────────────────

/// Counters collected while reading inputs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics {
    pub input_rows: usize,
    /// Rows dropped for a bad BOM, UPH or date.
    pub dropped_rows: usize,
    /// Inputs skipped in a batch, with the reason.
    pub skipped_files: Vec<String>,
}

/// Per-run state. Nothing here is shared between runs.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub run_id: String,
    pub started_at: NaiveDateTime,
    pub diagnostics: Diagnostics,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            run_id: Uuid::new_v4().to_string(),
            started_at: Local::now().naive_local(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Spreadsheet sink writing into the configured output directory.
    pub fn xlsx_sink(&self) -> XlsxSink {
        XlsxSink::new(&self.config.output.dir, &self.run_id)
    }

    fn report(&self, output_path: &Path, groups: usize, outliers_removed: usize) -> RunReport {
        RunReport {
            output_path: output_path.display().to_string(),
            run_id: self.run_id.clone(),
            input_rows: self.diagnostics.input_rows,
            dropped_rows: self.diagnostics.dropped_rows,
            groups,
            outliers_removed,
            skipped_files: self.diagnostics.skipped_files.clone(),
        }
    }

    /// Apply `f` to every source. A single source propagates its error; in a batch failures
    /// are skipped and recorded, and only a batch where everything failed is an error.
    fn for_each_source<T>(
        &mut self,
        sources: &[Box<dyn IngestionSource>],
        mut f: impl FnMut(&mut Self, &str, Table) -> Result<T>,
    ) -> Result<Vec<T>> {
        if sources.is_empty() {
            return Err(PipelineError::NoInput);
        }
        let single = sources.len() == 1;
        let mut out = Vec::with_capacity(sources.len());
        let mut first_error = None;
        for source in sources {
            let name = source.name();
            match source.read().and_then(|table| f(self, &name, table)) {
                Ok(value) => out.push(value),
                Err(e) if single => return Err(e),
                Err(e) => {
                    warn!(source = %name, error = %e, "skipping input");
                    self.diagnostics.skipped_files.push(format!("{name}: {e}"));
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if out.is_empty() => Err(e),
            _ => Ok(out),
        }
    }
}

/// One boxed [`FileSource`] per path.
pub fn file_sources<P: AsRef<Path>>(paths: &[P]) -> Vec<Box<dyn IngestionSource>> {
    paths
        .iter()
        .map(|p| Box::new(FileSource::new(p.as_ref())) as Box<dyn IngestionSource>)
        .collect()
}

// ── Measurements ────────────────────────────────────────────────────

/// Rows kept from one input, plus how many were dropped.
#[derive(Clone, Debug, Default)]
pub struct Measurements {
    pub rows: Vec<MeasurementRow>,
    pub input_rows: usize,
    pub dropped_rows: usize,
}

fn optional_text(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty())
}

/// Turn a raw throughput table into measurement rows.
///
/// Rows with a blank BOM, a missing or negative UPH, or (when the table has a date column) an
/// unparseable date are dropped and counted.
pub fn extract_measurements(table: &Table, source_name: &str, aliases: &AliasConfig) -> Result<Measurements> {
    let table = normalize::normalize_columns(table.clone());
    let mapping = normalize::measurement_schema().resolve(&table, source_name)?;
    let has_dates = mapping.has(F::Timestamp);

    let mut out = Measurements {
        input_rows: table.len(),
        ..Default::default()
    };
    for i in 0..table.len() {
        let bom = mapping
            .text(&table, i, F::BomId)
            .map(|b| normalize::normalize_bom(&b))
            .filter(|b| !b.is_empty());
        let uph = mapping
            .number(&table, i, F::Uph)
            .filter(|u| u.is_finite() && *u >= 0.0);
        let timestamp = mapping.cell(&table, i, F::Timestamp).and_then(Cell::as_datetime);

        let (Some(bom), Some(uph)) = (bom, uph) else {
            out.dropped_rows += 1;
            continue;
        };
        if has_dates && timestamp.is_none() {
            out.dropped_rows += 1;
            continue;
        }

        out.rows.push(MeasurementRow {
            bom_id: bom,
            machine_model: mapping
                .text(&table, i, F::MachineModel)
                .map(|m| normalize::normalize_machine_model(&m, aliases))
                .filter(|m| !m.is_empty()),
            option_code: mapping
                .text(&table, i, F::OptionCode)
                .map(|o| normalize::normalize_option_code(&o, aliases))
                .filter(|o| !o.is_empty()),
            uph,
            timestamp,
            operation: mapping.text(&table, i, F::Operation),
            device: mapping.text(&table, i, F::Device),
            package_code: optional_text(mapping.text(&table, i, F::PackageCode)),
            bom_revision: optional_text(mapping.text(&table, i, F::BomRevision)),
            product_number: optional_text(mapping.text(&table, i, F::ProductNumber)),
        });
    }
    if out.dropped_rows > 0 {
        warn!(source = source_name, dropped = out.dropped_rows, "dropped rows with bad BOM, UPH or date");
    }
    Ok(out)
}

// ── Dates ───────────────────────────────────────────────────────────

/// Inclusive calendar-date range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Accepts `YYYY-MM-DD`, `YYYY/MM/DD` and the other export date layouts.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let date = |raw: &str| {
            parse_datetime(raw).map(|dt| dt.date()).ok_or_else(|| {
                PipelineError::Config(ConfigError::Invalid(format!("invalid date {raw:?}")))
            })
        };
        Ok(Self {
            start: date(start)?,
            end: date(end)?,
        })
    }

    /// Both bounds or neither; a half-open range is rejected.
    pub fn from_bounds(start: Option<&str>, end: Option<&str>) -> Result<Option<Self>> {
        match (start, end) {
            (Some(start), Some(end)) => Self::parse(start, end).map(Some),
            (None, None) => Ok(None),
            _ => Err(PipelineError::Config(ConfigError::Invalid(
                "a date range needs both a start and an end date".to_string(),
            ))),
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        (self.start..=self.end).contains(&ts.date())
    }
}

/// Keep rows dated within `range`. Undated rows cannot be placed and are removed too; an empty
/// result is an error.
pub fn filter_date_range(rows: Vec<MeasurementRow>, range: &DateRange) -> Result<Vec<MeasurementRow>> {
    let before = rows.len();
    let kept: Vec<MeasurementRow> = rows
        .into_iter()
        .filter(|r| r.timestamp.is_some_and(|ts| range.contains(ts)))
        .collect();
    info!(kept = kept.len(), total = before, start = %range.start, end = %range.end, "filtered by date");
    if kept.is_empty() {
        return Err(PipelineError::EmptyDateRange {
            start: range.start.to_string(),
            end: range.end.to_string(),
        });
    }
    Ok(kept)
}

/// Date coverage of one input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatePreview {
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub valid_records: usize,
    pub total_records: usize,
}

/// Min/max date of the first date-like column. `None` when there is no such column or no
/// value in it parses.
pub fn preview_dates(table: &Table) -> Option<DatePreview> {
    let col = normalize::resolve_column(&table.columns, &["date", "time"])?;
    let dates: Vec<NaiveDate> = (0..table.len())
        .filter_map(|i| table.cell(i, col).as_datetime())
        .map(|dt| dt.date())
        .collect();
    Some(DatePreview {
        min_date: *dates.iter().min()?,
        max_date: *dates.iter().max()?,
        valid_records: dates.len(),
        total_records: table.len(),
    })
}

// ── Group cleaning ──────────────────────────────────────────────────

/// One cleaned and averaged throughput group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupResult {
    pub key: GroupKey,
    /// First surviving row, for pass-through attributes.
    pub first: MeasurementRow,
    pub mean_uph: f64,
    pub data_points: usize,
    pub original_count: usize,
    pub method: OutlierMethod,
}

impl GroupResult {
    pub fn outliers_removed(&self) -> usize {
        self.original_count - self.data_points
    }
}

/// Trimmed rows of every group, tagged with the group's trim outcome.
#[derive(Clone, Debug)]
pub struct CleanedRow {
    pub row: MeasurementRow,
    pub method: OutlierMethod,
    pub before: usize,
    pub after: usize,
}

/// Trim every group independently.
pub fn clean_groups(rows: Vec<MeasurementRow>, config: &PipelineConfig) -> Vec<CleanedRow> {
    let mut groups: BTreeMap<GroupKey, Vec<MeasurementRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.group_key()).or_default().push(row);
    }
    groups
        .into_values()
        .flat_map(|group| {
            let trimmed = outlier::trim(group, |r: &MeasurementRow| r.uph, &config.outlier);
            let (method, before, after) = (trimmed.method, trimmed.before, trimmed.after);
            trimmed.rows.into_iter().map(move |row| CleanedRow {
                row,
                method,
                before,
                after,
            })
        })
        .collect()
}

/// Average cleaned rows per group.
pub fn average_groups(cleaned: Vec<CleanedRow>, config: &PipelineConfig) -> Vec<GroupResult> {
    aggregate(
        cleaned,
        |c| c.row.group_key(),
        |c| c.row.uph,
        config.rounding.throughput,
    )
    .into_iter()
    .map(|agg| GroupResult {
        key: agg.key,
        mean_uph: agg.mean,
        data_points: agg.count,
        original_count: agg.first.before,
        method: agg.first.method,
        first: agg.first.row,
    })
    .collect()
}

fn read_measurements(
    ctx: &mut PipelineContext,
    sources: &[Box<dyn IngestionSource>],
    range: Option<&DateRange>,
) -> Result<Vec<MeasurementRow>> {
    let batches = ctx.for_each_source(sources, |ctx, name, table| {
        let m = extract_measurements(&table, name, &ctx.config.aliases)?;
        info!(source = name, rows = m.rows.len(), dropped = m.dropped_rows, "read measurements");
        ctx.diagnostics.input_rows += m.input_rows;
        ctx.diagnostics.dropped_rows += m.dropped_rows;
        Ok(m.rows)
    })?;
    let rows: Vec<MeasurementRow> = batches.into_iter().flatten().collect();
    match range {
        Some(range) => filter_date_range(rows, range),
        None if rows.is_empty() => Err(PipelineError::EmptyResult(
            "no usable measurement rows".to_string(),
        )),
        None => Ok(rows),
    }
}

fn text_cell(value: &Option<String>) -> Cell {
    Cell::from(value.clone())
}

fn load_devices(config: &PipelineConfig) -> Result<Option<DeviceReference>> {
    let path = config.reference.device_path();
    match reader::load_reference(&path)? {
        Some(table) => Ok(Some(DeviceReference::from_table(&table, &path.display().to_string())?)),
        None => Ok(None),
    }
}

fn device_cell(devices: Option<&DeviceReference>, bom_id: &str) -> Cell {
    match devices {
        Some(d) => Cell::from(d.device(bom_id)),
        None => Cell::from(NOT_FOUND),
    }
}

// ── Die attach ──────────────────────────────────────────────────────

pub fn cleaned_table(cleaned: &[CleanedRow]) -> Table {
    let mut table = Table::new([
        "bom_no", "machine_model", "optn_code", "bom_rev", "device", "package_code",
        "operation", "date_time_start", "uph", "DataPoints_Before", "DataPoints_After",
        "Method",
    ]);
    for c in cleaned {
        let r = &c.row;
        table.push_row(vec![
            Cell::from(r.bom_id.as_str()),
            text_cell(&r.machine_model),
            text_cell(&r.option_code),
            text_cell(&r.bom_revision),
            text_cell(&r.device),
            text_cell(&r.package_code),
            text_cell(&r.operation),
            r.timestamp.map_or(Cell::Empty, Cell::DateTime),
            Cell::from(r.uph),
            Cell::from(c.before),
            Cell::from(c.after),
            Cell::from(c.method.to_string()),
        ]);
    }
    table
}

pub fn group_average_table(groups: &[GroupResult], devices: Option<&DeviceReference>) -> Table {
    let mut table = Table::new([
        "bom_no", "machine_model", "optn_code", "bom_rev", "device", "package_code",
        "operation", "uph", "Data_Points", "Original_Count", "Outliers_Removed", "Method",
        "Mapped_Device",
    ]);
    for g in groups {
        table.push_row(vec![
            Cell::from(g.key.bom_id.as_str()),
            text_cell(&g.key.machine_model),
            text_cell(&g.key.option_code),
            text_cell(&g.key.bom_revision),
            text_cell(&g.key.device),
            text_cell(&g.key.package_code),
            text_cell(&g.first.operation),
            Cell::from(g.mean_uph),
            Cell::from(g.data_points),
            Cell::from(g.original_count),
            Cell::from(g.outliers_removed()),
            Cell::from(g.method.to_string()),
            device_cell(devices, &g.key.bom_id),
        ]);
    }
    table
}

/// Clean and average die-attach throughput.
pub fn run_die_attach(
    ctx: &mut PipelineContext,
    sources: &[Box<dyn IngestionSource>],
    range: Option<&DateRange>,
    sink: &dyn Sink,
) -> Result<RunReport> {
    info!(run_id = %ctx.run_id, inputs = sources.len(), "die attach run started");
    let rows = read_measurements(ctx, sources, range)?;
    let cleaned = clean_groups(rows, &ctx.config);
    let groups = average_groups(cleaned.clone(), &ctx.config);
    let devices = load_devices(&ctx.config)?;

    let sheets = [
        Sheet::new("Cleaned_Data", cleaned_table(&cleaned)),
        Sheet::new("Group_Average", group_average_table(&groups, devices.as_ref())),
    ];
    let path = sink.write("die_attach", &sheets)?;

    let removed = groups.iter().map(GroupResult::outliers_removed).sum();
    info!(run_id = %ctx.run_id, groups = groups.len(), outliers_removed = removed, "die attach run finished");
    Ok(ctx.report(&path, groups.len(), removed))
}

// ── Wire bond ───────────────────────────────────────────────────────

/// Efficiency figures for one wire-bond group.
#[derive(Clone, Debug, PartialEq)]
pub struct WireBondRow {
    pub group: GroupResult,
    pub item_no: Option<String>,
    pub mat_size: Option<String>,
    pub bump_count: Option<f64>,
    pub wire_count: Option<f64>,
    pub wire_per_unit: Option<f64>,
    pub wire_per_hour: f64,
    /// Units per hour: mean UPH divided by wires per unit.
    pub efficiency: Option<f64>,
    /// Match tier label, or `none`.
    pub mapping: String,
}

/// Totals for the run-summary sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct WireBondSummary {
    pub total_groups: usize,
    pub average_efficiency: Option<f64>,
    pub outliers_removed: usize,
    pub original_points: usize,
    /// `(1 - removed / original) * 100`; zero without data.
    pub data_quality: f64,
    pub skipped_mismatch: usize,
}

/// Enrich groups from the wire reference. Groups whose wire size contradicts the reference
/// are skipped and counted.
pub fn wire_bond_rows(
    groups: Vec<GroupResult>,
    reference: &ReferenceTable,
    config: &PipelineConfig,
) -> (Vec<WireBondRow>, usize) {
    let decimals = config.rounding.efficiency;
    let mut rows = Vec::with_capacity(groups.len());
    let mut skipped = 0;
    for group in groups {
        let key = LookupKey {
            bom_id: group.key.bom_id.clone(),
            bom_revision: group.key.bom_revision.clone(),
            package_code: group.key.package_code.clone(),
            product_number: group.first.product_number.clone(),
        };
        let resolution = reference.resolve_wire(&key, group.key.option_code.as_deref());
        let mapping = resolution.method().to_string();
        let wire_per_hour = stats::round_to(group.mean_uph, decimals);
        let row = match resolution {
            WireResolution::DiameterMismatch => {
                warn!(bom = %group.key.bom_id, option = ?group.key.option_code, "wire size mismatch, group skipped");
                skipped += 1;
                continue;
            }
            WireResolution::Matched(w) => WireBondRow {
                efficiency: w
                    .wire_per_unit
                    .map(|wpu| stats::round_to(group.mean_uph / wpu, decimals)),
                wire_per_unit: w.wire_per_unit.map(|wpu| stats::round_to(wpu, decimals)),
                item_no: w.item_no,
                mat_size: w.mat_size,
                bump_count: w.bump_count,
                wire_count: w.wire_count,
                wire_per_hour,
                mapping,
                group,
            },
            WireResolution::Miss => WireBondRow {
                item_no: None,
                mat_size: None,
                bump_count: None,
                wire_count: None,
                wire_per_unit: None,
                wire_per_hour,
                efficiency: None,
                mapping,
                group,
            },
        };
        rows.push(row);
    }
    (rows, skipped)
}

pub fn summarize_wire_bond(rows: &[WireBondRow], skipped_mismatch: usize) -> WireBondSummary {
    let efficiencies: Vec<f64> = rows.iter().filter_map(|r| r.efficiency).collect();
    let outliers_removed: usize = rows.iter().map(|r| r.group.outliers_removed()).sum();
    let original_points: usize = rows.iter().map(|r| r.group.original_count).sum();
    let data_quality = if original_points > 0 {
        stats::round_to(
            (1.0 - outliers_removed as f64 / original_points as f64) * 100.0,
            2,
        )
    } else {
        0.0
    };
    WireBondSummary {
        total_groups: rows.len(),
        average_efficiency: stats::mean(&efficiencies).map(|m| stats::round_to(m, 2)),
        outliers_removed,
        original_points,
        data_quality,
        skipped_mismatch,
    }
}

pub fn wire_bond_table(rows: &[WireBondRow], devices: Option<&DeviceReference>) -> Table {
    let mut table = Table::new([
        "BOM", "Model", "Operation", "Optn_Code", "BOM_Rev", "Package_Code", "Device",
        "ITEM_NO", "MAT_SIZE", "NO_BUMP", "NO_WIRE", "Wire_Per_Unit", "Wire Per Hour", "UPH",
        "Data_Points", "Original_Count", "Outliers_Removed", "Method", "Mapping",
        "Mapped_Device",
    ]);
    for r in rows {
        let g = &r.group;
        table.push_row(vec![
            Cell::from(g.key.bom_id.as_str()),
            text_cell(&g.key.machine_model),
            text_cell(&g.first.operation),
            text_cell(&g.key.option_code),
            text_cell(&g.key.bom_revision),
            text_cell(&g.key.package_code),
            text_cell(&g.key.device),
            text_cell(&r.item_no),
            text_cell(&r.mat_size),
            Cell::from(r.bump_count),
            Cell::from(r.wire_count),
            Cell::from(r.wire_per_unit),
            Cell::from(r.wire_per_hour),
            Cell::from(r.efficiency),
            Cell::from(g.data_points),
            Cell::from(g.original_count),
            Cell::from(g.outliers_removed()),
            Cell::from(g.method.to_string()),
            Cell::from(r.mapping.as_str()),
            device_cell(devices, &g.key.bom_id),
        ]);
    }
    table
}

pub fn wire_bond_summary_table(summary: &WireBondSummary) -> Table {
    let mut table = Table::new(["Metric", "Value"]);
    let metrics: [(&str, Cell); 6] = [
        ("Total groups", Cell::from(summary.total_groups)),
        ("Average efficiency", Cell::from(summary.average_efficiency)),
        ("Outliers removed", Cell::from(summary.outliers_removed)),
        ("Original data points", Cell::from(summary.original_points)),
        ("Data quality (%)", Cell::from(summary.data_quality)),
        ("Skipped (wire size mismatch)", Cell::from(summary.skipped_mismatch)),
    ];
    for (name, value) in metrics {
        table.push_row(vec![Cell::from(name), value]);
    }
    table
}

/// Clean wire-bond throughput and compute units-per-hour efficiency from the wire reference.
///
/// The wire reference is required: a missing file fails the run with its path.
pub fn run_wire_bond(
    ctx: &mut PipelineContext,
    sources: &[Box<dyn IngestionSource>],
    range: Option<&DateRange>,
    sink: &dyn Sink,
) -> Result<RunReport> {
    info!(run_id = %ctx.run_id, inputs = sources.len(), "wire bond run started");
    let wire_path = ctx.config.reference.wire_path();
    let reference = match reader::load_reference(&wire_path)? {
        Some(table) => ReferenceTable::from_table(&table, &wire_path.display().to_string())?,
        None => {
            return Err(PipelineError::ReferenceUnavailable {
                attempted: vec![wire_path],
            })
        }
    };
    info!(rows = reference.len(), "loaded wire reference");

    let rows = read_measurements(ctx, sources, range)?;
    let groups = average_groups(clean_groups(rows, &ctx.config), &ctx.config);
    let (results, skipped) = wire_bond_rows(groups, &reference, &ctx.config);
    if results.is_empty() {
        return Err(PipelineError::EmptyResult(
            "no wire bond groups could be computed".to_string(),
        ));
    }
    let summary = summarize_wire_bond(&results, skipped);
    let mapped = results.iter().filter(|r| r.mapping != MAPPING_NONE).count();
    let devices = load_devices(&ctx.config)?;

    let sheets = [
        Sheet::new("UPH_Results", wire_bond_table(&results, devices.as_ref())),
        Sheet::new("Run_Summary", wire_bond_summary_table(&summary)),
    ];
    let path = sink.write("wire_bond", &sheets)?;

    info!(
        run_id = %ctx.run_id,
        groups = summary.total_groups,
        mapped,
        skipped,
        data_quality = summary.data_quality,
        "wire bond run finished"
    );
    Ok(ctx.report(&path, summary.total_groups, summary.outliers_removed))
}

// ── Pack type ───────────────────────────────────────────────────────

/// Latest pack type per (product, BOM) pair from pick-and-place history exports.
///
/// With no pair list every pair seen in the history is reported.
pub fn run_pack_type(
    ctx: &mut PipelineContext,
    history: &[Box<dyn IngestionSource>],
    pairs: Option<&dyn IngestionSource>,
    sink: &dyn Sink,
) -> Result<RunReport> {
    info!(run_id = %ctx.run_id, inputs = history.len(), "pack type run started");
    let rows: Vec<pack_type::PackHistoryRow> = ctx
        .for_each_source(history, |ctx, name, table| {
            ctx.diagnostics.input_rows += table.len();
            pack_type::history_from_table(&table, name)
        })?
        .into_iter()
        .flatten()
        .collect();

    let pairs = match pairs {
        Some(source) => pack_type::pairs_from_table(&source.read()?, &source.name())?,
        None => Vec::new(),
    };
    let results = pack_type::resolve_pack_types(&rows, &pairs);
    if results.is_empty() {
        return Err(PipelineError::EmptyResult(
            "no product/BOM pairs to report".to_string(),
        ));
    }
    let changed = results.iter().filter(|r| r.change.label() == "changed").count();

    let path = sink.write(
        "pack_type",
        &[Sheet::new("Pack_Type", pack_type::pack_type_table(&results))],
    )?;
    info!(run_id = %ctx.run_id, pairs = results.len(), changed, "pack type run finished");
    Ok(ctx.report(&path, results.len(), 0))
}

// ── Logview ─────────────────────────────────────────────────────────

/// Reconstruction of one log file.
#[derive(Clone, Debug)]
pub struct LogFileResult {
    /// File stem, used as the roll-up column name.
    pub name: String,
    pub events: usize,
    pub analysis: LogAnalysis,
}

fn file_label(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    Path::new(name)
        .file_stem()
        .map_or_else(|| name.to_string(), |s| s.to_string_lossy().into_owned())
}

/// Parse and reconstruct every log. Unreadable files are skipped in a batch and abort a
/// single-file run.
pub fn analyze_logs<P: AsRef<Path>>(ctx: &mut PipelineContext, paths: &[P]) -> Result<Vec<LogFileResult>> {
    if paths.is_empty() {
        return Err(PipelineError::NoInput);
    }
    let parser = LogParser::new(&ctx.config.logview.frame_prefixes)
        .map_err(|e| ConfigError::Invalid(format!("logview.frame_prefixes: {e}")))?;

    let single = paths.len() == 1;
    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let events = match parser::parse_log(path, &parser) {
            Ok(events) => events,
            Err(e) if single => return Err(PipelineError::io(path, e)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping log file");
                ctx.diagnostics
                    .skipped_files
                    .push(format!("{}: {e}", path.display()));
                continue;
            }
        };
        let analysis = logview::analyze(&events, &ctx.config.logview, &ctx.config.rounding);
        info!(
            path = %path.display(),
            events = events.len(),
            cycles = analysis.cycles.len(),
            frames = analysis.summaries.len(),
            "analyzed log"
        );
        ctx.diagnostics.input_rows += events.len();
        ctx.diagnostics.dropped_rows += analysis.dropped_cycles;
        results.push(LogFileResult {
            name: file_label(path),
            events: events.len(),
            analysis,
        });
    }
    if results.is_empty() {
        return Err(PipelineError::EmptyResult(
            "no log file could be read".to_string(),
        ));
    }
    Ok(results)
}

fn load_frame_stock(config: &PipelineConfig) -> Result<Option<FrameStockTable>> {
    let path = config.reference.frame_stock_path();
    match reader::load_reference(&path)? {
        Some(table) => Ok(Some(FrameStockTable::from_table(&table, &path.display().to_string())?)),
        None => Ok(None),
    }
}

/// Reconstruct cycles from machine logs and roll the per-frame timings up per package.
pub fn run_logview<P: AsRef<Path>>(ctx: &mut PipelineContext, paths: &[P], sink: &dyn Sink) -> Result<RunReport> {
    info!(run_id = %ctx.run_id, inputs = paths.len(), "logview run started");
    let files = analyze_logs(ctx, paths)?;

    let mut sheets = Vec::with_capacity(files.len() * 2 + 3);
    for file in &files {
        sheets.push(Sheet::new(file.name.clone(), logview::processed_table(&file.analysis)));
        sheets.push(Sheet::new(
            format!("{}_summary", file.name),
            logview::summary_table(&file.analysis.summaries),
        ));
    }

    let per_file: Vec<(String, Vec<FrameSummary>)> = files
        .iter()
        .map(|f| (f.name.clone(), f.analysis.summaries.clone()))
        .collect();
    let wide = rollup::build_wide_table(&per_file);
    let stock = load_frame_stock(&ctx.config)?;
    let timings = rollup::stock_timings(&wide, stock.as_ref(), &ctx.config.rollup);
    let packages = rollup::summarize_packages(&timings, &ctx.config.rollup);

    sheets.push(Sheet::new("Frame_Speed", rollup::wide_table(&wide)));
    sheets.push(Sheet::new("Frame_Stock", rollup::timings_table(&timings)));
    sheets.push(Sheet::new("Package_Summary", rollup::package_table(&packages)));
    let path = sink.write("logview", &sheets)?;

    let flagged = files
        .iter()
        .flat_map(|f| &f.analysis.cycles)
        .filter(|c| c.is_statistical_outlier)
        .count();
    info!(run_id = %ctx.run_id, files = files.len(), packages = packages.len(), "logview run finished");
    Ok(ctx.report(&path, packages.len(), flagged))
}

/// Output directory override helper for front ends.
pub fn with_output_dir(mut config: PipelineConfig, dir: Option<PathBuf>) -> PipelineConfig {
    if let Some(dir) = dir {
        config.output.dir = dir;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RecordSource;
    use crate::types::ReferenceRow;
    use serde_json::json;
    use std::cell::RefCell;

    /// Sink that keeps the sheets in memory.
    #[derive(Default)]
    struct MemorySink {
        written: RefCell<Vec<(String, Vec<Sheet>)>>,
    }

    impl Sink for MemorySink {
        fn write(&self, base_name: &str, sheets: &[Sheet]) -> Result<PathBuf> {
            self.written
                .borrow_mut()
                .push((base_name.to_string(), sheets.to_vec()));
            Ok(PathBuf::from(format!("{base_name}.xlsx")))
        }
    }

    fn ctx() -> PipelineContext {
        let mut config = PipelineConfig::default();
        config.reference.dir = PathBuf::from("/nonexistent/reference");
        PipelineContext::new(config)
    }

    fn records(bom: &str, values: &[f64]) -> Vec<serde_json::Value> {
        values
            .iter()
            .map(|v| json!({"bom_no": bom, "machine_model": "m1", "optn_code": "opt1", "uph": v}))
            .collect()
    }

    fn source(name: &str, records: Vec<serde_json::Value>) -> Box<dyn IngestionSource> {
        Box::new(RecordSource {
            name: name.to_string(),
            records,
        })
    }

    fn find_col(table: &Table, name: &str) -> usize {
        table.column_index(name).unwrap()
    }

    #[test]
    fn test_extract_drops_and_counts_bad_rows() {
        let table = Table::from_json_records(&[
            json!({"BOM NO": " abc1 ", "Machine Model": "XWB3100-A", "optn_code": "L/B-ROVING", "UPH": 120}),
            json!({"BOM NO": "", "Machine Model": "WB3100", "optn_code": "X", "UPH": 120}),
            json!({"BOM NO": "ABC2", "Machine Model": "WB3100", "optn_code": "X", "UPH": "n/a"}),
            json!({"BOM NO": "ABC3", "Machine Model": "WB3100", "optn_code": "X", "UPH": -1}),
        ]);
        let m = extract_measurements(&table, "input.json", &AliasConfig::default()).unwrap();
        assert_eq!(m.input_rows, 4);
        assert_eq!(m.dropped_rows, 3);
        let row = &m.rows[0];
        assert_eq!(row.bom_id, "ABC1");
        assert_eq!(row.machine_model.as_deref(), Some("WB3100"));
        assert_eq!(row.option_code.as_deref(), Some("W/B-ROV"));
    }

    #[test]
    fn test_extract_reports_all_missing_columns() {
        let table = Table::from_json_records(&[json!({"foo": 1})]);
        let err = extract_measurements(&table, "bad.csv", &AliasConfig::default()).unwrap_err();
        match err {
            PipelineError::Schema { missing, .. } => {
                assert_eq!(missing, vec!["uph", "machine_model", "bom_no"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_dates_are_dropped() {
        let table = Table::from_json_records(&[
            json!({"bom_no": "A", "machine_model": "M", "uph": 1, "date_time_start": "2024-01-05"}),
            json!({"bom_no": "A", "machine_model": "M", "uph": 1, "date_time_start": "garbage"}),
        ]);
        let m = extract_measurements(&table, "t", &AliasConfig::default()).unwrap();
        assert_eq!(m.rows.len(), 1);
        assert_eq!(m.dropped_rows, 1);
    }

    #[test]
    fn test_date_range_filter() {
        let mut a = MeasurementRow::new("A", 1.0);
        a.timestamp = parse_datetime("2024-01-05 10:00:00");
        let mut b = MeasurementRow::new("A", 2.0);
        b.timestamp = parse_datetime("2024-02-05");
        let range = DateRange::parse("2024/01/01", "2024-01-05").unwrap();

        let kept = filter_date_range(vec![a.clone(), b.clone()], &range).unwrap();
        assert_eq!(kept, vec![a]);

        let empty = DateRange::parse("2023-01-01", "2023-01-02").unwrap();
        assert!(matches!(
            filter_date_range(vec![b], &empty),
            Err(PipelineError::EmptyDateRange { .. })
        ));
        assert!(DateRange::parse("soon", "2024-01-01").is_err());
        assert_eq!(DateRange::from_bounds(None, None).unwrap(), None);
        assert!(DateRange::from_bounds(Some("2024-01-01"), None).is_err());
    }

    #[test]
    fn test_preview_dates() {
        let table = Table::from_json_records(&[
            json!({"uph": 1, "Start Date": "2024-03-02"}),
            json!({"uph": 1, "Start Date": "2024-01-09 08:00:00"}),
            json!({"uph": 1, "Start Date": "?"}),
        ]);
        let preview = preview_dates(&table).unwrap();
        assert_eq!(preview.min_date, NaiveDate::from_ymd_opt(2024, 1, 9).unwrap());
        assert_eq!(preview.max_date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(preview.valid_records, 2);
        assert_eq!(preview.total_records, 3);

        let no_dates = Table::from_json_records(&[json!({"uph": 1})]);
        assert_eq!(preview_dates(&no_dates), None);
    }

    #[test]
    fn test_die_attach_trims_and_averages() {
        let mut values = vec![100.0; 20];
        values.push(10_000.0);
        let sources = vec![source("a.json", records("ABC1", &values[..10])), source("b.json", records("ABC1", &values[10..]))];
        let sink = MemorySink::default();
        let mut ctx = ctx();

        let report = run_die_attach(&mut ctx, &sources, None, &sink).unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.outliers_removed, 1);
        assert_eq!(report.input_rows, 21);

        let written = sink.written.borrow();
        let (base, sheets) = &written[0];
        assert_eq!(base, "die_attach");
        let avg = &sheets[1].table;
        assert_eq!(avg.cell(0, find_col(avg, "uph")).as_f64(), Some(100.0));
        assert_eq!(avg.cell(0, find_col(avg, "Outliers_Removed")).as_f64(), Some(1.0));
        assert_eq!(avg.cell(0, find_col(avg, "Original_Count")).as_f64(), Some(21.0));
        assert_eq!(avg.cell(0, find_col(avg, "Mapped_Device")).as_text().as_deref(), Some(NOT_FOUND));
    }

    #[test]
    fn test_small_groups_bypass_trimming() {
        let sink = MemorySink::default();
        let sources = vec![source("a.json", records("X", &[1.0, 2.0, 1000.0]))];
        let report = run_die_attach(&mut ctx(), &sources, None, &sink).unwrap();
        assert_eq!(report.outliers_removed, 0);
        let written = sink.written.borrow();
        let avg = &written[0].1[1].table;
        assert_eq!(avg.cell(0, find_col(avg, "uph")).as_f64(), Some(334.333));
        assert_eq!(
            avg.cell(0, find_col(avg, "Method")).as_text().as_deref(),
            Some("insufficient data")
        );
    }

    #[test]
    fn test_batch_skips_bad_input_but_single_aborts() {
        let sink = MemorySink::default();
        let bad = || source("bad.json", vec![json!({"foo": 1})]);

        let mut batch_ctx = ctx();
        let sources = vec![bad(), source("good.json", records("A", &[5.0]))];
        let report = run_die_attach(&mut batch_ctx, &sources, None, &sink).unwrap();
        assert_eq!(report.skipped_files.len(), 1);
        assert!(report.skipped_files[0].starts_with("bad.json"));

        assert!(matches!(
            run_die_attach(&mut ctx(), &[bad()], None, &sink),
            Err(PipelineError::Schema { .. })
        ));
        assert!(matches!(
            run_die_attach(&mut ctx(), &[], None, &sink),
            Err(PipelineError::NoInput)
        ));
    }

    fn group(bom: &str, option: &str, mean: f64) -> GroupResult {
        let mut row = MeasurementRow::new(bom, mean);
        row.option_code = Some(option.to_string());
        GroupResult {
            key: row.group_key(),
            first: row,
            mean_uph: mean,
            data_points: 18,
            original_count: 20,
            method: OutlierMethod::ZScore { iteration: 1 },
        }
    }

    fn wire_row(bom: &str, mat: &str, item: &str) -> ReferenceRow {
        ReferenceRow {
            bom_id: bom.to_string(),
            item_no: Some(item.to_string()),
            mat_size: Some(mat.to_string()),
            bump_count: Some(4.0),
            wire_count: Some(10.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_wire_bond_rows_and_summary() {
        let reference = ReferenceTable::new(vec![
            wire_row("A", "1.0MIL", "WG-1"),
            wire_row("B", "2.0MIL", "WG-2"),
        ]);
        let groups = vec![
            group("A", "W/B-1.0", 1200.0),
            group("B", "W/B-0.8", 1200.0),
            group("C", "W/B", 900.0),
        ];
        let (rows, skipped) = wire_bond_rows(groups, &reference, &PipelineConfig::default());
        assert_eq!(skipped, 1);
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].wire_per_unit, Some(12.0));
        assert_eq!(rows[0].efficiency, Some(100.0));
        assert_eq!(rows[0].wire_per_hour, 1200.0);
        assert_eq!(rows[0].mapping, "bom");

        assert_eq!(rows[1].efficiency, None);
        assert_eq!(rows[1].mapping, MAPPING_NONE);

        let summary = summarize_wire_bond(&rows, skipped);
        assert_eq!(summary.total_groups, 2);
        assert_eq!(summary.average_efficiency, Some(100.0));
        assert_eq!(summary.outliers_removed, 4);
        assert_eq!(summary.original_points, 40);
        assert_eq!(summary.data_quality, 90.0);
    }

    #[test]
    fn test_wire_bond_requires_reference() {
        let sink = MemorySink::default();
        let sources = vec![source("a.json", records("A", &[1.0]))];
        match run_wire_bond(&mut ctx(), &sources, None, &sink) {
            Err(PipelineError::ReferenceUnavailable { attempted }) => {
                assert!(attempted[0].ends_with("Book6_Wire Data.xlsx"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_pack_type_run() {
        let history = vec![source(
            "pnp.json",
            vec![
                json!({"start_date": "2024-01-01", "product_no": "P1", "bom_no": "B1", "assy_pack_type": "TRAY"}),
                json!({"start_date": "2024-02-01", "product_no": "P1", "bom_no": "B1", "assy_pack_type": "REEL"}),
            ],
        )];
        let pairs = RecordSource {
            name: "pairs".to_string(),
            records: vec![json!({"product_no": "p1", "bom_no": "b1"})],
        };
        let sink = MemorySink::default();
        let report = run_pack_type(&mut ctx(), &history, Some(&pairs), &sink).unwrap();
        assert_eq!(report.groups, 1);
        let written = sink.written.borrow();
        let table = &written[0].1[0].table;
        assert_eq!(table.cell(0, 2).as_text().as_deref(), Some("REEL"));
        assert_eq!(table.cell(0, 5).as_text().as_deref(), Some("TRAY to REEL"));
    }

    #[test]
    fn test_file_label_strips_gz() {
        assert_eq!(file_label(Path::new("/logs/M01.txt.gz")), "M01");
        assert_eq!(file_label(Path::new("M02.log")), "M02");
    }

    #[test]
    fn test_analyze_logs_skips_missing_in_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "2024/03/05 10:00:00\tPRO\tFA0001,G,1\n").unwrap();
        let missing = dir.path().join("missing.txt");

        let mut c = ctx();
        let files = analyze_logs(&mut c, &[good.clone(), missing.clone()]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(c.diagnostics.skipped_files.len(), 1);

        assert!(matches!(
            analyze_logs(&mut ctx(), &[missing]),
            Err(PipelineError::Io { .. })
        ));
        let empty: [PathBuf; 0] = [];
        assert!(matches!(analyze_logs(&mut ctx(), &empty), Err(PipelineError::NoInput)));
    }
}
