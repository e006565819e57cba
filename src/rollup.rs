//! Cross-file roll-up of per-frame cycle times.
//!
//! Every processed log contributes its (frame, speed) averages. These are laid out as a wide
//! table (one column per file), reduced to one trimmed mean per key, joined with the frame
//! stock reference and finally averaged per package configuration with a second IQR pass.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::RollupConfig;
use crate::error::Result;
use crate::logview::speed_label;
use crate::normalize::{self, SemanticField as F};
use crate::stats;
use crate::table::{Cell, Table};
use crate::types::{FrameSummary, NOT_FOUND};

/// (package group, speed) pairs whose frame type is implied by the speed.
const FRAME_TYPE_OVERRIDES: &[(&str, f64, &str)] = &[
    ("QFN", 5.0, "Copper"),
    ("QFN", 4.0, "Selective PPF"),
    ("QFN", 3.0, "Full PPF"),
];

/// (package group, speed) pairs that identify the singulation process.
const PROCESS_RULES: &[(&str, f64, &str)] = &[("SLP", 5.0, "Full Cut"), ("SLP", 3.0, "Step Cut")];

fn speed_key(speed: f64) -> i64 {
    (speed * 100.0).round() as i64
}

/// Row of the wide table.
#[derive(Clone, Debug, PartialEq)]
pub struct WideRow {
    pub frame_id: String,
    pub speed: f64,
    /// One entry per file, in file order.
    pub values: Vec<Option<f64>>,
}

impl WideRow {
    pub fn label(&self) -> String {
        format!("{}_speed{}", self.frame_id, speed_label(Some(self.speed)))
    }
}

/// Files × (frame, speed) table of mean seconds per strip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WideTable {
    pub files: Vec<String>,
    pub rows: Vec<WideRow>,
}

/// Combine per-file frame summaries. Summaries without a speed or an average are ignored;
/// duplicates within one file are averaged.
pub fn build_wide_table(files: &[(String, Vec<FrameSummary>)]) -> WideTable {
    let mut rows: BTreeMap<(String, i64), WideRow> = BTreeMap::new();
    for (col, (_, summaries)) in files.iter().enumerate() {
        let mut per_key: BTreeMap<(String, i64), (f64, Vec<f64>)> = BTreeMap::new();
        for s in summaries {
            let (Some(speed), Some(secs)) = (s.speed, s.seconds_per_strip) else {
                continue;
            };
            per_key
                .entry((s.frame_id.clone(), speed_key(speed)))
                .or_insert_with(|| (speed, Vec::new()))
                .1
                .push(secs);
        }
        for (key, (speed, values)) in per_key {
            let row = rows.entry(key.clone()).or_insert_with(|| WideRow {
                frame_id: key.0.clone(),
                speed,
                values: vec![None; files.len()],
            });
            row.values[col] = stats::mean(&values);
        }
    }
    WideTable {
        files: files.iter().map(|(name, _)| name.clone()).collect(),
        rows: rows.into_values().collect(),
    }
}

/// Mean after dropping values above `Q3 + factor*IQR`. Only the upper fence applies.
pub fn filtered_mean(values: &[f64], factor: f64) -> Option<f64> {
    let (_, upper) = stats::iqr_bounds(values, factor)?;
    let kept: Vec<f64> = values.iter().copied().filter(|v| *v <= upper).collect();
    stats::mean(&kept)
}

// ── Frame stock reference ───────────────────────────────────────────

/// Package attributes of one frame stock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStockRow {
    pub frame_stock: String,
    pub package_code: Option<String>,
    pub package_size: Option<String>,
    pub package_group: Option<String>,
    pub frame_type: Option<String>,
    pub units_per_strip: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct FrameStockTable {
    rows: Vec<FrameStockRow>,
}

impl FrameStockTable {
    pub fn new(rows: Vec<FrameStockRow>) -> Self {
        Self { rows }
    }

    pub fn from_table(table: &Table, source_name: &str) -> Result<Self> {
        let table = normalize::normalize_columns(table.clone());
        let mapping = normalize::frame_stock_schema().resolve(&table, source_name)?;
        let rows = (0..table.len())
            .filter_map(|i| {
                let frame_stock = mapping.text(&table, i, F::FrameStock)?;
                Some(FrameStockRow {
                    frame_stock: frame_stock.to_uppercase(),
                    package_code: mapping.text(&table, i, F::PackageCode),
                    package_size: mapping.text(&table, i, F::PackageSize),
                    package_group: mapping
                        .text(&table, i, F::PackageGroup)
                        .map(|g| g.to_uppercase()),
                    frame_type: mapping.text(&table, i, F::FrameType),
                    units_per_strip: mapping.text(&table, i, F::UnitsPerStrip),
                })
            })
            .collect();
        Ok(Self { rows })
    }

    pub fn get(&self, frame_stock: &str) -> Option<&FrameStockRow> {
        self.rows.iter().find(|r| r.frame_stock == frame_stock)
    }
}

/// Trimmed seconds per strip for one frame stock at one speed, with package attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct StockTiming {
    pub frame_stock: String,
    pub speed: f64,
    pub seconds_per_strip: Option<f64>,
    pub package_code: Option<String>,
    pub package_size: Option<String>,
    pub package_group: Option<String>,
    pub frame_type: Option<String>,
    pub units_per_strip: Option<String>,
    pub process: Option<String>,
}

fn rule_for(rules: &[(&str, f64, &'static str)], group: Option<&str>, speed: f64) -> Option<&'static str> {
    let group = group?;
    rules
        .iter()
        .find(|(g, s, _)| *g == group && speed_key(*s) == speed_key(speed))
        .map(|(_, _, v)| *v)
}

/// Reduce the wide table to one timing per (frame stock, speed).
///
/// With no reference table every package column carries the not-found marker.
pub fn stock_timings(
    wide: &WideTable,
    reference: Option<&FrameStockTable>,
    config: &RollupConfig,
) -> Vec<StockTiming> {
    let mut collapsed: BTreeMap<(String, i64), (StockTiming, Vec<f64>)> = BTreeMap::new();

    for row in &wide.rows {
        let present: Vec<f64> = row.values.iter().flatten().copied().collect();
        let seconds = filtered_mean(&present, config.iqr_factor).map(|m| stats::round_to(m, 2));
        let frame_stock: String = row.frame_id.chars().take(config.frame_stock_len).collect();

        let mut timing = StockTiming {
            frame_stock: frame_stock.clone(),
            speed: row.speed,
            seconds_per_strip: None,
            package_code: None,
            package_size: None,
            package_group: None,
            frame_type: None,
            units_per_strip: None,
            process: None,
        };
        match reference {
            Some(table) => {
                if let Some(stock) = table.get(&frame_stock.to_uppercase()) {
                    timing.package_code = stock.package_code.clone();
                    timing.package_size = stock.package_size.clone();
                    timing.package_group = stock.package_group.clone();
                    timing.frame_type = stock.frame_type.clone();
                    timing.units_per_strip = stock.units_per_strip.clone();
                }
            }
            None => timing.package_code = Some(NOT_FOUND.to_string()),
        }
        let group = timing.package_group.as_deref();
        if let Some(frame_type) = rule_for(FRAME_TYPE_OVERRIDES, group, row.speed) {
            timing.frame_type = Some(frame_type.to_string());
        }
        timing.process = rule_for(PROCESS_RULES, group, row.speed).map(str::to_string);

        let entry = collapsed
            .entry((frame_stock, speed_key(row.speed)))
            .or_insert_with(|| (timing, Vec::new()));
        entry.1.extend(seconds);
    }

    collapsed
        .into_values()
        .map(|(mut timing, values)| {
            timing.seconds_per_strip = stats::mean(&values).map(|m| stats::round_to(m, 2));
            timing
        })
        .collect()
}

/// Final per-package-configuration average.
#[derive(Clone, Debug, PartialEq)]
pub struct PackageSummary {
    pub package_size: Option<String>,
    pub package_group: Option<String>,
    pub frame_type: Option<String>,
    pub units_per_strip: Option<String>,
    pub speed: f64,
    pub process: Option<String>,
    pub frame_stocks: Vec<String>,
    pub seconds_per_strip: Option<f64>,
    pub before: usize,
    pub after: usize,
}

type PackageKey = (Option<String>, Option<String>, Option<String>, Option<String>, i64);

/// Average stock timings per (size, group, frame type, units/strip, speed).
///
/// Groups with too few values are averaged as-is. Larger groups drop values outside the Tukey
/// fences; if that would drop everything the raw mean is used.
pub fn summarize_packages(timings: &[StockTiming], config: &RollupConfig) -> Vec<PackageSummary> {
    let mut groups: BTreeMap<PackageKey, Vec<&StockTiming>> = BTreeMap::new();
    for t in timings {
        let key = (
            t.package_size.clone(),
            t.package_group.clone(),
            t.frame_type.clone(),
            t.units_per_strip.clone(),
            speed_key(t.speed),
        );
        groups.entry(key).or_default().push(t);
    }

    let summaries: Vec<PackageSummary> = groups
        .into_values()
        .map(|members| {
            let first = members[0];
            let values: Vec<f64> = members.iter().filter_map(|t| t.seconds_per_strip).collect();
            let kept: Vec<f64> = if values.len() < config.min_values_for_trim {
                values.clone()
            } else {
                match stats::iqr_bounds(&values, config.iqr_factor) {
                    Some((lo, hi)) => {
                        let inside: Vec<f64> =
                            values.iter().copied().filter(|v| *v >= lo && *v <= hi).collect();
                        if inside.is_empty() {
                            values.clone()
                        } else {
                            inside
                        }
                    }
                    None => values.clone(),
                }
            };
            PackageSummary {
                package_size: first.package_size.clone(),
                package_group: first.package_group.clone(),
                frame_type: first.frame_type.clone(),
                units_per_strip: first.units_per_strip.clone(),
                speed: first.speed,
                process: members.iter().find_map(|t| t.process.clone()),
                frame_stocks: members.iter().map(|t| t.frame_stock.clone()).collect(),
                seconds_per_strip: stats::mean(&kept).map(|m| stats::round_to(m, 2)),
                before: values.len(),
                after: kept.len(),
            }
        })
        .collect();
    debug!(
        stocks = timings.len(),
        groups = summaries.len(),
        "summarized package groups"
    );
    summaries
}

// ── Report tables ───────────────────────────────────────────────────

pub fn wide_table(wide: &WideTable) -> Table {
    let mut table = Table::new(std::iter::once("FRAME_STOCK".to_string()).chain(wide.files.iter().cloned()));
    for row in &wide.rows {
        let mut cells = vec![Cell::from(row.label())];
        cells.extend(row.values.iter().map(|v| Cell::from(*v)));
        table.push_row(cells);
    }
    table
}

pub fn timings_table(timings: &[StockTiming]) -> Table {
    let mut table = Table::new([
        "FRAME_STOCK", "SPEED (IPS)", "TIME/STRIP", "PACKAGE_CODE", "Package size",
        "Package group", "Frame type", "Unit/strip", "Process",
    ]);
    for t in timings {
        table.push_row(vec![
            Cell::from(t.frame_stock.as_str()),
            Cell::from(t.speed),
            Cell::from(t.seconds_per_strip),
            Cell::from(t.package_code.clone()),
            Cell::from(t.package_size.clone()),
            Cell::from(t.package_group.clone()),
            Cell::from(t.frame_type.clone()),
            Cell::from(t.units_per_strip.clone()),
            Cell::from(t.process.clone()),
        ]);
    }
    table
}

pub fn package_table(summaries: &[PackageSummary]) -> Table {
    let mut table = Table::new([
        "Package size", "Package group", "Frame type", "Unit/strip", "SPEED (IPS)", "Process",
        "FRAME_STOCK", "TIME/STRIP", "Before_Outlier", "After_Outlier",
    ]);
    for s in summaries {
        table.push_row(vec![
            Cell::from(s.package_size.clone()),
            Cell::from(s.package_group.clone()),
            Cell::from(s.frame_type.clone()),
            Cell::from(s.units_per_strip.clone()),
            Cell::from(s.speed),
            Cell::from(s.process.clone()),
            Cell::from(s.frame_stocks.join(", ")),
            Cell::from(s.seconds_per_strip),
            Cell::from(s.before),
            Cell::from(s.after),
        ]);
    }
    table
}
