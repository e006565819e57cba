//! Latest pick-and-place pack type per (product, BOM) pair, with change history.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;

use crate::error::Result;
use crate::lookup::{detect_change, normalize_tracked_value, ChangeStatus};
use crate::normalize::{self, SemanticField as F};
use crate::table::{Cell, Table};

/// Display renames applied to the reported pack type.
const PACK_TYPE_RENAMES: &[(&str, &str)] = &[("FILM-FRAME", "FILM FRAME")];

/// One row of the pack-type history.
#[derive(Clone, Debug, PartialEq)]
pub struct PackHistoryRow {
    pub start: Option<NaiveDateTime>,
    pub product_no: Option<String>,
    pub bom_no: Option<String>,
    pub pack_type: Option<String>,
}

/// Which key the reported pack type came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingBy {
    ProductNo,
    Bom,
    Unmapped,
}

impl MappingBy {
    pub fn label(self) -> &'static str {
        match self {
            MappingBy::ProductNo => "product_no",
            MappingBy::Bom => "bom",
            MappingBy::Unmapped => "",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PackTypeResult {
    pub product_no: String,
    pub bom_no: String,
    pub pack_type: Option<String>,
    pub mapping_by: MappingBy,
    pub change: ChangeStatus,
    pub last_change_date: Option<NaiveDateTime>,
}

fn key(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty())
}

pub fn history_from_table(table: &Table, source_name: &str) -> Result<Vec<PackHistoryRow>> {
    let table = normalize::normalize_columns(table.clone());
    let mapping = normalize::pack_history_schema().resolve(&table, source_name)?;
    Ok((0..table.len())
        .map(|i| PackHistoryRow {
            start: mapping
                .cell(&table, i, F::Timestamp)
                .and_then(Cell::as_datetime),
            product_no: key(mapping.text(&table, i, F::ProductNumber)),
            bom_no: key(mapping.text(&table, i, F::BomId)),
            pack_type: normalize_tracked_value(mapping.text(&table, i, F::PackType).as_deref()),
        })
        .collect())
}

/// Input pairs in file order; rows missing either key are skipped.
pub fn pairs_from_table(table: &Table, source_name: &str) -> Result<Vec<(String, String)>> {
    let table = normalize::normalize_columns(table.clone());
    let mapping = normalize::pack_pairs_schema().resolve(&table, source_name)?;
    Ok((0..table.len())
        .filter_map(|i| {
            let product = key(mapping.text(&table, i, F::ProductNumber))?;
            let bom = key(mapping.text(&table, i, F::BomId))?;
            Some((product, bom))
        })
        .collect())
}

/// History of one key, in time order (undated rows last).
struct KeyHistory<'a> {
    rows: Vec<&'a PackHistoryRow>,
}

impl KeyHistory<'_> {
    fn latest(&self) -> Option<&PackHistoryRow> {
        self.rows.last().copied()
    }

    fn change(&self) -> ChangeStatus {
        detect_change(
            self.rows
                .iter()
                .map(|r| (r.start, r.pack_type.clone()))
                .collect(),
        )
    }
}

fn index_by<'a>(
    history: &'a [PackHistoryRow],
    field: impl Fn(&PackHistoryRow) -> Option<&String>,
) -> HashMap<String, KeyHistory<'a>> {
    let mut index: HashMap<String, KeyHistory<'a>> = HashMap::new();
    for row in history {
        if let Some(k) = field(row) {
            index
                .entry(k.clone())
                .or_insert_with(|| KeyHistory { rows: Vec::new() })
                .rows
                .push(row);
        }
    }
    for entry in index.values_mut() {
        entry.rows.sort_by_key(|r| (r.start.is_none(), r.start));
    }
    index
}

/// Resolve the latest pack type for each pair: by product number first, then by BOM. The
/// change status comes from the same key. With no pairs, every pair seen in the history is
/// reported in sorted order.
pub fn resolve_pack_types(history: &[PackHistoryRow], pairs: &[(String, String)]) -> Vec<PackTypeResult> {
    let by_product = index_by(history, |r| r.product_no.as_ref());
    let by_bom = index_by(history, |r| r.bom_no.as_ref());

    let pairs: Vec<(String, String)> = if pairs.is_empty() {
        history
            .iter()
            .filter_map(|r| Some((r.product_no.clone()?, r.bom_no.clone()?)))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        pairs.to_vec()
    };

    pairs
        .into_iter()
        .map(|(product_no, bom_no)| {
            let tiers = [
                (MappingBy::ProductNo, by_product.get(&product_no)),
                (MappingBy::Bom, by_bom.get(&bom_no)),
            ];
            let found = tiers.into_iter().find_map(|(by, hist)| {
                let hist = hist?;
                let latest = hist.latest()?;
                latest.pack_type.as_ref()?;
                Some((by, hist, latest))
            });
            match found {
                Some((mapping_by, hist, latest)) => PackTypeResult {
                    product_no,
                    bom_no,
                    pack_type: latest.pack_type.as_deref().map(display_pack_type),
                    mapping_by,
                    change: hist.change(),
                    last_change_date: latest.start,
                },
                None => PackTypeResult {
                    product_no,
                    bom_no,
                    pack_type: None,
                    mapping_by: MappingBy::Unmapped,
                    change: ChangeStatus::NoChange,
                    last_change_date: None,
                },
            }
        })
        .collect()
}

fn display_pack_type(raw: &str) -> String {
    PACK_TYPE_RENAMES
        .iter()
        .find(|(from, _)| *from == raw)
        .map_or_else(|| raw.to_string(), |(_, to)| to.to_string())
}

pub fn pack_type_table(results: &[PackTypeResult]) -> Table {
    let mut table = Table::new([
        "product_no", "bom_no", "assy_pack_type", "Mapping by", "Change pack", "Detail",
        "Last change date",
    ]);
    for r in results {
        table.push_row(vec![
            Cell::from(r.product_no.as_str()),
            Cell::from(r.bom_no.as_str()),
            Cell::from(r.pack_type.clone()),
            Cell::from(r.mapping_by.label()),
            Cell::from(r.change.label()),
            Cell::from(r.change.detail()),
            r.last_change_date.map_or(Cell::Empty, Cell::DateTime),
        ]);
    }
    table
}
