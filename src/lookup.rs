//! Reference lookups with ordered fallback tiers, wire enrichment and change detection.

use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::normalize::{self, SemanticField as F};
use crate::table::Table;
use crate::types::{ReferenceRow, MAPPING_NONE};

static DIAMETER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(\.\d+)?)").unwrap());

/// Key components used to match a target row against reference rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LookupKey {
    pub bom_id: String,
    pub bom_revision: Option<String>,
    pub package_code: Option<String>,
    pub product_number: Option<String>,
}

/// Match tiers, tried from the most to the least specific.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchTier {
    /// bom + revision + package + product
    Full,
    BomRevisionPackage,
    BomOnly,
}

impl MatchTier {
    pub const ORDER: [MatchTier; 3] = [
        MatchTier::Full,
        MatchTier::BomRevisionPackage,
        MatchTier::BomOnly,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MatchTier::Full => "bom+rev+package+product",
            MatchTier::BomRevisionPackage => "bom+rev+package",
            MatchTier::BomOnly => "bom",
        }
    }

    /// A tier only applies when the target carries every component it compares.
    fn matches(self, key: &LookupKey, row: &ReferenceRow) -> bool {
        if row.bom_id != key.bom_id {
            return false;
        }
        let same = |a: &Option<String>, b: &Option<String>| matches!((a, b), (Some(a), Some(b)) if a == b);
        match self {
            MatchTier::Full => {
                same(&key.bom_revision, &row.bom_revision)
                    && same(&key.package_code, &row.package_code)
                    && same(&key.product_number, &row.product_number)
            }
            MatchTier::BomRevisionPackage => {
                same(&key.bom_revision, &row.bom_revision)
                    && same(&key.package_code, &row.package_code)
            }
            MatchTier::BomOnly => true,
        }
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reference rows matched by one tier.
#[derive(Debug)]
pub struct TierMatch<'a> {
    pub tier: MatchTier,
    pub rows: Vec<&'a ReferenceRow>,
}

/// Immutable wire/bump reference table, loaded once per run.
#[derive(Clone, Debug, Default)]
pub struct ReferenceTable {
    rows: Vec<ReferenceRow>,
}

fn key_text(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty())
}

impl ReferenceTable {
    pub fn new(rows: Vec<ReferenceRow>) -> Self {
        Self { rows }
    }

    /// Build from a raw reference sheet. Rows without a BOM are ignored.
    pub fn from_table(table: &Table, source_name: &str) -> Result<Self> {
        let table = normalize::normalize_columns(table.clone());
        let mapping = normalize::wire_reference_schema().resolve(&table, source_name)?;
        let mut rows = Vec::with_capacity(table.len());
        for i in 0..table.len() {
            let Some(bom) = mapping.text(&table, i, F::BomId) else {
                continue;
            };
            rows.push(ReferenceRow {
                bom_id: normalize::normalize_bom(&bom),
                bom_revision: key_text(mapping.text(&table, i, F::BomRevision)),
                package_code: key_text(mapping.text(&table, i, F::PackageCode)),
                product_number: key_text(mapping.text(&table, i, F::ProductNumber)),
                item_no: mapping.text(&table, i, F::ItemNo),
                mat_size: mapping.text(&table, i, F::MatSize),
                bump_count: mapping.number(&table, i, F::BumpCount),
                wire_count: mapping.number(&table, i, F::WireCount),
                wire_count_secondary: mapping.number(&table, i, F::WireCountSecondary),
            });
        }
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First tier with a non-empty match set.
    pub fn find(&self, key: &LookupKey) -> Option<TierMatch<'_>> {
        MatchTier::ORDER.iter().find_map(|tier| {
            let rows: Vec<&ReferenceRow> = self
                .rows
                .iter()
                .filter(|row| tier.matches(key, row))
                .collect();
            (!rows.is_empty()).then_some(TierMatch { tier: *tier, rows })
        })
    }

    /// Resolve wire attributes for a throughput group.
    pub fn resolve_wire(&self, key: &LookupKey, option_code: Option<&str>) -> WireResolution {
        let Some(found) = self.find(key) else {
            return WireResolution::Miss;
        };
        let option_diameter = option_code.and_then(wire_diameter);

        let chosen = option_diameter
            .and_then(|d| {
                found.rows.iter().copied().find(|row| {
                    row.mat_size.as_deref().and_then(wire_diameter) == Some(d)
                })
            })
            .unwrap_or(found.rows[0]);

        let row_diameter = chosen.mat_size.as_deref().and_then(wire_diameter);
        if let (Some(a), Some(b)) = (option_diameter, row_diameter) {
            if a != b {
                return WireResolution::DiameterMismatch;
            }
        }

        let is_copper = option_code.is_some_and(|o| o.to_uppercase().contains("CU"));
        if is_copper {
            let copper_item = chosen
                .item_no
                .as_deref()
                .is_some_and(|item| item.trim().to_uppercase().starts_with("WZ"));
            if !copper_item {
                return WireResolution::Miss;
            }
        }

        WireResolution::Matched(WireEnrichment::from_row(found.tier, chosen))
    }
}

/// Outcome of a wire lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum WireResolution {
    Matched(WireEnrichment),
    /// Option code and reference wire sizes disagree; the group is left out of the report.
    DiameterMismatch,
    Miss,
}

impl WireResolution {
    pub fn method(&self) -> &str {
        match self {
            WireResolution::Matched(w) => w.tier.label(),
            _ => MAPPING_NONE,
        }
    }
}

/// Wire attributes taken from one reference row.
#[derive(Clone, Debug, PartialEq)]
pub struct WireEnrichment {
    pub tier: MatchTier,
    pub item_no: Option<String>,
    pub mat_size: Option<String>,
    pub bump_count: Option<f64>,
    pub wire_count: Option<f64>,
    pub wire_per_unit: Option<f64>,
}

impl WireEnrichment {
    /// A positive secondary wire count nulls every wire-derived attribute.
    fn from_row(tier: MatchTier, row: &ReferenceRow) -> Self {
        let suppressed = row.wire_count_secondary.is_some_and(|w| w > 0.0);
        if suppressed {
            return Self {
                tier,
                item_no: row.item_no.clone(),
                mat_size: row.mat_size.clone(),
                bump_count: None,
                wire_count: None,
                wire_per_unit: None,
            };
        }
        Self {
            tier,
            item_no: row.item_no.clone(),
            mat_size: row.mat_size.clone(),
            bump_count: row.bump_count,
            wire_count: row.wire_count,
            wire_per_unit: wire_per_unit(row.bump_count, row.wire_count),
        }
    }
}

/// `bump / 2 + wires`; unavailable unless both counts are present and the result is positive.
pub fn wire_per_unit(bump_count: Option<f64>, wire_count: Option<f64>) -> Option<f64> {
    let wpu = bump_count? / 2.0 + wire_count?;
    (wpu > 0.0).then_some(wpu)
}

/// Wire diameter embedded in a size or option string, e.g. `2.0MIL` -> 2.0.
pub fn wire_diameter(text: &str) -> Option<f64> {
    DIAMETER
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

// ── Device cross-reference ──────────────────────────────────────────

/// BOM to device label (`{package}_{cust}_{product}`); the first row of each BOM wins.
#[derive(Clone, Debug, Default)]
pub struct DeviceReference {
    devices: HashMap<String, String>,
}

impl DeviceReference {
    pub fn from_table(table: &Table, source_name: &str) -> Result<Self> {
        let table = normalize::normalize_columns(table.clone());
        let mapping = normalize::device_reference_schema().resolve(&table, source_name)?;
        let mut devices = HashMap::new();
        for i in 0..table.len() {
            let Some(bom) = mapping.text(&table, i, F::BomId) else {
                continue;
            };
            let part = |field| mapping.text(&table, i, field).unwrap_or_default();
            let label = format!(
                "{}_{}_{}",
                part(F::PackageCode),
                part(F::CustCode),
                part(F::ProductNumber)
            );
            devices.entry(normalize::normalize_bom(&bom)).or_insert(label);
        }
        Ok(Self { devices })
    }

    pub fn device(&self, bom_id: &str) -> Option<&str> {
        self.devices.get(bom_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ── Change detection ────────────────────────────────────────────────

/// Whether a tracked attribute changed over time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeStatus {
    NoChange,
    /// Most recent transition between distinct values.
    Changed { from: String, to: String },
}

impl ChangeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeStatus::NoChange => "no-change",
            ChangeStatus::Changed { .. } => "changed",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ChangeStatus::NoChange => String::new(),
            ChangeStatus::Changed { from, to } => format!("{from} to {to}"),
        }
    }
}

/// Trim and uppercase; blank and null-like spellings are absent.
pub fn normalize_tracked_value(raw: Option<&str>) -> Option<String> {
    let value = raw?.trim().to_uppercase();
    match value.as_str() {
        "" | "NAN" | "NONE" | "NULL" => None,
        _ => Some(value),
    }
}

/// Report the last transition of a value history. Entries are ordered by timestamp (stable,
/// undated entries last) before scanning; absent values are ignored.
pub fn detect_change(mut history: Vec<(Option<NaiveDateTime>, Option<String>)>) -> ChangeStatus {
    history.sort_by_key(|(ts, _)| (ts.is_none(), *ts));
    let values: Vec<String> = history.into_iter().filter_map(|(_, v)| v).collect();

    let Some(last) = values.last() else {
        return ChangeStatus::NoChange;
    };
    match values.iter().rev().find(|v| *v != last) {
        Some(prev) => ChangeStatus::Changed {
            from: prev.clone(),
            to: last.clone(),
        },
        None => ChangeStatus::NoChange,
    }
}
