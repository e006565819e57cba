//! Column-name canonicalization, semantic column resolution and value normalization.
//!
//! Every input table is run through a [`Schema`] once: the schema maps each semantic field to
//! an ordered alias list, resolves the fields against the table's columns and reports all
//! missing required fields together before any downstream stage touches the data.

use std::collections::HashMap;

use crate::config::AliasConfig;
use crate::error::{PipelineError, Result};
use crate::table::{Cell, Table};

/// Canonical column name: trimmed, lowercase, separators collapsed to `_`.
pub fn canonical_column_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '/' | '\n' | '\r' | '\t' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Canonical name with the underscores removed, used for exact alias comparison so that
/// `BOM NO`, `bom_no` and `BomNo` all compare equal.
fn squash(raw: &str) -> String {
    canonical_column_name(raw).replace('_', "")
}

/// Rename every column of `table` to its canonical form.
pub fn normalize_columns(mut table: Table) -> Table {
    table.columns = table
        .columns
        .iter()
        .map(|c| canonical_column_name(c))
        .collect();
    table
}

/// Resolve a column from acceptable aliases.
///
/// Exact (case- and separator-insensitive) matches across all candidates win first; only
/// then is a substring match attempted across all columns, in column order.
pub fn resolve_column(columns: &[String], candidates: &[&str]) -> Option<usize> {
    resolve_with(columns, candidates, true)
}

fn resolve_with(columns: &[String], candidates: &[&str], substring: bool) -> Option<usize> {
    let squashed: Vec<String> = columns.iter().map(|c| squash(c)).collect();
    for cand in candidates {
        let cand = squash(cand);
        if let Some(idx) = squashed.iter().position(|c| *c == cand) {
            return Some(idx);
        }
    }
    if !substring {
        return None;
    }
    let lowered: Vec<String> = candidates
        .iter()
        .map(|c| canonical_column_name(c))
        .filter(|c| !c.is_empty())
        .collect();
    columns.iter().position(|col| {
        let col = canonical_column_name(col);
        lowered.iter().any(|cand| col.contains(cand.as_str()))
    })
}

/// Semantic fields understood by the pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SemanticField {
    BomId,
    MachineModel,
    OptionCode,
    Uph,
    Timestamp,
    Operation,
    Device,
    PackageCode,
    BomRevision,
    ProductNumber,
    CustCode,
    ItemNo,
    MatSize,
    BumpCount,
    WireCount,
    WireCountSecondary,
    PackType,
    FrameStock,
    PackageSize,
    PackageGroup,
    FrameType,
    UnitsPerStrip,
}

impl SemanticField {
    pub fn name(self) -> &'static str {
        match self {
            SemanticField::BomId => "bom_no",
            SemanticField::MachineModel => "machine_model",
            SemanticField::OptionCode => "optn_code",
            SemanticField::Uph => "uph",
            SemanticField::Timestamp => "date",
            SemanticField::Operation => "operation",
            SemanticField::Device => "device",
            SemanticField::PackageCode => "package_code",
            SemanticField::BomRevision => "bom_rev",
            SemanticField::ProductNumber => "product_no",
            SemanticField::CustCode => "cust_code",
            SemanticField::ItemNo => "item_no",
            SemanticField::MatSize => "mat_size",
            SemanticField::BumpCount => "no_bump",
            SemanticField::WireCount => "number_required",
            SemanticField::WireCountSecondary => "wire_count_secondary",
            SemanticField::PackType => "assy_pack_type",
            SemanticField::FrameStock => "frame_stock",
            SemanticField::PackageSize => "package_size",
            SemanticField::PackageGroup => "package_group",
            SemanticField::FrameType => "frame_type",
            SemanticField::UnitsPerStrip => "unit_strip",
        }
    }
}

/// One row of a schema-mapping table.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub field: SemanticField,
    pub aliases: &'static [&'static str],
    pub required: bool,
    /// Allow the substring fallback. Off for fields whose aliases are prefixes of other
    /// columns (`wire_count` vs `wire_count_secondary`).
    pub substring: bool,
}

impl FieldSpec {
    const fn required(field: SemanticField, aliases: &'static [&'static str]) -> Self {
        Self {
            field,
            aliases,
            required: true,
            substring: true,
        }
    }

    const fn optional(field: SemanticField, aliases: &'static [&'static str]) -> Self {
        Self {
            field,
            aliases,
            required: false,
            substring: true,
        }
    }

    const fn exact(mut self) -> Self {
        self.substring = false;
        self
    }
}

/// Declarative mapping from semantic fields to acceptable raw column names.
#[derive(Clone, Debug)]
pub struct Schema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

/// Result of resolving a [`Schema`] against one table.
#[derive(Clone, Debug, Default)]
pub struct ColumnMapping {
    indices: HashMap<SemanticField, usize>,
}

impl ColumnMapping {
    pub fn index(&self, field: SemanticField) -> Option<usize> {
        self.indices.get(&field).copied()
    }

    pub fn has(&self, field: SemanticField) -> bool {
        self.indices.contains_key(&field)
    }

    pub fn cell<'a>(&self, table: &'a Table, row: usize, field: SemanticField) -> Option<&'a Cell> {
        self.index(field).map(|col| table.cell(row, col))
    }

    pub fn text(&self, table: &Table, row: usize, field: SemanticField) -> Option<String> {
        self.cell(table, row, field).and_then(Cell::as_text)
    }

    pub fn number(&self, table: &Table, row: usize, field: SemanticField) -> Option<f64> {
        self.cell(table, row, field).and_then(Cell::as_f64)
    }
}

impl Schema {
    /// Resolve every field; fail with the full list of missing required fields.
    pub fn resolve(&self, table: &Table, source_name: &str) -> Result<ColumnMapping> {
        let mut mapping = ColumnMapping::default();
        let mut missing = Vec::new();
        for spec in &self.fields {
            match resolve_with(&table.columns, spec.aliases, spec.substring) {
                Some(idx) => {
                    mapping.indices.insert(spec.field, idx);
                }
                None if spec.required => missing.push(spec.field.name().to_string()),
                None => {}
            }
        }
        if !missing.is_empty() {
            return Err(PipelineError::Schema {
                source_name: source_name.to_string(),
                missing,
                available: table.columns.clone(),
            });
        }
        Ok(mapping)
    }
}

/// Throughput exports (die attach, wire bond, API records).
pub fn measurement_schema() -> Schema {
    use SemanticField::*;
    Schema {
        name: "measurement",
        fields: vec![
            FieldSpec::required(Uph, &["uph"]).exact(),
            FieldSpec::required(MachineModel, &["machine_model", "machine model", "model"]),
            FieldSpec::required(BomId, &["bom_no", "bom no", "bomno", "bom"]).exact(),
            FieldSpec::optional(OptionCode, &["optn_code", "option_code", "optn"]),
            FieldSpec::optional(Timestamp, &["date_time_start", "start_date", "date", "time"]),
            FieldSpec::optional(Operation, &["operation"]).exact(),
            FieldSpec::optional(Device, &["device", "product_no", "product_number"]).exact(),
            FieldSpec::optional(PackageCode, &["package_code", "pkg_code"]).exact(),
            FieldSpec::optional(BomRevision, &["bom_rev", "bom_revision", "rev"]).exact(),
            FieldSpec::optional(ProductNumber, &["product_number", "product_no"]).exact(),
        ],
    }
}

/// Wire/bump count reference table.
pub fn wire_reference_schema() -> Schema {
    use SemanticField::*;
    Schema {
        name: "wire reference",
        fields: vec![
            FieldSpec::required(BomId, &["bom_no", "bomno", "bom"]).exact(),
            FieldSpec::optional(BomRevision, &["bom_rev", "bom_revision"]).exact(),
            FieldSpec::optional(PackageCode, &["package_code"]).exact(),
            FieldSpec::optional(ProductNumber, &["product_number", "product_no"]).exact(),
            FieldSpec::optional(ItemNo, &["item_no", "itemno"]).exact(),
            FieldSpec::optional(MatSize, &["mat_size", "matsize"]).exact(),
            FieldSpec::optional(BumpCount, &["no_bump", "nobump", "#of_bump1", "of_bump1"])
                .exact(),
            FieldSpec::optional(
                WireCount,
                &["number_required", "numberrequired", "#of_wire1", "of_wire1", "wire_count"],
            )
            .exact(),
            FieldSpec::optional(
                WireCountSecondary,
                &["#of_wire2", "of_wire2", "wire_count_secondary", "wire2_count"],
            )
            .exact(),
        ],
    }
}

/// Device/package cross-reference (`Part bom pkg`).
pub fn device_reference_schema() -> Schema {
    use SemanticField::*;
    Schema {
        name: "device reference",
        fields: vec![
            FieldSpec::required(BomId, &["bom_no", "bom"]).exact(),
            FieldSpec::required(PackageCode, &["package_code"]).exact(),
            FieldSpec::required(CustCode, &["cust_code"]).exact(),
            FieldSpec::required(ProductNumber, &["product_number", "product_no"]).exact(),
            FieldSpec::optional(BomRevision, &["bom_rev", "bom_revision"]).exact(),
        ],
    }
}

/// Pick-and-place pack-type history exports.
pub fn pack_history_schema() -> Schema {
    use SemanticField::*;
    Schema {
        name: "pack type history",
        fields: vec![
            FieldSpec::required(
                Timestamp,
                &["start_date", "startdate", "date", "start", "start_time", "start_datetime"],
            ),
            FieldSpec::required(ProductNumber, &["product_no", "product", "product_number"]),
            FieldSpec::required(BomId, &["bom_no", "bom"]),
            FieldSpec::required(
                PackType,
                &["assy_pack_type", "assy", "pack_type", "assy_pack", "assytype"],
            ),
            FieldSpec::optional(CustCode, &["cust_code"]).exact(),
            FieldSpec::optional(PackageCode, &["package_code"]).exact(),
        ],
    }
}

/// Input pairs for the pack-type lookup.
pub fn pack_pairs_schema() -> Schema {
    use SemanticField::*;
    Schema {
        name: "pack type pairs",
        fields: vec![
            FieldSpec::required(ProductNumber, &["product_no", "product", "product_number"]),
            FieldSpec::required(BomId, &["bom_no", "bom"]),
        ],
    }
}

/// Frame stock to package cross-reference used by the log roll-up.
pub fn frame_stock_schema() -> Schema {
    use SemanticField::*;
    Schema {
        name: "frame stock reference",
        fields: vec![
            FieldSpec::required(FrameStock, &["frame_stock"]).exact(),
            FieldSpec::optional(PackageCode, &["package_code"]).exact(),
            FieldSpec::optional(PackageSize, &["package_size"]).exact(),
            FieldSpec::optional(PackageGroup, &["package_group"]).exact(),
            FieldSpec::optional(FrameType, &["frame_type"]).exact(),
            FieldSpec::optional(UnitsPerStrip, &["unit_strip", "units_per_strip"]).exact(),
        ],
    }
}

// ── Value normalization ─────────────────────────────────────────────

/// BOM ids compare trimmed and uppercase.
pub fn normalize_bom(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Collapse machine model variants onto their family token.
pub fn normalize_machine_model(raw: &str, aliases: &AliasConfig) -> String {
    let model = raw.trim().to_uppercase();
    aliases
        .machine_families
        .iter()
        .find(|family| model.contains(family.as_str()))
        .cloned()
        .unwrap_or(model)
}

/// Map option codes through the alias table: a value contained in an alias key maps to that
/// key's target, then a key contained in the value does.
pub fn normalize_option_code(raw: &str, aliases: &AliasConfig) -> String {
    let code = raw.trim().to_uppercase();
    if code.is_empty() {
        return code;
    }
    if let Some(target) = aliases
        .option_codes
        .iter()
        .find(|(key, _)| key.contains(code.as_str()))
        .map(|(_, v)| v)
    {
        return target.clone();
    }
    aliases
        .option_codes
        .iter()
        .find(|(key, _)| code.contains(key.as_str()))
        .map_or(code, |(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_canonical_column_name() {
        assert_eq!(canonical_column_name("  Machine Model "), "machine_model");
        assert_eq!(canonical_column_name("Unit/strip"), "unit_strip");
        assert_eq!(canonical_column_name("Package\nCode"), "package_code");
        assert_eq!(canonical_column_name("BOM-NO"), "bom_no");
    }

    #[test]
    fn test_resolve_exact_before_substring() {
        // "bom_rev" contains "bom", but the exact "BOM NO" match wins.
        let columns = cols(&["bom_rev", "BOM NO", "uph"]);
        assert_eq!(resolve_column(&columns, &["bom_no", "bom"]), Some(1));
    }

    #[test]
    fn test_resolve_candidate_order_for_exact() {
        let columns = cols(&["product", "product_no"]);
        assert_eq!(resolve_column(&columns, &["product_no", "product"]), Some(1));
    }

    #[test]
    fn test_resolve_substring_fallback_first_column_wins() {
        let columns = cols(&["lot", "start_date_local", "end_date"]);
        assert_eq!(resolve_column(&columns, &["date"]), Some(1));
        assert_eq!(resolve_column(&columns, &["missing"]), None);
    }

    #[test]
    fn test_schema_reports_all_missing_fields() {
        let table = Table::new(["Operation", "date"]);
        let err = measurement_schema().resolve(&table, "upload.csv").unwrap_err();
        match err {
            PipelineError::Schema { missing, .. } => {
                assert_eq!(missing, vec!["uph", "machine_model", "bom_no"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_exact_only_field_skips_substring() {
        let table = Table::new(["bom_no", "#of Wire2"]);
        let mapping = wire_reference_schema().resolve(&normalize_columns(table), "wire").unwrap();
        assert_eq!(mapping.index(SemanticField::WireCountSecondary), Some(1));
        assert_eq!(mapping.index(SemanticField::WireCount), None);
    }

    #[test]
    fn test_machine_model_family() {
        let aliases = AliasConfig::default();
        assert_eq!(normalize_machine_model(" wb3100-plus ", &aliases), "WB3100");
        assert_eq!(normalize_machine_model("ad838", &aliases), "AD838");
    }

    #[test]
    fn test_option_code_aliases() {
        let aliases = AliasConfig::default();
        assert_eq!(normalize_option_code("l/b-rov-cu", &aliases), "W/B-ROV-CU");
        assert_eq!(normalize_option_code("L/B-ROVING 2.0MIL", &aliases), "W/B-ROV");
        assert_eq!(normalize_option_code("OPT1", &aliases), "OPT1");
        assert_eq!(normalize_option_code("", &aliases), "");
    }
}
