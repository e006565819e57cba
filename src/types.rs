//! Domain records shared by the throughput and log pipelines.

#[cfg(feature = "python")]
use pyo3::prelude::*;

use chrono::NaiveDateTime;

/// Mapping method reported when no reference tier matched.
pub const MAPPING_NONE: &str = "none";

/// Marker stamped on enrichment columns when a reference table is absent.
pub const NOT_FOUND: &str = "not found";

/// Label written for cycles flagged by the machine-error scan.
pub const MC_ERROR: &str = "MC error";

/// One cleaned throughput observation.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRow {
    /// Trimmed, uppercase.
    pub bom_id: String,
    pub machine_model: Option<String>,
    pub option_code: Option<String>,
    pub uph: f64,
    pub timestamp: Option<NaiveDateTime>,
    pub operation: Option<String>,
    pub device: Option<String>,
    pub package_code: Option<String>,
    pub bom_revision: Option<String>,
    pub product_number: Option<String>,
}

impl MeasurementRow {
    pub fn new(bom_id: impl Into<String>, uph: f64) -> Self {
        Self {
            bom_id: bom_id.into(),
            machine_model: None,
            option_code: None,
            uph,
            timestamp: None,
            operation: None,
            device: None,
            package_code: None,
            bom_revision: None,
            product_number: None,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            bom_id: self.bom_id.clone(),
            machine_model: self.machine_model.clone(),
            option_code: self.option_code.clone(),
            bom_revision: self.bom_revision.clone(),
            device: self.device.clone(),
            package_code: self.package_code.clone(),
        }
    }
}

/// Throughput grouping key. Absent components form their own group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub bom_id: String,
    pub machine_model: Option<String>,
    pub option_code: Option<String>,
    pub bom_revision: Option<String>,
    pub device: Option<String>,
    pub package_code: Option<String>,
}

/// One row of the wire/bump reference table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferenceRow {
    pub bom_id: String,
    pub bom_revision: Option<String>,
    pub package_code: Option<String>,
    pub product_number: Option<String>,
    pub item_no: Option<String>,
    pub mat_size: Option<String>,
    pub bump_count: Option<f64>,
    pub wire_count: Option<f64>,
    pub wire_count_secondary: Option<f64>,
}

/// A parsed machine-log line.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    /// 1-based line number in the source file.
    pub line_no: usize,
    pub date: String,
    /// Clock time with any AM/PM marker removed.
    pub time: String,
    pub step: String,
    /// Empty when no frame pattern matched.
    pub frame_id: String,
    /// Machine group field (`G`).
    pub group: Option<String>,
    pub strip_sequence: Option<i64>,
    /// Numeric value slots after the fixed fields; unparseable slots are `None`.
    pub values: Vec<Option<f64>>,
    pub timestamp: Option<NaiveDateTime>,
}

impl LogEvent {
    /// 1-based value slot.
    pub fn value(&self, slot: usize) -> Option<f64> {
        slot.checked_sub(1)
            .and_then(|i| self.values.get(i))
            .copied()
            .flatten()
    }
}

/// A cycle-start event with everything derived for it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessCycle {
    pub event: LogEvent,
    pub raw_speed: Option<f64>,
    pub speed: Option<f64>,
    pub has_machine_error: bool,
    pub duration_seconds: Option<f64>,
    pub subgroup_id: Option<u32>,
    pub is_statistical_outlier: bool,
    pub is_subgroup_without_first_strip: bool,
}

impl ProcessCycle {
    pub fn new(event: LogEvent) -> Self {
        Self {
            event,
            raw_speed: None,
            speed: None,
            has_machine_error: false,
            duration_seconds: None,
            subgroup_id: None,
            is_statistical_outlier: false,
            is_subgroup_without_first_strip: false,
        }
    }

    /// Usable for the per-frame average.
    pub fn is_clean(&self) -> bool {
        !self.is_statistical_outlier
            && !self.is_subgroup_without_first_strip
            && !self.has_machine_error
            && self.duration_seconds.is_some()
    }
}

/// Mean clean cycle time per (frame, speed).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "python", pyclass)]
pub struct FrameSummary {
    #[cfg_attr(feature = "python", pyo3(get))]
    pub frame_id: String,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub speed: Option<f64>,
    /// Seconds per strip; unset when too few clean samples.
    #[cfg_attr(feature = "python", pyo3(get))]
    pub seconds_per_strip: Option<f64>,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub before: usize,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub after: usize,
}

/// What a pipeline run produced.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "python", pyclass)]
pub struct RunReport {
    #[cfg_attr(feature = "python", pyo3(get))]
    pub output_path: String,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub run_id: String,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub input_rows: usize,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub dropped_rows: usize,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub groups: usize,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub outliers_removed: usize,
    #[cfg_attr(feature = "python", pyo3(get))]
    pub skipped_files: Vec<String>,
}

#[cfg(feature = "python")]
#[pymethods]
impl RunReport {
    fn __repr__(&self) -> String {
        format!(
            "RunReport(output_path={:?}, groups={}, outliers_removed={})",
            self.output_path, self.groups, self.outliers_removed
        )
    }
}
