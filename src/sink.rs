//! Report sinks.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::table::{Cell, Sheet};

/// Excel's sheet-name length limit.
const MAX_SHEET_NAME: usize = 31;

/// Persists named tables and returns where they went.
pub trait Sink {
    fn write(&self, base_name: &str, sheets: &[Sheet]) -> Result<PathBuf>;
}

/// Writes one `.xlsx` workbook per call, one worksheet per sheet.
///
/// File names are `{base}_{YYYYmmdd_HHMMSS}_{run}.xlsx` so concurrent runs never collide.
#[derive(Clone, Debug)]
pub struct XlsxSink {
    dir: PathBuf,
    run_id: String,
}

impl XlsxSink {
    pub fn new(dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            run_id: run_id.into(),
        }
    }

    fn target_path(&self, base_name: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let short_id: String = self.run_id.chars().filter(|c| *c != '-').take(8).collect();
        self.dir
            .join(format!("{}_{stamp}_{short_id}.xlsx", file_stem(base_name)))
    }
}

impl Sink for XlsxSink {
    fn write(&self, base_name: &str, sheets: &[Sheet]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| PipelineError::io(&self.dir, e))?;
        let path = self.target_path(base_name);

        let mut workbook = Workbook::new();
        let header = Format::new().set_bold();
        let mut used = HashSet::new();
        for sheet in sheets {
            let name = unique_sheet_name(&sheet.name, &mut used);
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(&name)?;
            write_sheet(worksheet, sheet, &header)?;
        }
        workbook.save(&path)?;

        info!(path = %path.display(), sheets = sheets.len(), "wrote report");
        Ok(path)
    }
}

fn write_sheet(worksheet: &mut Worksheet, sheet: &Sheet, header: &Format) -> std::result::Result<(), XlsxError> {
    for (col, name) in sheet.table.columns.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, name, header)?;
    }
    for (r, row) in sheet.table.rows.iter().enumerate() {
        let r = r as u32 + 1;
        for (c, cell) in row.iter().enumerate() {
            let c = c as u16;
            match cell {
                Cell::Empty => {}
                Cell::Text(s) => {
                    worksheet.write_string(r, c, s)?;
                }
                Cell::Number(n) if n.is_finite() => {
                    worksheet.write_number(r, c, *n)?;
                }
                Cell::Number(_) => {}
                Cell::Bool(b) => {
                    worksheet.write_boolean(r, c, *b)?;
                }
                Cell::DateTime(dt) => {
                    worksheet.write_string(r, c, dt.format("%Y-%m-%d %H:%M:%S").to_string())?;
                }
            }
        }
    }
    Ok(())
}

/// Strip characters Excel rejects, cap the length and de-duplicate within one workbook.
fn unique_sheet_name(raw: &str, used: &mut HashSet<String>) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .collect();
    let cleaned = if cleaned.trim().is_empty() {
        "Sheet".to_string()
    } else {
        cleaned
    };
    let base: String = cleaned.chars().take(MAX_SHEET_NAME).collect();

    let mut name = base.clone();
    let mut n = 2;
    while !used.insert(name.to_lowercase()) {
        let suffix = format!("_{n}");
        let keep = MAX_SHEET_NAME.saturating_sub(suffix.len());
        name = format!("{}{suffix}", base.chars().take(keep).collect::<String>());
        n += 1;
    }
    name
}

fn file_stem(base_name: &str) -> String {
    let stem = Path::new(base_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "report".to_string()
    } else {
        stem
    }
}
