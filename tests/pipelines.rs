use std::fs;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use uph_clean::config::PipelineConfig;
use uph_clean::pipeline::{self, DateRange, PipelineContext};
use uph_clean::PipelineError;

fn context(root: &Path) -> PipelineContext {
    let mut config = PipelineConfig::default();
    config.output.dir = root.join("out");
    config.reference.dir = root.join("ref");
    PipelineContext::new(config)
}

fn column(range: &calamine::Range<Data>, name: &str) -> u32 {
    let width = range.width() as u32;
    (0..width)
        .find(|&c| range.get_value((0, c)) == Some(&Data::String(name.to_string())))
        .unwrap_or_else(|| panic!("missing column {name}"))
}

fn number(range: &calamine::Range<Data>, row: u32, name: &str) -> f64 {
    match range.get_value((row, column(range, name))) {
        Some(Data::Float(f)) => *f,
        Some(Data::Int(i)) => *i as f64,
        other => panic!("expected a number in {name}, got {other:?}"),
    }
}

fn text(range: &calamine::Range<Data>, row: u32, name: &str) -> String {
    match range.get_value((row, column(range, name))) {
        Some(Data::String(s)) => s.clone(),
        other => panic!("expected text in {name}, got {other:?}"),
    }
}

fn write_uph_csv(path: &Path, values: &[f64]) {
    let mut body = String::from("BOM NO,Machine Model,optn_code,UPH,date_time_start\n");
    for (i, v) in values.iter().enumerate() {
        body.push_str(&format!("abc1,WB3100-X,opt1,{v},2024-01-{:02}\n", i % 28 + 1));
    }
    fs::write(path, body).unwrap();
}

#[test]
fn test_die_attach_two_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.csv");
    let b = dir.path().join("b.csv");
    write_uph_csv(&a, &[100.0; 10]);
    let mut second = vec![100.0; 10];
    second.push(10_000.0);
    write_uph_csv(&b, &second);

    let mut ctx = context(dir.path());
    let sink = ctx.xlsx_sink();
    let report =
        pipeline::run_die_attach(&mut ctx, &pipeline::file_sources(&[a, b]), None, &sink).unwrap();

    assert_eq!(report.groups, 1);
    assert_eq!(report.outliers_removed, 1);
    assert_eq!(report.input_rows, 21);
    assert_eq!(report.dropped_rows, 0);

    let mut workbook = open_workbook_auto(&report.output_path).unwrap();
    let avg = workbook.worksheet_range("Group_Average").unwrap();
    assert_eq!(text(&avg, 1, "bom_no"), "ABC1");
    assert_eq!(text(&avg, 1, "machine_model"), "WB3100");
    assert_eq!(text(&avg, 1, "optn_code"), "OPT1");
    assert!((number(&avg, 1, "uph") - 100.0).abs() < 1e-9);
    assert_eq!(number(&avg, 1, "Outliers_Removed"), 1.0);
    assert_eq!(number(&avg, 1, "Original_Count"), 21.0);

    let cleaned = workbook.worksheet_range("Cleaned_Data").unwrap();
    assert_eq!(cleaned.height(), 21);
}

#[test]
fn test_die_attach_empty_date_range() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.csv");
    write_uph_csv(&a, &[100.0; 3]);

    let mut ctx = context(dir.path());
    let sink = ctx.xlsx_sink();
    let range = DateRange::parse("2030-01-01", "2030-12-31").unwrap();
    let err = pipeline::run_die_attach(&mut ctx, &pipeline::file_sources(&[a]), Some(&range), &sink)
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyDateRange { .. }));
    assert!(err.to_string().contains("2030-01-01"));
}

#[test]
fn test_wire_bond_with_reference() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("ref")).unwrap();
    fs::write(
        dir.path().join("ref").join("wire.csv"),
        "BOM_NO,ITEM_NO,MAT_SIZE,NO_BUMP,Number Required\nABC1,WG-100,1.0MIL,4,10\n",
    )
    .unwrap();
    let input = dir.path().join("wb.csv");
    write_uph_csv(&input, &[1200.0; 5]);

    let mut ctx = context(dir.path());
    ctx.config.reference.wire_file = "wire.csv".to_string();
    let sink = ctx.xlsx_sink();
    let report =
        pipeline::run_wire_bond(&mut ctx, &pipeline::file_sources(&[input]), None, &sink).unwrap();
    assert_eq!(report.groups, 1);

    let mut workbook = open_workbook_auto(&report.output_path).unwrap();
    let results = workbook.worksheet_range("UPH_Results").unwrap();
    assert_eq!(number(&results, 1, "Wire_Per_Unit"), 12.0);
    assert_eq!(number(&results, 1, "UPH"), 100.0);
    assert_eq!(text(&results, 1, "Mapping"), "bom");

    let summary = workbook.worksheet_range("Run_Summary").unwrap();
    assert_eq!(summary.get_value((5, 1)), Some(&Data::Float(100.0)));
}

fn write_log(path: &Path, strips: i64) {
    let mut body = String::new();
    for seq in 1..=strips {
        body.push_str(&format!("2024/03/05 10:{seq:02}:00\tPRO\tFU1234AB,G1,{seq}\n"));
        body.push_str(&format!(
            "2024/03/05 10:{seq:02}:10\tCUC\tFU1234AB,G1,{seq},0,0,0,0,1270\n"
        ));
    }
    fs::write(path, body).unwrap();
}

#[test]
fn test_logview_two_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("M01.txt");
    let second = dir.path().join("M02.log");
    write_log(&first, 6);
    write_log(&second, 6);
    let missing = dir.path().join("M03.txt");

    let mut ctx = context(dir.path());
    let sink = ctx.xlsx_sink();
    let report = pipeline::run_logview(&mut ctx, &[first, second, missing], &sink).unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.skipped_files.len(), 1);
    assert_eq!(report.input_rows, 24);

    let mut workbook = open_workbook_auto(&report.output_path).unwrap();
    let summary = workbook.worksheet_range("M01_summary").unwrap();
    assert_eq!(text(&summary, 1, "frame"), "FU1234");
    assert_eq!(number(&summary, 1, "speed"), 5.0);
    assert_eq!(number(&summary, 1, "sec/strip"), 10.0);

    let stock = workbook.worksheet_range("Frame_Stock").unwrap();
    assert_eq!(text(&stock, 1, "FRAME_STOCK"), "FU1234");
    assert_eq!(number(&stock, 1, "TIME/STRIP"), 10.0);
    assert_eq!(text(&stock, 1, "PACKAGE_CODE"), "not found");
}
