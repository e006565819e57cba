//! `uph-clean` command-line front end.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use uph_clean::config::PipelineConfig;
use uph_clean::logging::init_logging;
use uph_clean::pipeline::{self, DateRange, PipelineContext};
use uph_clean::reader::{self, FileSource, IngestionSource};
use uph_clean::types::RunReport;

#[derive(Parser, Debug)]
#[command(name = "uph-clean", version, about = "UPH cleaning, aggregation and machine-log reconstruction")]
struct Cli {
    /// Configuration file (defaults to ./uph-clean.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory the report is written to
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clean and average die-attach UPH exports
    DieAttach {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
    },

    /// Clean wire-bond UPH exports and compute efficiency
    WireBond {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
    },

    /// Latest pick-and-place pack type per product/BOM pair
    PackType {
        /// Pack type history exports
        #[arg(required = true)]
        history: Vec<PathBuf>,
        /// Table of product_no/bom_no pairs to report
        #[arg(long)]
        pairs: Option<PathBuf>,
    },

    /// Reconstruct process cycles from machine logs
    Logview {
        #[arg(required = true)]
        logs: Vec<PathBuf>,
    },

    /// Show the date coverage of an input
    Preview { input: PathBuf },

    /// Fetch records from the remote API into a JSON file
    #[cfg(feature = "remote")]
    Fetch {
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        endpoint: String,
        /// Comma-separated partitions, e.g. 2024Q1,2024Q2
        #[arg(long)]
        partitions: String,
        /// Extra query filters as key=value
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[cfg(feature = "remote")]
fn parse_filter(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path),
        None => PipelineConfig::discover(),
    }
    .context("loading configuration")?;
    init_logging(&config.logging.level, cli.json_logs || config.logging.json);

    let mut ctx = PipelineContext::new(pipeline::with_output_dir(config, cli.output_dir));
    let sink = ctx.xlsx_sink();

    let report = match cli.command {
        Command::DieAttach { inputs, start_date, end_date } => {
            let range = DateRange::from_bounds(start_date.as_deref(), end_date.as_deref())?;
            pipeline::run_die_attach(&mut ctx, &pipeline::file_sources(&inputs), range.as_ref(), &sink)?
        }
        Command::WireBond { inputs, start_date, end_date } => {
            let range = DateRange::from_bounds(start_date.as_deref(), end_date.as_deref())?;
            pipeline::run_wire_bond(&mut ctx, &pipeline::file_sources(&inputs), range.as_ref(), &sink)?
        }
        Command::PackType { history, pairs } => {
            let pairs = pairs.map(FileSource::new);
            pipeline::run_pack_type(
                &mut ctx,
                &pipeline::file_sources(&history),
                pairs.as_ref().map(|p| p as &dyn IngestionSource),
                &sink,
            )?
        }
        Command::Logview { logs } => pipeline::run_logview(&mut ctx, &logs, &sink)?,
        Command::Preview { input } => {
            let table = reader::read_table(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            match pipeline::preview_dates(&table) {
                Some(p) => println!(
                    "{} to {} ({} of {} records dated)",
                    p.min_date, p.max_date, p.valid_records, p.total_records
                ),
                None => println!("no usable date column in {}", input.display()),
            }
            return Ok(());
        }
        #[cfg(feature = "remote")]
        Command::Fetch { base_url, endpoint, partitions, filters, out } => {
            return fetch(&base_url, &endpoint, &partitions, filters, &out);
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("{}", report.output_path);
    println!(
        "groups: {}  outliers removed: {}  rows read: {}  rows dropped: {}",
        report.groups, report.outliers_removed, report.input_rows, report.dropped_rows
    );
    for skipped in &report.skipped_files {
        eprintln!("skipped {skipped}");
    }
}

#[cfg(feature = "remote")]
fn fetch(
    base_url: &str,
    endpoint: &str,
    partitions: &str,
    filters: Vec<(String, String)>,
    out: &std::path::Path,
) -> Result<()> {
    use uph_clean::remote::{fetch_partitions, split_partitions, Filters, HttpSource};

    let source = HttpSource::new(base_url);
    let filters: Filters = filters.into_iter().collect();
    let batch = fetch_partitions(&source, endpoint, &split_partitions(partitions), &filters);
    if !batch.is_complete() {
        eprintln!("{}", batch.error_summary());
    }
    anyhow::ensure!(!batch.records.is_empty(), "no records fetched");

    let json = serde_json::to_string(&batch.records)?;
    std::fs::write(out, json).with_context(|| format!("writing {}", out.display()))?;
    println!("{} ({} records)", out.display(), batch.records.len());
    Ok(())
}
