use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use cell_aging::{
    load_metadata_path, AnalysisParams, AnalysisSession, Dataset, DetailedAnalysis, Denylist,
    LoadReport, UnitAnalysis,
};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Battery aging analytics CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List analyzable units and the per-type record counts
    Units(UnitsArgs),
    /// Derive the health series of one unit and write CSV/JSON outputs
    Analyze(AnalyzeArgs),
}

#[derive(Parser, Debug)]
struct DenyArgs {
    /// Units to exclude (comma separated ids)
    #[arg(long)]
    deny: Option<String>,

    /// Also exclude the known-bad units of the NASA randomized-usage set
    #[arg(long, action = ArgAction::SetTrue)]
    nasa_denylist: bool,
}

#[derive(Parser, Debug)]
struct UnitsArgs {
    /// Metadata CSV (one row per test)
    #[arg(long, value_hint = ValueHint::FilePath)]
    metadata: PathBuf,

    /// Optional analysis parameters JSON (its denylist applies)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(flatten)]
    deny: DenyArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Metadata CSV (one row per test)
    #[arg(long, value_hint = ValueHint::FilePath)]
    metadata: PathBuf,

    /// Unit identifier to analyze
    #[arg(long)]
    unit: String,

    /// Directory holding the per-cycle detail CSVs
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// Output directory (`-` prints the JSON report to stdout)
    #[arg(short, long, default_value = "analysis", value_hint = ValueHint::DirPath)]
    output: PathBuf,

    /// Optional analysis parameters JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(flatten)]
    deny: DenyArgs,

    /// Rows inspected for the reference capacity
    #[arg(long)]
    peak_window: Option<usize>,

    /// Capacity fade (%) treated as end of life
    #[arg(long)]
    eol_fade: Option<f64>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    unit_id: &'a str,
    load: &'a LoadReport,
    analysis: &'a UnitAnalysis,
    details: Option<&'a DetailedAnalysis>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Units(args) => args.verbose,
        Command::Analyze(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Units(args) => handle_units(args),
        Command::Analyze(args) => handle_analyze(args),
    }
}

fn handle_units(args: UnitsArgs) -> Result<()> {
    let dataset = load_dataset(&args.metadata)?;
    let denylist = units_denylist(&args)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for unit in dataset.available_units(&denylist) {
        writeln!(out, "{}", unit)?;
    }
    for (test_type, count) in dataset.type_counts() {
        info!("{}: {} records", test_type, count);
    }
    if !denylist.is_empty() {
        info!("Excluded by denylist: {}", denylist.iter().collect::<Vec<_>>().join(", "));
    }
    Ok(())
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let mut params = match args.config.as_ref() {
        Some(path) => load_params(path)?,
        None => AnalysisParams::default(),
    };
    if let Some(window) = args.peak_window {
        params.peak_window = window;
    }
    if let Some(eol) = args.eol_fade {
        params.eol_fade_pct = eol;
    }
    let denylist = build_denylist(&args.deny, params.denylist())?;
    params.denylist = denylist.iter().map(str::to_string).collect();
    params
        .validate()
        .context("invalid analysis parameters")?;

    if denylist.contains(&args.unit) {
        warn!("{} is on the denylist; analyzing it on request", args.unit);
    }

    let t_load = Instant::now();
    let dataset = load_dataset(&args.metadata)?;
    let load_report = dataset.report().clone();
    if args.profile || args.verbose {
        info!(
            "Load stage: {:.1} ms ({} rows)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            load_report.rows_kept
        );
    }

    let mut session = AnalysisSession::new(dataset, params);
    if let Some(dir) = args.data_dir.as_ref() {
        session = session.with_data_dir(dir.clone());
    }

    let t_compute = Instant::now();
    let analysis = session
        .analyze(&args.unit)
        .with_context(|| format!("failed to analyze {}", args.unit))?;
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms",
            t_compute.elapsed().as_secs_f64() * 1000.0
        );
    }
    log_analysis(&analysis);

    let details = if session.data_dir().is_some() {
        let t_detail = Instant::now();
        let details = session.analyze_details(&args.unit)?;
        if args.profile || args.verbose {
            info!(
                "Detail stage: {:.1} ms ({} cycles, {} skipped)",
                t_detail.elapsed().as_secs_f64() * 1000.0,
                details.cycles_loaded,
                details.skipped.len()
            );
        }
        log_details(&details);
        Some(details)
    } else {
        None
    };

    let report = Report {
        unit_id: &args.unit,
        load: &load_report,
        analysis: &analysis,
        details: details.as_ref(),
    };

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, &report)?;
        writeln!(handle)?;
        return Ok(());
    }

    write_outputs(&args.output, &report)?;
    info!("Wrote analysis: {}", args.output.display());
    Ok(())
}

fn units_denylist(args: &UnitsArgs) -> Result<Denylist> {
    let base = match args.config.as_ref() {
        Some(path) => load_params(path)?.denylist(),
        None => Denylist::new(),
    };
    build_denylist(&args.deny, base)
}

fn write_outputs(dir: &Path, report: &Report) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    write_discharge_csv(report.analysis, &dir.join("discharge.csv"))?;
    write_impedance_csv(report.analysis, &dir.join("impedance.csv"))?;
    write_degradation_csv(report.analysis, &dir.join("degradation.csv"))?;
    write_efficiency_csv(report.details, &dir.join("efficiency.csv"))?;
    let report_path = dir.join("report.json");
    let file = File::create(&report_path)
        .with_context(|| format!("failed to create {}", report_path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

fn load_dataset(path: &Path) -> Result<Dataset> {
    let dataset = load_metadata_path(path)
        .with_context(|| format!("failed to load metadata {}", path.display()))?;
    let report = dataset.report();
    if let Some(mismatch) = report.degraded {
        warn!(
            "Degraded load: {} columns found, {} expected",
            mismatch.found, mismatch.expected
        );
    }
    info!(
        "Metadata loaded: {} of {} rows kept ({} missing type/unit, {} unknown type)",
        report.rows_kept, report.rows_read, report.dropped_missing_key, report.dropped_unknown_type
    );
    info!(
        "Data quality: {} with capacity, {} with Re, {} with Rct, {} with valid start time",
        report.with_capacity, report.with_re, report.with_rct, report.with_start_time
    );
    Ok(dataset)
}

fn load_params(path: &Path) -> Result<AnalysisParams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    AnalysisParams::from_json_str(&text)
        .with_context(|| format!("{} is not a valid parameter file", path.display()))
}

fn build_denylist(args: &DenyArgs, base: Denylist) -> Result<Denylist> {
    let mut denylist = base;
    if args.nasa_denylist {
        denylist.extend(&Denylist::nasa_problem_units());
    }
    if let Some(list) = args.deny.as_ref() {
        for unit in parse_unit_list(list)? {
            denylist.insert(unit);
        }
    }
    Ok(denylist)
}

fn parse_unit_list(input: &str) -> Result<Vec<String>> {
    let units: Vec<String> = input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if units.is_empty() {
        return Err(anyhow!("--deny list was empty"));
    }
    Ok(units)
}

fn log_analysis(analysis: &UnitAnalysis) {
    match analysis.discharge.as_ref() {
        Some(series) => info!(
            "Discharge: {} cycles, peak {:.3} Ah, throughput {:.1} Ah",
            series.len(),
            series.peak_capacity,
            series.total_throughput()
        ),
        None => warn!("No discharge data for {}", analysis.unit_id),
    }
    match analysis.impedance.as_ref() {
        Some(series) => info!(
            "Impedance: {} tests, resistance growth up to {:.1}%",
            series.len(),
            series.max_increase_pct().unwrap_or(0.0)
        ),
        None => warn!("No impedance data for {}", analysis.unit_id),
    }
    if let Some(corr) = analysis.correlation.as_ref() {
        info!("Capacity vs resistance: R² = {:.3}", corr.r_squared);
    }
    if let Some(summary) = analysis.summary.as_ref() {
        let rul = summary
            .rul
            .map(|r| format!("{:.0} cycles", r.cycles_to_eol))
            .unwrap_or_else(|| "n/a".into());
        info!(
            "Summary: fade {:.1}%, verdict {:?}, RUL {}",
            summary.capacity_fade_pct, summary.verdict, rul
        );
    }
}

fn log_details(details: &DetailedAnalysis) {
    for skipped in &details.skipped {
        warn!(
            "Detail file unavailable: {} ({})",
            skipped.detail_filename, skipped.reason
        );
    }
    match details.efficiency.as_ref() {
        Some(trend) => info!(
            "Energy efficiency: average {:.1}%, final {:.1}% over {} cycles",
            trend.average_pct,
            trend.final_pct,
            trend.points.len()
        ),
        None => warn!("Could not calculate energy efficiency - no valid cycles"),
    }
    if let Some(thermal) = details.thermal.as_ref() {
        info!(
            "Thermal: mean {:.1} °C, range {:.1} °C ({:?})",
            thermal.mean_c, thermal.range_c, thermal.stability
        );
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.3}", v)).unwrap_or_default()
}

fn write_discharge_csv(analysis: &UnitAnalysis, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "efc",
        "cycle_id",
        "capacity_ah",
        "soc_pct",
        "dod_pct",
        "capacity_fade_pct",
        "throughput_ah",
        "interpolated_resistance_ohm",
    ])?;
    if let Some(series) = analysis.discharge.as_ref() {
        let resistance = analysis
            .correlation
            .as_ref()
            .map(|c| c.interpolated_resistance.as_slice());
        for (i, point) in series.points.iter().enumerate() {
            writer.write_record([
                point.efc.to_string(),
                point.cycle_id.map(|c| c.to_string()).unwrap_or_default(),
                format!("{:.4}", point.capacity),
                format!("{:.3}", point.soc),
                format!("{:.3}", point.dod),
                format!("{:.3}", point.capacity_fade),
                format!("{:.4}", point.throughput),
                fmt_opt(resistance.and_then(|r| r.get(i).copied())),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_impedance_csv(analysis: &UnitAnalysis, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "index",
        "cycle_id",
        "re_ohm",
        "rct_ohm",
        "total_resistance_ohm",
        "resistance_increase_pct",
    ])?;
    if let Some(series) = analysis.impedance.as_ref() {
        for point in &series.points {
            writer.write_record([
                point.index.to_string(),
                point.cycle_id.map(|c| c.to_string()).unwrap_or_default(),
                format!("{:.5}", point.re),
                format!("{:.5}", point.rct),
                format!("{:.5}", point.total_resistance),
                fmt_opt(point.resistance_increase_pct),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_degradation_csv(analysis: &UnitAnalysis, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(["efc", "degradation_rate_pct"])?;
    for point in analysis.degradation.iter().flatten() {
        writer.write_record([point.efc.to_string(), format!("{:.4}", point.rate_pct)])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_efficiency_csv(details: Option<&DetailedAnalysis>, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(["cycle_id", "sample_uid", "efficiency_pct"])?;
    let trend = details.and_then(|d| d.efficiency.as_ref());
    for point in trend.iter().flat_map(|t| t.points.iter()) {
        writer.write_record([
            point.cycle_id.map(|c| c.to_string()).unwrap_or_default(),
            point.sample_uid.clone(),
            format!("{:.3}", point.efficiency_pct),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
