//! Rhythm CLI - Command-line interface for Rhythm HRV
//!
//! Commands:
//! - process: Load a Rhythm*.csv object, annotate every device, append to a table store
//! - annotate: Annotate a CSV file and print the series (no persistence)
//! - watermark: Show the stored watermark for a device

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use uuid::Uuid;

use rhythm_hrv::config::{ENV_DATASET_ID, ENV_TABLE_ID};
use rhythm_hrv::error::ConfigError;
use rhythm_hrv::timestamp::parse_timestamp;
use rhythm_hrv::{
    annotate_device, AnnotatedReading, BatchReport, CsvReadingSource, DeviceOutcome,
    NdjsonTableStore, PipelineConfig, PipelineError, RhythmProcessor, Settings, StageContext,
    WatermarkSource, Watermark, WriteMode, RHYTHM_VERSION,
};

/// Rhythm - gap-filled heartbeat series with rolling RMSSD
#[derive(Parser)]
#[command(name = "rhythm")]
#[command(version = RHYTHM_VERSION)]
#[command(about = "Annotate heartbeat sensor readings with HRV", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one raw object and append the annotated series to a table store
    Process {
        /// Directory whose sub-directories act as buckets
        #[arg(long)]
        source_root: PathBuf,

        /// Bucket name
        #[arg(long)]
        bucket: String,

        /// Object name (must match Rhythm*.csv)
        #[arg(long)]
        object: String,

        /// Table store root directory
        #[arg(long)]
        store: PathBuf,

        /// Target dataset (defaults to $DATASET_ID)
        #[arg(long)]
        dataset: Option<String>,

        /// Target table (defaults to $TABLE_ID)
        #[arg(long)]
        table: Option<String>,

        /// How to treat rows already in the table
        #[arg(long, default_value = "append")]
        write_mode: WriteModeArg,

        /// Gaps at or above this many seconds are discarded
        #[arg(long, default_value = "1.5")]
        max_gap: f64,

        /// RR intervals per RMSSD window
        #[arg(long, default_value = "10")]
        window: usize,

        /// Output the batch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Annotate a CSV file without persisting anything
    Annotate {
        /// Input CSV path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Only keep readings newer than this timestamp
        #[arg(long)]
        watermark: Option<String>,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Gaps at or above this many seconds are discarded
        #[arg(long, default_value = "1.5")]
        max_gap: f64,

        /// RR intervals per RMSSD window
        #[arg(long, default_value = "10")]
        window: usize,
    },

    /// Print the stored watermark for a device
    Watermark {
        /// Table store root directory
        #[arg(long)]
        store: PathBuf,

        /// Device identifier
        #[arg(long)]
        device: String,

        /// Dataset (defaults to $DATASET_ID)
        #[arg(long)]
        dataset: Option<String>,

        /// Table (defaults to $TABLE_ID)
        #[arg(long)]
        table: Option<String>,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one row per line)
    Ndjson,
    /// JSON array of rows
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, ValueEnum)]
enum WriteModeArg {
    Append,
    Truncate,
    WriteEmpty,
}

impl From<WriteModeArg> for WriteMode {
    fn from(arg: WriteModeArg) -> Self {
        match arg {
            WriteModeArg::Append => WriteMode::Append,
            WriteModeArg::Truncate => WriteMode::Truncate,
            WriteModeArg::WriteEmpty => WriteMode::WriteEmpty,
        }
    }
}

fn main() -> ExitCode {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), RhythmCliError> {
    match cli.command {
        Commands::Process {
            source_root,
            bucket,
            object,
            store,
            dataset,
            table,
            write_mode,
            max_gap,
            window,
            json,
        } => {
            let config = PipelineConfig {
                max_gap_seconds: max_gap,
                rmssd_window: window,
                write_mode: write_mode.into(),
            };
            config.validate()?;
            let settings = resolve_settings(dataset, table)?;
            cmd_process(&source_root, &bucket, &object, &store, settings, config, json)
        }

        Commands::Annotate {
            input,
            watermark,
            output,
            output_format,
            max_gap,
            window,
        } => {
            let config = PipelineConfig {
                max_gap_seconds: max_gap,
                rmssd_window: window,
                write_mode: WriteMode::Append,
            };
            config.validate()?;
            cmd_annotate(&input, watermark.as_deref(), &output, output_format, config)
        }

        Commands::Watermark {
            store,
            device,
            dataset,
            table,
        } => {
            let settings = resolve_settings(dataset, table)?;
            cmd_watermark(&store, &device, &settings)
        }
    }
}

/// Explicit flags win; anything missing comes from the environment
fn resolve_settings(
    dataset: Option<String>,
    table: Option<String>,
) -> Result<Settings, RhythmCliError> {
    match (dataset, table) {
        (Some(dataset), Some(table)) => Ok(Settings::new(dataset, table)),
        (dataset, table) => {
            let from_env = Settings::from_env()?;
            Ok(Settings::new(
                dataset.unwrap_or(from_env.dataset_id),
                table.unwrap_or(from_env.table_id),
            ))
        }
    }
}

fn cmd_process(
    source_root: &Path,
    bucket: &str,
    object: &str,
    store_root: &Path,
    settings: Settings,
    config: PipelineConfig,
    json: bool,
) -> Result<(), RhythmCliError> {
    let source = CsvReadingSource::new(source_root);
    let store = NdjsonTableStore::new(store_root);
    store.create_dataset(&settings.dataset_id)?;

    let mut processor = RhythmProcessor::with_config(store.clone(), store, settings, config);
    let Some(report) = processor.process_object(&source, bucket, object)? else {
        if json {
            println!("{}", serde_json::json!({ "skipped": object }));
        } else {
            println!("Skipped {}: name does not match Rhythm*.csv", object);
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.has_failures() {
        Err(RhythmCliError::DeviceFailures(report.failed()))
    } else {
        Ok(())
    }
}

fn print_report(report: &BatchReport) {
    println!("Rhythm Batch Report");
    println!("===================");
    println!("Run:       {}", report.run_id);
    println!("Persisted: {}", report.persisted());
    println!("No data:   {}", report.skipped());
    println!("Failed:    {}", report.failed());
    println!();

    for outcome in &report.outcomes {
        match outcome {
            DeviceOutcome::Persisted {
                device_id,
                rows,
                synthetic_rows,
                ..
            } => println!(
                "  [OK]   {}: {} rows ({} synthetic)",
                device_id, rows, synthetic_rows
            ),
            DeviceOutcome::NoNewData { device_id } => {
                println!("  [SKIP] {}: no new data", device_id)
            }
            DeviceOutcome::Failed { device_id, error } => {
                println!("  [ERR]  {}: {}", device_id, error)
            }
        }
    }
}

fn cmd_annotate(
    input: &Path,
    watermark: Option<&str>,
    output: &Path,
    output_format: OutputFormat,
    config: PipelineConfig,
) -> Result<(), RhythmCliError> {
    let watermark = match watermark {
        Some(raw) => Watermark::new(
            parse_timestamp(raw).ok_or_else(|| RhythmCliError::InvalidWatermark(raw.to_string()))?,
        ),
        None => Watermark::MIN,
    };

    let frame = if input.to_string_lossy() == "-" {
        CsvReadingSource::parse_reader("<stdin>", io::stdin())?
    } else {
        CsvReadingSource::read_path(input)?
    };

    if frame.is_empty() {
        return Err(RhythmCliError::NoReadings);
    }

    let run_id = Uuid::new_v4();
    let mut rows: Vec<AnnotatedReading> = Vec::new();
    let mut failures = 0usize;
    for device_id in frame.device_ids() {
        let ctx = StageContext::for_run(run_id, device_id);
        let device_frame = frame.for_device(&ctx.device_id);
        match annotate_device(device_frame, watermark, &ctx, &config) {
            Ok(series) => rows.extend(series.rows),
            Err(PipelineError::NoNewData { device_id }) => {
                log::info!("No new data for device {}", device_id);
            }
            Err(e) => {
                log::error!("{} {}", ctx, e);
                failures += 1;
            }
        }
    }

    let output_data = format_output(&rows, &output_format)?;
    if output.to_string_lossy() == "-" {
        print!("{}", output_data);
    } else {
        fs::write(output, output_data)?;
    }

    if failures > 0 {
        Err(RhythmCliError::DeviceFailures(failures))
    } else {
        Ok(())
    }
}

fn cmd_watermark(
    store_root: &Path,
    device: &str,
    settings: &Settings,
) -> Result<(), RhythmCliError> {
    let store = NdjsonTableStore::new(store_root);
    let watermark = store.fetch_watermark(device, &settings.table_ref())?;

    let report = WatermarkReport {
        device_id: device.to_string(),
        table: settings.table_ref().to_string(),
        watermark: (!watermark.is_sentinel()).then(|| watermark.instant().to_rfc3339()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn format_output(
    rows: &[AnnotatedReading],
    format: &OutputFormat,
) -> Result<String, RhythmCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for row in rows {
                lines.push(serde_json::to_string(row)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(rows)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(rows)?),
    }
}

// Error types

#[derive(Debug)]
enum RhythmCliError {
    Io(io::Error),
    Pipeline(PipelineError),
    Json(serde_json::Error),
    Config(ConfigError),
    InvalidWatermark(String),
    NoReadings,
    DeviceFailures(usize),
}

impl From<io::Error> for RhythmCliError {
    fn from(e: io::Error) -> Self {
        RhythmCliError::Io(e)
    }
}

impl From<PipelineError> for RhythmCliError {
    fn from(e: PipelineError) -> Self {
        RhythmCliError::Pipeline(e)
    }
}

impl From<rhythm_hrv::SourceError> for RhythmCliError {
    fn from(e: rhythm_hrv::SourceError) -> Self {
        RhythmCliError::Pipeline(e.into())
    }
}

impl From<rhythm_hrv::FetchError> for RhythmCliError {
    fn from(e: rhythm_hrv::FetchError) -> Self {
        RhythmCliError::Pipeline(e.into())
    }
}

impl From<serde_json::Error> for RhythmCliError {
    fn from(e: serde_json::Error) -> Self {
        RhythmCliError::Json(e)
    }
}

impl From<ConfigError> for RhythmCliError {
    fn from(e: ConfigError) -> Self {
        RhythmCliError::Config(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<RhythmCliError> for CliError {
    fn from(e: RhythmCliError) -> Self {
        match e {
            RhythmCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            RhythmCliError::Pipeline(e) => {
                let (code, hint) = match &e {
                    PipelineError::Validation(_) => {
                        ("VALIDATION_ERROR", "Check the CSV columns and device grouping")
                    }
                    PipelineError::NoNewData { .. } => {
                        ("NO_NEW_DATA", "Nothing newer than the stored watermark")
                    }
                    PipelineError::UpstreamFetch(_) => {
                        ("FETCH_ERROR", "Check the store path, dataset and table")
                    }
                    PipelineError::Persistence(_) => {
                        ("LOAD_ERROR", "Check the target table and write mode")
                    }
                    PipelineError::Source(_) => {
                        ("SOURCE_ERROR", "Ensure the object exists and is a headerless Rhythm CSV")
                    }
                    PipelineError::Config(_) => (
                        "CONFIG_ERROR",
                        "Set DATASET_ID and TABLE_ID or pass --dataset/--table",
                    ),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            RhythmCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            RhythmCliError::Config(e) => {
                let hint = match &e {
                    ConfigError::InvalidValue { .. } => {
                        "Use --max-gap > 0 and --window >= 2".to_string()
                    }
                    _ => format!(
                        "Set {} and {} or pass --dataset/--table",
                        ENV_DATASET_ID, ENV_TABLE_ID
                    ),
                };
                CliError {
                    code: "CONFIG_ERROR".to_string(),
                    message: e.to_string(),
                    hint: Some(hint),
                }
            }
            RhythmCliError::InvalidWatermark(raw) => CliError {
                code: "INVALID_WATERMARK".to_string(),
                message: format!("Cannot parse watermark '{}'", raw),
                hint: Some("Use YYYY-MM-DD HH:MM:SS.ffffff+HHMM or RFC 3339".to_string()),
            },
            RhythmCliError::NoReadings => CliError {
                code: "NO_READINGS".to_string(),
                message: "No readings found in input".to_string(),
                hint: Some("Ensure the input file is not empty".to_string()),
            },
            RhythmCliError::DeviceFailures(count) => CliError {
                code: "DEVICE_FAILURES".to_string(),
                message: format!("{} devices failed processing", count),
                hint: Some("Review the log output for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct WatermarkReport {
    device_id: String,
    table: String,
    watermark: Option<String>,
}
