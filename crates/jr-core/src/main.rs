//! jobreport: GPU telemetry for Slurm job steps.
//!
//! `jobreport run -- <cmd>` wraps a workload in a telemetry session on every
//! rank of a step; `jobreport start` / `jobreport stop` bracket a workload
//! that cannot be wrapped; `jobreport export <dir>` merges the fragments
//! afterwards.

use clap::{Args, Parser, Subcommand};
use jr_common::{Error, OutputFormat, Result, SCHEMA_VERSION};
use jr_config::{resolve_config, topology_from_env, Config, CONFIG_SCHEMA_VERSION};
use jr_core::exit_codes::ExitCode;
use jr_core::layout::{LayoutOptions, OutputMode};
use jr_core::merge::merge_path;
use jr_core::recorder::{Recorder, RecorderOptions};
use jr_core::report::{build_reports, render_json, render_text};
use jr_core::session;
use jr_core::source::{SmiTelemetrySource, StaticTelemetrySource, TelemetrySource};
use jr_telemetry::{write_parquet, ExportError, RecordTable, StorageFormat, TABLE_SCHEMA_VERSION};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "jobreport", version, about = "GPU telemetry for Slurm job steps")]
struct Cli {
    /// Log filter directive, e.g. `info` or `jr_core=debug`.
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to a config.json file.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command under GPU telemetry (once per rank, e.g. via srun).
    Run(RunArgs),
    /// Start a telemetry session in the background (container hooks).
    Start(RecordArgs),
    /// Stop the session opened by `start` and write the fragment.
    Stop(RecordArgs),
    /// Merge a job or step directory and print the report.
    Export(ExportArgs),
    /// Print version and schema information.
    Version {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    record: RecordArgs,

    /// Workload to run.
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

/// Options shared by `run`, `start` and `stop`. `start` and `stop` must be
/// given the same layout options.
#[derive(Args, Debug)]
struct RecordArgs {
    /// Sampling period in seconds (0 picks one from the runtime).
    #[arg(short = 'u', long = "sampling-time", value_name = "SECS")]
    sampling_time: Option<u64>,

    /// Expected maximum runtime (Slurm time format, e.g. 1-12:00:00).
    #[arg(short = 't', long = "max-time", value_name = "TIME")]
    max_time: Option<String>,

    /// Output base directory [default: ./jobreport_<job>].
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Append all ranks of a step to one shared file.
    #[arg(long)]
    single_file: bool,

    /// Directory for single-file lock files.
    #[arg(long, value_name = "DIR")]
    lock_dir: Option<PathBuf>,

    /// Fragment storage format: csv or bin.
    #[arg(long, value_name = "FORMAT")]
    format: Option<StorageFormat>,

    /// Replace an existing fragment instead of failing.
    #[arg(long)]
    force: bool,

    /// Monitor all GPUs on the node even when Slurm bound specific ones.
    #[arg(long)]
    ignore_gpu_binding: bool,

    /// Skip GPU sampling; fragments carry identity only (run, start).
    #[arg(long)]
    dry_run: bool,

    /// nvidia-smi executable used for sampling.
    #[arg(long, env = "JOBREPORT_NVIDIA_SMI", default_value = "nvidia-smi")]
    nvidia_smi: String,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Job root (contains `.jobreport_root`) or a single step directory.
    path: PathBuf,

    /// Report format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Also write every merged row to a Parquet file.
    #[arg(long, value_name = "FILE")]
    parquet: Option<PathBuf>,

    /// Write the report to a file instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    out: Option<PathBuf>,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_new(&cli.log_level)
        .map_err(|e| Error::Config(format!("invalid log level {}: {e}", cli.log_level)))?;
    if cli.log_json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(io::stderr)
            .init();
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("jobreport: {e}");
        std::process::exit(ExitCode::ConfigError.as_i32());
    }

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(code = e.code(), error = %e, "jobreport failed");
            eprintln!("jobreport: {e}");
            ExitCode::from_error(&e).as_i32()
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => run(cli.config.as_deref(), args),
        Commands::Start(args) => start(cli.config.as_deref(), &args),
        Commands::Stop(args) => stop(cli.config.as_deref(), &args),
        Commands::Export(args) => export(args),
        Commands::Version { json } => version(json),
    }
}

/// Command-line flags win over the config file.
fn apply_overrides(mut config: Config, args: &RecordArgs) -> Config {
    if let Some(secs) = args.sampling_time {
        config.sampling_time_secs = secs;
    }
    if let Some(spec) = &args.max_time {
        config.max_time = Some(spec.clone());
    }
    if let Some(dir) = &args.output {
        config.output = Some(dir.clone());
    }
    if let Some(dir) = &args.lock_dir {
        config.lock_dir = Some(dir.clone());
    }
    if let Some(format) = args.format {
        config.storage_format = format;
    }
    config.single_file |= args.single_file;
    config.force |= args.force;
    config.ignore_gpu_binding |= args.ignore_gpu_binding;
    config
}

fn recorder_options(config_path: Option<&Path>, args: &RecordArgs) -> Result<RecorderOptions> {
    let resolved = resolve_config(config_path)?;
    debug!(source = ?resolved.source, "configuration loaded");
    let config = apply_overrides(resolved.config, args);
    config.validate()?;

    Ok(RecorderOptions {
        layout: LayoutOptions {
            base: config.output.clone(),
            mode: if config.single_file {
                OutputMode::SingleFile
            } else {
                OutputMode::Split
            },
            format: config.storage_format,
            overwrite: config.force,
            lock_dir: config.lock_dir.clone(),
        },
        ignore_gpu_binding: config.ignore_gpu_binding,
        sampling_time_secs: config.sampling_time_secs,
        max_runtime_secs: config.max_time_secs()?,
        cwd: std::env::current_dir()?,
        shell: None,
    })
}

fn run(config_path: Option<&Path>, args: RunArgs) -> Result<i32> {
    let options = recorder_options(config_path, &args.record)?;
    let topology = topology_from_env()?;
    let command = args.command.join(" ");

    if args.record.dry_run {
        record(topology, options, StaticTelemetrySource::new(Vec::new()), &command)
    } else {
        let source = SmiTelemetrySource::with_program(args.record.nvidia_smi.clone());
        if let Err(e) = source.probe() {
            warn!(
                program = %args.record.nvidia_smi,
                error = %e,
                "GPU query tool unusable; readings will be unknown"
            );
        }
        record(topology, options, source, &command)
    }
}

fn record<S: TelemetrySource>(
    topology: jr_common::JobTopology,
    options: RecorderOptions,
    source: S,
    command: &str,
) -> Result<i32> {
    let outcome = Recorder::new(topology, options, source).run(command)?;
    if let Some(target) = &outcome.target {
        info!(path = %target.display(), rows = outcome.rows, "telemetry recorded");
    }
    Ok(outcome.workload_status.exit_code())
}

fn start(config_path: Option<&Path>, args: &RecordArgs) -> Result<i32> {
    let options = recorder_options(config_path, args)?;
    let topology = topology_from_env()?;
    let logger = (!args.dry_run).then_some(args.nvidia_smi.as_str());
    if let Some(state) = session::start(&topology, &options, logger)? {
        info!(session = %state.name, "session open; run `jobreport stop` when the workload ends");
    }
    Ok(ExitCode::Clean.as_i32())
}

fn stop(config_path: Option<&Path>, args: &RecordArgs) -> Result<i32> {
    let options = recorder_options(config_path, args)?;
    let topology = topology_from_env()?;
    if let Some(outcome) = session::stop(&topology, &options)? {
        info!(
            path = %outcome.target.display(),
            rows = outcome.rows,
            samples = outcome.samples,
            "telemetry recorded"
        );
    }
    Ok(ExitCode::Clean.as_i32())
}

fn export_error(e: ExportError) -> Error {
    match e {
        ExportError::Io(e) => Error::Io(e),
        other => Error::Encode(other.to_string()),
    }
}

fn export(args: ExportArgs) -> Result<i32> {
    let steps = merge_path(&args.path)?;

    let mut merged = RecordTable::new();
    for step in &steps {
        merged.extend(&step.table);
    }
    if let Some(path) = &args.parquet {
        write_parquet(&merged, path).map_err(export_error)?;
        info!(path = %path.display(), rows = merged.len(), "parquet written");
    }

    let mut sink: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };
    match args.format {
        OutputFormat::Text => {
            let reports = build_reports(&steps)?;
            writeln!(sink, "{}", render_text(&reports))?;
        }
        OutputFormat::Json => {
            let reports = build_reports(&steps)?;
            let doc = render_json(&reports)?;
            writeln!(sink, "{}", serde_json::to_string_pretty(&doc)?)?;
        }
        OutputFormat::Csv => merged.dump(&mut sink, StorageFormat::Csv)?,
    }
    sink.flush()?;
    Ok(ExitCode::Clean.as_i32())
}

fn version(json: bool) -> Result<i32> {
    let version = env!("CARGO_PKG_VERSION");
    if json {
        let doc = serde_json::json!({
            "version": version,
            "schema_version": SCHEMA_VERSION,
            "table_schema_version": TABLE_SCHEMA_VERSION,
            "config_schema_version": CONFIG_SCHEMA_VERSION,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("jobreport {version}");
        println!("  report schema {SCHEMA_VERSION}");
        println!("  table schema {TABLE_SCHEMA_VERSION}");
        println!("  config schema {CONFIG_SCHEMA_VERSION}");
    }
    Ok(ExitCode::Clean.as_i32())
}
