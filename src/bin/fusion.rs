//! Fusion CLI - Command-line interface for Swing Fusion
//!
//! Commands:
//! - run: Fuse configured input streams into one output stream
//! - validate: Check a fusion configuration
//! - doctor: Diagnose a configuration together with its input files
//! - schema: Print the example configuration or the output layout

use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use swing_fusion::encoder::{RowEncoder, RowFormat};
use swing_fusion::loader::{JsonRow, StreamLoader};
use swing_fusion::{FusionConfig, FusionError, FusionPipeline, FUSION_VERSION, PRODUCER_NAME};

/// Fusion - temporal alignment and cross-sensor normalization for swing data
#[derive(Parser)]
#[command(name = "fusion")]
#[command(version = FUSION_VERSION)]
#[command(about = "Align and normalize racket and wrist sensor streams", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fuse configured input streams into one output stream
    Run {
        /// Fusion configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Stream input as name=path (path - reads stdin); repeat per stream
        #[arg(short, long = "input", value_parser = parse_input_arg)]
        inputs: Vec<(String, PathBuf)>,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Write the run report (JSON) to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Check a fusion configuration
    Validate {
        /// Fusion configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose a configuration together with its input files
    Doctor {
        /// Fusion configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stream input as name=path
        #[arg(short, long = "input", value_parser = parse_input_arg)]
        inputs: Vec<(String, PathBuf)>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the example configuration or the output layout
    Schema {
        #[arg(value_enum)]
        schema_type: SchemaType,
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

impl From<OutputFormat> for RowFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Ndjson => RowFormat::Ndjson,
            OutputFormat::Json => RowFormat::Json,
            OutputFormat::JsonPretty => RowFormat::JsonPretty,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Example three-sensor configuration
    Config,
    /// Output row and report layout
    Output,
}

fn parse_input_arg(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected name=path, got '{}'", arg)),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), FusionCliError> {
    match cli.command {
        Commands::Run {
            config,
            inputs,
            output,
            output_format,
            report,
        } => cmd_run(&config, &inputs, &output, output_format, report.as_deref()),

        Commands::Validate { config, json } => cmd_validate(&config, json),

        Commands::Doctor { config, inputs, json } => cmd_doctor(config.as_deref(), &inputs, json),

        Commands::Schema { schema_type } => cmd_schema(schema_type),
    }
}

fn read_source(path: &Path, stdin_used: &mut bool) -> Result<String, FusionCliError> {
    if path.to_string_lossy() == "-" {
        if *stdin_used {
            return Err(FusionCliError::InvalidArgument(
                "stdin (-) can feed only one input".to_string(),
            ));
        }
        *stdin_used = true;
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn load_inputs(inputs: &[(String, PathBuf)]) -> Result<BTreeMap<String, Vec<JsonRow>>, FusionCliError> {
    let mut stdin_used = false;
    let mut rows = BTreeMap::new();
    for (name, path) in inputs {
        if rows.contains_key(name) {
            return Err(FusionCliError::InvalidArgument(format!(
                "input '{}' given more than once",
                name
            )));
        }
        let text = read_source(path, &mut stdin_used)?;
        rows.insert(name.clone(), StreamLoader::parse_auto(&text)?);
    }
    Ok(rows)
}

fn cmd_run(
    config: &Path,
    inputs: &[(String, PathBuf)],
    output: &Path,
    output_format: OutputFormat,
    report: Option<&Path>,
) -> Result<(), FusionCliError> {
    let pipeline = FusionPipeline::from_json(&fs::read_to_string(config)?)?;
    let fusion = pipeline.run(load_inputs(inputs)?)?;

    let output_data = RowEncoder::encode(&fusion.stream, output_format.into())?;
    if output.to_string_lossy() == "-" {
        print!("{}", output_data);
    } else {
        fs::write(output, output_data)?;
    }

    if let Some(report_path) = report {
        fs::write(report_path, serde_json::to_string_pretty(&fusion.report)?)?;
    }

    Ok(())
}

fn cmd_validate(config: &Path, json: bool) -> Result<(), FusionCliError> {
    let text = fs::read_to_string(config)?;
    let result = FusionConfig::from_json(&text);

    let report = match &result {
        Ok(config) => ValidationReport {
            valid: true,
            streams: config.stream_names(),
            steps: config.steps.iter().map(|s| s.kind().to_string()).collect(),
            output: Some(config.output.clone()),
            error: None,
        },
        Err(e) => ValidationReport {
            valid: false,
            streams: BTreeMap::new(),
            steps: Vec::new(),
            output: None,
            error: Some(e.to_string()),
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Valid:   {}", report.valid);
        if let Some(error) = &report.error {
            println!("Error:   {}", error);
        }
        for (name, origin) in &report.streams {
            println!("  - stream {} ({})", name, origin);
        }
        for (idx, step) in report.steps.iter().enumerate() {
            println!("  - step {}: {}", idx, step);
        }
        if let Some(output) = &report.output {
            println!("Output:  {}", output);
        }
    }

    result.map(|_| ()).map_err(FusionCliError::from)
}

fn cmd_doctor(
    config: Option<&Path>,
    inputs: &[(String, PathBuf)],
    json: bool,
) -> Result<(), FusionCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck::ok("fusion_version", format!("Fusion version {}", FUSION_VERSION)));

    let parsed = match config {
        None => None,
        Some(path) => match fs::read_to_string(path) {
            Err(e) => {
                checks.push(DoctorCheck::error("config", format!("Cannot read config file: {}", e)));
                None
            }
            Ok(text) => match FusionConfig::from_json(&text) {
                Ok(config) => {
                    checks.push(DoctorCheck::ok(
                        "config",
                        format!(
                            "{} streams, {} steps, output '{}'",
                            config.streams.len(),
                            config.steps.len(),
                            config.output
                        ),
                    ));
                    Some(config)
                }
                Err(e) => {
                    checks.push(DoctorCheck::error("config", format!("{}: {}", e.code(), e)));
                    None
                }
            },
        },
    };

    let mut supplied = Vec::new();
    for (name, path) in inputs {
        let check_name = format!("input:{}", name);
        supplied.push(name.as_str());
        let rows = match fs::read_to_string(path) {
            Ok(text) => StreamLoader::parse_auto(&text),
            Err(e) => {
                checks.push(DoctorCheck::error(&check_name, format!("Cannot read input file: {}", e)));
                continue;
            }
        };
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                checks.push(DoctorCheck::error(&check_name, e.to_string()));
                continue;
            }
        };

        let stream = parsed.as_ref().and_then(|c| c.stream(name));
        match (&parsed, stream) {
            (Some(_), None) => checks.push(DoctorCheck::warning(
                &check_name,
                format!("{} rows, but no stream named '{}' is configured", rows.len(), name),
            )),
            (_, Some(stream)) => {
                let missing_time = rows
                    .iter()
                    .filter(|r| !r.contains_key(&stream.time_column))
                    .count();
                if rows.is_empty() {
                    checks.push(DoctorCheck::warning(&check_name, "input has no rows".to_string()));
                } else if missing_time > 0 {
                    checks.push(DoctorCheck::warning(
                        &check_name,
                        format!(
                            "{} rows, {} without time column '{}'",
                            rows.len(),
                            missing_time,
                            stream.time_column
                        ),
                    ));
                } else {
                    checks.push(DoctorCheck::ok(&check_name, format!("{} rows", rows.len())));
                }
            }
            (None, None) => checks.push(DoctorCheck::ok(&check_name, format!("{} rows", rows.len()))),
        }
    }

    if let Some(config) = &parsed {
        for stream in &config.streams {
            if !inputs.is_empty() && !supplied.contains(&stream.name.as_str()) {
                checks.push(DoctorCheck::error(
                    &format!("input:{}", stream.name),
                    "configured stream has no input".to_string(),
                ));
            }
        }
    }

    let stdin_message = if atty::is(atty::Stream::Stdin) {
        "stdin is a TTY (pass inputs as files)"
    } else {
        "stdin is a pipe (one input may use -)"
    };
    checks.push(DoctorCheck::ok("stdin", stdin_message.to_string()));

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: FUSION_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Fusion Doctor Report");
        println!("====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(FusionCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(schema_type: SchemaType) -> Result<(), FusionCliError> {
    match schema_type {
        SchemaType::Config => {
            println!("{}", FusionConfig::example()?.to_json_pretty()?);
        }
        SchemaType::Output => {
            println!("Output rows");
            println!();
            println!("One JSON object per record of the output stream:");
            println!("- <time_column>: canonical timestamp, RFC 3339 in the reference offset");
            println!("- <column>: number or category label; null when unmatched");
            println!("- <right>.<column>: right-side columns whose names collided in a join");
            println!("- <right>.<time_column>: timestamp of the matched right record");
            println!();
            println!("Run report (--report)");
            println!();
            println!("- run_id, producer, version, computed_at, reference_offset");
            println!("- streams: {{ load, decode, windowed_out, filter, records }} per input");
            println!("- steps: [{{ index, step, stream, outcome, ... }}]");
            println!("- warnings: empty streams, unconfigured inputs, unmapped columns");
        }
    }
    Ok(())
}

// Error types

#[derive(Debug)]
enum FusionCliError {
    Io(io::Error),
    Fusion(FusionError),
    Json(serde_json::Error),
    InvalidArgument(String),
    DoctorFailed,
}

impl From<io::Error> for FusionCliError {
    fn from(e: io::Error) -> Self {
        FusionCliError::Io(e)
    }
}

impl From<FusionError> for FusionCliError {
    fn from(e: FusionError) -> Self {
        FusionCliError::Fusion(e)
    }
}

impl From<serde_json::Error> for FusionCliError {
    fn from(e: serde_json::Error) -> Self {
        FusionCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

fn fusion_hint(e: &FusionError) -> Option<String> {
    let hint = match e {
        FusionError::InvalidConfig(_) | FusionError::UnknownStream(_) | FusionError::InvalidTimezone(_) => {
            "Run 'fusion validate' for details"
        }
        FusionError::MissingInput(_) => "Pass every configured stream with --input name=path",
        FusionError::SchemaMismatch { .. } => "Check column names against the input rows",
        FusionError::ParseError(_) | FusionError::JsonError(_) => "Check JSON syntax",
        _ => return None,
    };
    Some(hint.to_string())
}

impl From<FusionCliError> for CliError {
    fn from(e: FusionCliError) -> Self {
        match e {
            FusionCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            FusionCliError::Fusion(e) => CliError {
                code: e.code().to_string(),
                hint: fusion_hint(&e),
                message: e.to_string(),
            },
            FusionCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            FusionCliError::InvalidArgument(msg) => CliError {
                code: "INVALID_ARGUMENT".to_string(),
                message: msg,
                hint: Some("See 'fusion --help'".to_string()),
            },
            FusionCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    valid: bool,
    streams: BTreeMap<String, &'static str>,
    steps: Vec<String>,
    output: Option<String>,
    error: Option<String>,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

impl DoctorCheck {
    fn ok(name: &str, message: String) -> Self {
        Self { name: name.to_string(), status: CheckStatus::Ok, message }
    }

    fn warning(name: &str, message: String) -> Self {
        Self { name: name.to_string(), status: CheckStatus::Warning, message }
    }

    fn error(name: &str, message: String) -> Self {
        Self { name: name.to_string(), status: CheckStatus::Error, message }
    }
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
