//! Focus CLI - Command-line interface for Focus Flux
//!
//! Commands:
//! - stream: Stream a recording through the full pipeline, printing NDJSON
//! - validate: Check a recording for malformed rows
//! - config: Print the effective configuration

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use focus_flux::message::OutboundMessage;
use focus_flux::recording::Recording;
use focus_flux::source::{FileReplaySource, ReplayConfig};
use focus_flux::{FocusConfig, FocusError, SessionOrchestrator, FLUX_VERSION, PRODUCER_NAME};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Focus - real-time concentration streaming engine
#[derive(Parser)]
#[command(name = "focus")]
#[command(version = FLUX_VERSION)]
#[command(about = "Stream concentration recordings through calibration and dip detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a recording and print every outbound message as NDJSON
    Stream {
        /// Recording to read
        #[arg(short, long)]
        input: PathBuf,

        /// How the recording is read
        #[arg(long, default_value = "replay")]
        mode: StreamMode,

        /// Delay between replayed rows, or poll period when tailing (ms)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Restart from the first row when the recording is exhausted
        #[arg(long = "loop")]
        looped: bool,

        /// Session identifier
        #[arg(long, default_value = "1")]
        session: u64,

        /// Use a known baseline instead of calibrating
        #[arg(long)]
        baseline: Option<f64>,

        /// Calibrate for this many seconds after the stream starts
        #[arg(long)]
        calibrate: Option<u64>,

        /// Stop after this many concentration updates
        #[arg(long)]
        max_events: Option<u64>,

        /// Configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check a recording for malformed rows
    Validate {
        /// Recording to check
        #[arg(short, long)]
        input: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StreamMode {
    /// Read the whole recording, pacing rows
    Replay,
    /// Follow rows appended to a recording still being written
    Tail,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("focus_flux=info,focus=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), FocusCliError> {
    match cli.command {
        Commands::Stream {
            input,
            mode,
            interval_ms,
            looped,
            session,
            baseline,
            calibrate,
            max_events,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(ms) = interval_ms {
                match mode {
                    StreamMode::Replay => config.replay_interval_ms = ms,
                    StreamMode::Tail => config.tail_poll_ms = ms,
                }
            }
            config.loop_replay |= looped;
            config.validate()?;

            let replay = match mode {
                StreamMode::Replay => ReplayConfig::replay(&input, config.replay_interval(), config.loop_replay),
                StreamMode::Tail => ReplayConfig::tail(&input, config.tail_poll()),
            };
            let options = StreamOptions {
                session,
                baseline,
                calibrate: calibrate.map(Duration::from_secs),
                max_events,
            };

            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            runtime.block_on(cmd_stream(config, replay, options))
        }

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<FocusConfig, FocusCliError> {
    match path {
        Some(path) => Ok(FocusConfig::load(path)?),
        None => Ok(FocusConfig::default()),
    }
}

struct StreamOptions {
    session: u64,
    baseline: Option<f64>,
    calibrate: Option<Duration>,
    max_events: Option<u64>,
}

async fn cmd_stream(
    config: FocusConfig,
    replay: ReplayConfig,
    options: StreamOptions,
) -> Result<(), FocusCliError> {
    let session_id = options.session;
    let orchestrator = Arc::new(SessionOrchestrator::new(config));
    orchestrator.create_session(session_id);
    if let Some(baseline) = options.baseline {
        orchestrator.import_baseline(session_id, baseline)?;
    }

    let mut subscription = orchestrator.registry().connect(session_id).await;
    info!(producer = PRODUCER_NAME, path = %replay.path.display(), "Streaming recording");
    orchestrator
        .start_streaming(session_id, Box::new(FileReplaySource::new(session_id, replay)))
        .await?;

    if let Some(duration) = options.calibrate {
        orchestrator.start_calibration(session_id, Some(duration)).await?;
    }
    let calibration_due = tokio::time::sleep(options.calibrate.unwrap_or_default());
    tokio::pin!(calibration_due);
    let mut calibrating = options.calibrate.is_some();

    let stdout = io::stdout();
    let mut updates = 0u64;
    let result = loop {
        tokio::select! {
            _ = &mut calibration_due, if calibrating => {
                calibrating = false;
                if let Err(e) = orchestrator.complete_calibration(session_id).await {
                    warn!(session_id, error = %e, "Calibration did not produce a baseline");
                }
            }
            message = subscription.recv() => {
                let Some(message) = message else { break Ok(()) };
                let mut out = stdout.lock();
                writeln!(out, "{}", serde_json::to_string(message.as_ref())?)?;
                out.flush()?;

                match message.as_ref() {
                    OutboundMessage::ConcentrationUpdate { .. } => {
                        updates += 1;
                        if options.max_events.is_some_and(|max| updates >= max) {
                            break Ok(());
                        }
                    }
                    OutboundMessage::StreamStopped { .. } => break Ok(()),
                    OutboundMessage::SourceFailed { reason, .. } => {
                        break Err(FocusCliError::Focus(FocusError::SourceFailed(reason.clone())));
                    }
                    _ => {}
                }
            }
        }
    };

    orchestrator.registry().disconnect(&subscription.handle()).await;
    orchestrator.shutdown().await;
    info!(session_id, updates, "Stream finished");
    result
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), FocusCliError> {
    let text = fs::read_to_string(input)?;
    let report = Recording::parse(&text).report();

    if json || !atty::is(atty::Stream::Stdout) {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Recording Report");
        println!("================");
        println!("Data rows:      {}", report.data_rows);
        println!("Malformed rows: {}", report.malformed_rows);
        println!("Marker rows:    {}", report.metadata_rows);
        if let Some(start) = &report.session_start {
            println!("Session start:  {}", start);
        }
        if let Some(stop) = &report.session_stop {
            println!("Session stop:   {}", stop);
        }
        println!("Duration:       {:.0}s", report.duration_secs);
        if let Some(mean) = report.mean_concentration {
            println!("Mean focus:     {:.1}", mean);
        }

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - {}", err);
            }
        }
    }

    if report.malformed_rows > 0 {
        Err(FocusCliError::ValidationFailed(report.malformed_rows))
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum FocusCliError {
    Io(io::Error),
    Focus(FocusError),
    Json(serde_json::Error),
    ValidationFailed(usize),
}

impl From<io::Error> for FocusCliError {
    fn from(e: io::Error) -> Self {
        FocusCliError::Io(e)
    }
}

impl From<FocusError> for FocusCliError {
    fn from(e: FocusError) -> Self {
        FocusCliError::Focus(e)
    }
}

impl From<serde_json::Error> for FocusCliError {
    fn from(e: serde_json::Error) -> Self {
        FocusCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
    retryable: bool,
}

impl From<FocusCliError> for CliError {
    fn from(e: FocusCliError) -> Self {
        match e {
            FocusCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
                retryable: true,
            },
            FocusCliError::Focus(e) => {
                let (code, hint) = match &e {
                    FocusError::Config(_) => ("CONFIG_ERROR", Some("Run 'focus config' to see the defaults")),
                    FocusError::SourceUnavailable(_) => ("SOURCE_UNAVAILABLE", Some("Check that the recording exists")),
                    FocusError::SourceFailed(_) => ("SOURCE_FAILED", None),
                    FocusError::MalformedRecord(_) => ("MALFORMED_RECORD", Some("Run 'focus validate' for details")),
                    _ => ("PIPELINE_ERROR", None),
                };
                CliError {
                    code: code.to_string(),
                    retryable: e.is_retryable(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
            FocusCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
                retryable: false,
            },
            FocusCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} rows failed validation", count),
                hint: Some("Fix or remove the listed rows".to_string()),
                retryable: false,
            },
        }
    }
}
