use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use transcoder::{
    config::TranscodeConfig,
    control::{process_command_files, write_command, ControlCommand},
    hardware::detect_hardware,
    job::{Job, JobId, JobStatus},
    params::TranscodeParams,
    scan::scan_directory,
    snapshot::{save_snapshot, Snapshot},
    TranscodeEngine,
};

/// Batch media transcoding daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine, taking commands from the inbox and publishing a job snapshot
    Serve,
    /// Transcode the given files and exit when all of them are done
    Run {
        inputs: Vec<PathBuf>,
        /// Also queue every media file found under this directory
        #[arg(long)]
        scan: Option<PathBuf>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Transcode parameters file (JSON or TOML)
        #[arg(short, long)]
        params: Option<PathBuf>,
        /// Maximum concurrent jobs
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Render a short sample and estimate the full output size
    Preview {
        input: PathBuf,
        #[arg(short, long)]
        params: Option<PathBuf>,
    },
    /// Print detected hardware acceleration as JSON
    Hardware,
    /// Queue files on a running daemon
    Submit {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(short, long)]
        params: Option<PathBuf>,
    },
    /// Cancel one job on a running daemon
    Cancel { job_id: String },
    /// Cancel every pending and running job on a running daemon
    CancelAll,
    /// Retry every failed or cancelled job on a running daemon
    RetryAll,
    /// Retry one failed or cancelled job on a running daemon
    Retry { job_id: String },
    /// Change the concurrency cap of a running daemon
    Concurrency { max_concurrent_jobs: usize },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Commands::Serve => serve(cfg).await,
        Commands::Run { inputs, scan, output_dir, params, jobs } => {
            run_batch(cfg, inputs, scan, output_dir, params, jobs).await
        }
        Commands::Preview { input, params } => {
            let params = load_params(params.as_deref())?;
            let engine = TranscodeEngine::new(cfg);
            let estimate = engine.preview(&input, params).await?;
            println!("{}", serde_json::to_string_pretty(&estimate)?);
            Ok(())
        }
        Commands::Hardware => {
            let info = detect_hardware().await;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::Submit { inputs, output_dir, params } => {
            let inputs = inputs.iter().map(|p| absolute(p)).collect::<Result<Vec<_>>>()?;
            let output_dir = output_dir.as_deref().map(absolute).transpose()?;
            let params = load_params(params.as_deref())?;
            send(&cfg, ControlCommand::Submit { inputs, output_dir, params })
        }
        Commands::Cancel { job_id } => send(&cfg, ControlCommand::Cancel { job_id: JobId::from(job_id) }),
        Commands::CancelAll => send(&cfg, ControlCommand::CancelAll),
        Commands::RetryAll => send(&cfg, ControlCommand::RetryAll),
        Commands::Retry { job_id } => send(&cfg, ControlCommand::Retry { job_id: JobId::from(job_id) }),
        Commands::Concurrency { max_concurrent_jobs } => {
            if max_concurrent_jobs < 1 {
                bail!("Concurrency must be at least 1");
            }
            send(&cfg, ControlCommand::SetConcurrency { max_concurrent_jobs })
        }
    }
}

async fn serve(cfg: TranscodeConfig) -> Result<()> {
    info!("Transcode daemon starting");
    info!("Configuration loaded:");
    info!("  Max concurrent jobs: {}", cfg.max_concurrent_jobs);
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  Output dir: {}", cfg.output_dir.display());
    info!("  Job state dir: {}", cfg.job_state_dir.display());

    let command_dir = cfg.command_dir();
    fs::create_dir_all(&command_dir)
        .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;
    let snapshot_path = cfg.snapshot_path();

    let engine = TranscodeEngine::new(cfg.clone());
    let mut ticker = tokio::time::interval(cfg.poll_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = process_command_files(&engine, &command_dir).await {
                    warn!("Failed to process command files: {:#}", e);
                }
                if let Err(e) = save_snapshot(&Snapshot::capture(&engine), &snapshot_path) {
                    warn!("Failed to write snapshot: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping");
                break;
            }
        }
    }

    engine.shutdown().await;
    save_snapshot(&Snapshot::capture(&engine), &snapshot_path)?;
    info!("✅ All processes reaped, daemon stopped");
    Ok(())
}

async fn run_batch(
    mut cfg: TranscodeConfig,
    mut inputs: Vec<PathBuf>,
    scan: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    params: Option<PathBuf>,
    jobs: Option<usize>,
) -> Result<()> {
    if let Some(root) = scan {
        let found = scan_directory(&root)?;
        info!("Scan of {} found {} media file(s)", root.display(), found.len());
        inputs.extend(found);
    }
    if inputs.is_empty() {
        bail!("No input files given");
    }
    if let Some(jobs) = jobs {
        cfg.max_concurrent_jobs = jobs;
        cfg.validate()?;
    }

    let params = load_params(params.as_deref())?;
    let engine = TranscodeEngine::new(cfg.clone());
    engine.submit_batch(inputs, params, output_dir).await;

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = engine.wait_idle() => break,
            _ = ticker.tick() => log_progress(&engine),
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupt received, cancelling remaining jobs");
                engine.shutdown().await;
                break;
            }
        }
    }

    let mut finished = engine.list_jobs();
    finished.reverse();
    for job in &finished {
        println!("{}", summary_line(job));
    }

    let failed = finished.iter().filter(|j| j.status == JobStatus::Failed).count();
    let completed = finished.iter().filter(|j| j.status == JobStatus::Completed).count();
    let saved: i64 = finished
        .iter()
        .filter_map(|j| Some(j.input_size? as i64 - j.output_size? as i64))
        .sum();
    println!(
        "{} completed, {} failed, {} cancelled; saved {}",
        completed,
        failed,
        finished.len() - completed - failed,
        format_signed_size(saved)
    );

    if failed > 0 {
        bail!("{} job(s) failed", failed);
    }
    Ok(())
}

fn log_progress(engine: &TranscodeEngine) {
    for job in engine.list_jobs().iter().rev().filter(|j| j.status == JobStatus::Running) {
        info!("🔄 {} {:.1}%", job.file_name(), job.progress);
    }
    let pending = engine.pending_count();
    if pending > 0 {
        info!("   {} job(s) waiting for a slot", pending);
    }
}

fn summary_line(job: &Job) -> String {
    let elapsed = job.elapsed().map(format_duration).unwrap_or_else(|| "-".to_string());
    match job.status {
        JobStatus::Completed => format!(
            "✅ {} -> {} ({} -> {}, ratio {}, {})",
            job.file_name(),
            job.output.display(),
            job.input_size.map(|b| format_size(b, DECIMAL)).unwrap_or_else(|| "?".to_string()),
            job.output_size.map(|b| format_size(b, DECIMAL)).unwrap_or_else(|| "?".to_string()),
            job.compression_ratio.map(|r| format!("{:.2}", r)).unwrap_or_else(|| "?".to_string()),
            elapsed
        ),
        JobStatus::Failed => format!(
            "❌ {}: {}",
            job.file_name(),
            job.error.as_deref().unwrap_or("unknown error")
        ),
        status => format!("⏹️  {}: {}", job.file_name(), status),
    }
}

/// Helper function to format duration for logging
fn format_duration(d: chrono::Duration) -> String {
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    let seconds = d.num_seconds() % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}

fn format_signed_size(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", format_size(bytes.unsigned_abs(), DECIMAL))
    } else {
        format_size(bytes as u64, DECIMAL)
    }
}

/// Load transcode parameters from JSON or TOML, chosen by extension
fn load_params(path: Option<&Path>) -> Result<Option<TranscodeParams>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read params file: {}", path.display()))?;
    let params = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML params: {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON params: {}", path.display()))?
    };
    Ok(Some(params))
}

fn send(cfg: &TranscodeConfig, command: ControlCommand) -> Result<()> {
    let path = write_command(&cfg.command_dir(), &command)
        .context("Failed to queue command for the daemon")?;
    println!("Queued command {}", path.display());
    Ok(())
}

/// The daemon may run from another working directory
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}
