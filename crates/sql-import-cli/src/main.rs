//! sql-import CLI - batched table import with checksum verification.

use clap::{Parser, Subcommand};
use sql_import::job::HealthCheckResult;
use sql_import::{
    Config, FileJobStore, ImportError, JobService, JobStatus, JobStore, JobSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "sql-import")]
#[command(about = "Batched import of SQL Server tables with checksum verification")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a mapping against the target's stored fields
    Validate {
        /// Mapping name
        #[arg(long)]
        mapping: String,
    },

    /// Transform the first rows of a mapping without writing anything
    Preview {
        /// Mapping name
        #[arg(long)]
        mapping: String,

        /// Number of source rows to sample
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Create and run a job for a mapping
    Run {
        /// Mapping name
        #[arg(long)]
        mapping: String,

        /// Verify checksums after the import, regardless of the mapping setting
        #[arg(long)]
        verify: bool,
    },

    /// Re-run checksum verification for a finished job
    Verify {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// Create a new job over the same mapping as a finished one
    Retry {
        /// Job id
        #[arg(long)]
        job: String,

        /// Start the new job immediately
        #[arg(long)]
        run: bool,
    },

    /// Request cancellation of a job
    Cancel {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// Show a job's status and progress
    Status {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// Print a job's verification report
    Report {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// List stored jobs
    List,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ImportError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    let hash = config.hash();
    info!(
        "Loaded configuration from {:?} (hash {})",
        cli.config,
        &hash[..12]
    );

    match cli.command {
        // Job store commands never touch the databases.
        Commands::Status { job } => {
            let store = FileJobStore::new(&config.state_dir)?;
            let summary = load_job(&store, &job).await?.summary();
            print_summary(&summary, cli.output_json)?;
        }

        Commands::Report { job } => {
            let store = FileJobStore::new(&config.state_dir)?;
            let job = load_job(&store, &job).await?;
            match job.verification_report {
                Some(report) if cli.output_json => {
                    println!("{}", serde_json::json!({ "job": job.id, "report": report }))
                }
                Some(report) => println!("{}", report),
                None => println!("No verification report for job {}", job.id),
            }
        }

        Commands::List => {
            let store = FileJobStore::new(&config.state_dir)?;
            let jobs: Vec<JobSummary> = store.list().await?.iter().map(|j| j.summary()).collect();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs");
            } else {
                for job in &jobs {
                    println!(
                        "{}  {:<10} {:<20} {}/{} ({} failed)",
                        job.id,
                        job.status,
                        job.mapping,
                        job.imported_records,
                        job.total_records,
                        job.failed_records
                    );
                }
            }
        }

        Commands::Cancel { job } => {
            // Another process running the job notices at its next batch.
            let store = FileJobStore::new(&config.state_dir)?;
            let mut job = load_job(&store, &job).await?;
            job.cancel()?;
            store.save(&job).await?;
            print_summary(&job.summary(), cli.output_json)?;
        }

        Commands::Retry { job, run: false } => {
            let store = FileJobStore::new(&config.state_dir)?;
            let job = load_job(&store, &job).await?;
            if job.status == JobStatus::Running {
                return Err(ImportError::invalid_state(&job.id, job.status, "retry"));
            }
            let retry = job.retry();
            store.save(&retry).await?;
            println!("Created job {} (retry of {})", retry.id, job.id);
        }

        command => {
            let cancel_token = setup_signal_handler();
            let service = JobService::connect(&config)
                .await?
                .with_shutdown(cancel_token);
            run_connected(&service, command, cli.output_json).await?;
        }
    }

    Ok(())
}

/// Commands that need both databases.
async fn run_connected(
    service: &JobService,
    command: Commands,
    output_json: bool,
) -> Result<(), ImportError> {
    match command {
        Commands::Validate { mapping } => {
            service.validate_mapping(&mapping).await?;
            println!("Mapping '{}' is valid", mapping);
        }

        Commands::Preview { mapping, limit } => {
            let preview = service.preview(&mapping, limit).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&preview)?);
            } else {
                println!("Preview of '{}' ({})", preview.mapping, preview.columns.join(", "));
                for (i, row) in preview.rows.iter().enumerate() {
                    match (&row.record, &row.error) {
                        (Some(record), _) => println!("  {:>3}: {}", i + 1, record),
                        (None, Some(err)) => println!("  {:>3}: ERROR {}", i + 1, err),
                        (None, None) => {}
                    }
                }
                println!("\n  {}/{} rows ok", preview.ok_count(), preview.rows.len());
            }
        }

        Commands::Run { mapping, verify } => {
            let mut descriptor = service.mapping(&mapping)?.clone();
            if verify {
                descriptor.verification.enabled = true;
            }
            let id = service.create_job_from(descriptor).await?;
            finish(service.start_job(&id).await?, output_json)?;
        }

        Commands::Retry { job, .. } => {
            let id = service.retry_job(&job).await?;
            info!("Created job {} (retry of {})", id, job);
            finish(service.start_job(&id).await?, output_json)?;
        }

        Commands::Verify { job } => {
            let summary = service.verify_job(&job).await?;
            print_summary(&summary, output_json)?;
            if !output_json {
                if let Some(report) = service.get_verification_report(&job).await? {
                    println!("\n{}", report);
                }
            }
        }

        Commands::HealthCheck => {
            let result = service.health_check().await;
            print_health(&result, output_json)?;
            if !result.healthy {
                return Err(ImportError::Connection("Health check failed".to_string()));
            }
        }

        Commands::Status { .. }
        | Commands::Report { .. }
        | Commands::List
        | Commands::Cancel { .. } => unreachable!(), // Handled without connecting
    }

    Ok(())
}

async fn load_job(store: &FileJobStore, id: &str) -> Result<sql_import::Job, ImportError> {
    store
        .load(id)
        .await?
        .ok_or_else(|| ImportError::NotFound(format!("job {}", id)))
}

/// Print a finished run, mapping a cancelled job to the cancelled exit code.
fn finish(summary: JobSummary, output_json: bool) -> Result<(), ImportError> {
    print_summary(&summary, output_json)?;
    if summary.status == JobStatus::Cancelled {
        return Err(ImportError::Cancelled);
    }
    Ok(())
}

fn print_summary(summary: &JobSummary, output_json: bool) -> Result<(), ImportError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("\nJob {}", summary.id);
    println!("  Name: {}", summary.name);
    println!("  Mapping: {}", summary.mapping);
    println!("  Status: {}", summary.status);
    println!(
        "  Records: {}/{} imported, {} failed ({:.1}%)",
        summary.imported_records,
        summary.total_records,
        summary.failed_records,
        summary.progress_percent
    );
    println!(
        "  Verification: {} ({} mismatches)",
        summary.verification_status, summary.mismatch_count
    );
    if let Some(duration) = summary.duration_seconds {
        println!("  Duration: {:.2}s", duration);
    }
    if let Some(ref err) = summary.error_message {
        println!("  Error: {}", err);
    }
    Ok(())
}

fn print_health(result: &HealthCheckResult, output_json: bool) -> Result<(), ImportError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("Health Check Results:");
    println!(
        "  Source (MSSQL): {} ({}ms)",
        if result.source_connected { "OK" } else { "FAILED" },
        result.source_latency_ms
    );
    if let Some(ref err) = result.source_error {
        println!("    Error: {}", err);
    }
    println!(
        "  Target (PostgreSQL): {} ({}ms)",
        if result.target_connected { "OK" } else { "FAILED" },
        result.target_latency_ms
    );
    if let Some(ref err) = result.target_error {
        println!("    Error: {}", err);
    }
    println!(
        "\n  Overall: {}",
        if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
    );
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// SIGINT and SIGTERM stop the running job at its next batch boundary.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Failed to set up {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Stopping after the current batch...", name);
            token.cancel();
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
            token.cancel();
        }
    });

    cancel_token
}
