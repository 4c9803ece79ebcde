//! drover - a SQLite-backed job dispatcher for HPC batch arrays.
//!
//! Usage:
//!   drover run <db_file> <command>   Run a worker against the database
//!   drover import <csv_file>         Import a CSV into a new database
//!   drover add <csv_file> --db-path  Add jobs to an existing database
//!   drover export <db_file>          Export the database back to CSV
//!   drover stats <db_file>           Show progress counts
//!   drover reset <db_file>           Reset jobs to pending

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info, warn};

use drover::csvio;
use drover::{ArgMode, JobStatus, JobStore, Worker, WorkerOptions};

/// drover - dispatch jobs from a shared SQLite store across workers
#[derive(Parser)]
#[command(name = "drover")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker: claim and execute jobs until none remain
    Run {
        /// SQLite database file with the jobs table
        #[arg(value_name = "DB_FILE")]
        db_file: PathBuf,

        /// Command template executed for each job (shell syntax, e.g.
        /// "bash run.sh")
        #[arg(value_name = "COMMAND")]
        command: String,

        /// Maximum total runtime in seconds before the worker stops
        /// claiming
        #[arg(long, default_value_t = 86_400)]
        max_runtime: u64,

        /// Headroom in seconds left unclaimed at the end of the runtime
        #[arg(long, default_value_t = 0)]
        margin_time: u64,

        /// Speed factor applied to estimates for deadline admission
        #[arg(long, default_value_t = 1.0)]
        speed_factor: f64,

        /// Skip jobs whose estimated time exceeds the remaining budget
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        smart_scheduling: bool,

        /// Pass params as --name value pairs instead of positionally
        #[arg(long)]
        named_args: bool,

        /// Number of jobs run concurrently by this worker
        #[arg(long, default_value_t = 1)]
        parallel: usize,

        /// Seconds to wait between claim attempts while dependencies are
        /// in flight
        #[arg(long, default_value_t = 30)]
        dep_wait_interval: u64,
    },

    /// Import a CSV file into a job database
    Import {
        /// CSV file with a header row
        #[arg(value_name = "CSV_FILE")]
        csv_file: PathBuf,

        /// Database path (default: CSV path with .db extension)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },

    /// Add jobs from a CSV file to an existing database
    Add {
        /// CSV file with a header row matching the database schema
        #[arg(value_name = "CSV_FILE")]
        csv_file: PathBuf,

        /// Database to add to
        #[arg(long)]
        db_path: PathBuf,
    },

    /// Export a job database to CSV
    Export {
        /// Database to export
        #[arg(value_name = "DB_FILE")]
        db_file: PathBuf,

        /// CSV output path (default: database path with .csv extension)
        #[arg(long)]
        csv_path: Option<PathBuf>,

        /// Only export jobs with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show job counts by status, with pending broken down by readiness
    Stats {
        /// Database to inspect
        #[arg(value_name = "DB_FILE")]
        db_file: PathBuf,

        /// Emit machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Reset jobs to pending, clearing execution bookkeeping
    Reset {
        /// Database to reset
        #[arg(value_name = "DB_FILE")]
        db_file: PathBuf,

        /// Only reset jobs with this status
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            db_file,
            command,
            max_runtime,
            margin_time,
            speed_factor,
            smart_scheduling,
            named_args,
            parallel,
            dep_wait_interval,
        } => {
            run_worker(
                db_file,
                WorkerOptions {
                    command,
                    arg_mode: if named_args {
                        ArgMode::Named
                    } else {
                        ArgMode::Positional
                    },
                    parallel: parallel.max(1),
                    max_runtime,
                    margin_time,
                    speed_factor,
                    smart_scheduling,
                    dep_wait_interval,
                },
            )
            .await
        }
        Commands::Import { csv_file, db_path } => {
            let db_path = db_path.unwrap_or_else(|| csvio::default_db_path(&csv_file));
            match csvio::import(&csv_file, &db_path).await {
                Ok(count) => {
                    info!("imported {} job(s) into {}", count, db_path.display());
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            }
        }
        Commands::Add { csv_file, db_path } => match csvio::add(&csv_file, &db_path).await {
            Ok(count) => {
                info!("added {} job(s) to {}", count, db_path.display());
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        },
        Commands::Export {
            db_file,
            csv_path,
            status,
        } => {
            let csv_path = csv_path.unwrap_or_else(|| csvio::default_csv_path(&db_file));
            match parse_status_filter(status.as_deref()) {
                Ok(filter) => match csvio::export(&db_file, &csv_path, filter).await {
                    Ok(count) => {
                        info!("exported {} job(s) to {}", count, csv_path.display());
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(e),
            }
        }
        Commands::Stats { db_file, json } => show_stats(db_file, json).await,
        Commands::Reset { db_file, status } => match parse_status_filter(status.as_deref()) {
            Ok(filter) => reset_jobs(db_file, filter).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn parse_status_filter(status: Option<&str>) -> Result<Option<JobStatus>, String> {
    match status {
        None => Ok(None),
        Some(text) => JobStatus::parse(text).map(Some).ok_or_else(|| {
            format!(
                "unknown status '{}' (expected pending, running, done, or error)",
                text
            )
        }),
    }
}

async fn run_worker(db_file: PathBuf, options: WorkerOptions) -> Result<(), String> {
    let store = JobStore::open(&db_file)
        .await
        .map_err(|e| e.to_string())?;

    info!("database: {}", db_file.display());
    info!("command: {}", options.command);
    info!(
        "max runtime: {}s, margin: {}s, speed factor: {}, smart scheduling: {}",
        options.max_runtime, options.margin_time, options.speed_factor, options.smart_scheduling
    );
    info!(
        "parallel slots: {}, argument mode: {}",
        options.parallel,
        match options.arg_mode {
            ArgMode::Positional => "positional",
            ArgMode::Named => "named",
        }
    );

    // Ctrl-C stops claiming; in-flight jobs drain and commit. A second
    // signal is left to the host scheduler's hard kill.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping claims; in-flight jobs continue");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    let worker = Worker::new(Arc::new(store), options).with_shutdown(shutdown);
    let summary = worker.run().await.map_err(|e| e.to_string())?;

    // Individual job failures are recorded in the store, not reflected in
    // the exit code.
    info!(
        "done: {} completed, {} failed",
        summary.completed, summary.failed
    );
    Ok(())
}

async fn show_stats(db_file: PathBuf, json: bool) -> Result<(), String> {
    let store = JobStore::open(&db_file)
        .await
        .map_err(|e| e.to_string())?;
    let snapshot = store.snapshot().await.map_err(|e| e.to_string())?;
    store.close().await;

    if json {
        let rendered =
            serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())?;
        println!("{}", rendered);
    } else {
        print!("{}", snapshot);
    }
    Ok(())
}

async fn reset_jobs(db_file: PathBuf, filter: Option<JobStatus>) -> Result<(), String> {
    let store = JobStore::open(&db_file)
        .await
        .map_err(|e| e.to_string())?;
    let count = store.reset(filter).await.map_err(|e| e.to_string())?;
    store.close().await;
    info!("reset {} job(s) to pending", count);
    Ok(())
}
