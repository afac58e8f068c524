mod artifact;
mod audit;
mod browser;
mod config;
mod coordinator;
mod error;
mod models;
mod pipeline;
mod queue;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::audit::ZeroValueHeuristic;
use crate::browser::cleanup::kill_orphaned_browsers;
use crate::config::AppConfig;
use crate::coordinator::{Coordinator, RunOutcome, output_dir, pipeline_for_artifact, schedule};
use crate::models::{Period, PipelineId};
use crate::pipeline::RunSummary;
use crate::storage::RunLedger;

#[derive(Parser)]
#[command(name = "ojk-report-scraper", about = "OJK financial report scraper", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pipeline now
    Run {
        #[arg(short, long, value_enum)]
        pipeline: PipelineId,

        /// Artifact directory (default: output.dir from config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Report period as MM_YYYY (publikasi only; default: latest quarter)
        #[arg(long, value_parser = parse_period)]
        period: Option<Period>,
    },

    /// Run the weekly triggers and the queue poll until stopped
    Serve {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Audit an existing artifact and re-scrape its suspect entities
    Retry {
        #[arg(short, long, value_enum)]
        pipeline: PipelineId,

        #[arg(short, long)]
        artifact: PathBuf,
    },

    /// List the suspect entities of an artifact without opening a browser
    Audit {
        #[arg(short, long, value_enum)]
        pipeline: PipelineId,

        #[arg(short, long)]
        artifact: PathBuf,
    },

    /// Show queue marker files
    Queue,

    /// Show recent runs
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Terminate leftover browser processes
    Cleanup {
        /// Kill matching processes even without our profile directory
        #[arg(long)]
        all: bool,
    },
}

fn parse_period(s: &str) -> std::result::Result<Period, String> {
    Period::from_artifact_name(s).ok_or_else(|| format!("{s:?} is not MM_YYYY"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ojk_report_scraper=info,warn",
        1 => "ojk_report_scraper=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_summary(s: &RunSummary) {
    println!("─────────────────────────────────");
    println!("  Artifact      : {}", s.artifact.display());
    println!("  Entities      : {}", s.entities);
    println!("  Rows          : {}", utils::fmt_number(s.rows as i64));
    println!("  No data       : {}", s.no_data);
    println!("  Failed        : {}", s.failures);
    println!("  Suspect       : {} ({} after retry)", s.suspects, s.still_suspect);
    println!("  Took          : {:.1?}", s.elapsed);
    println!("─────────────────────────────────");
}

fn report(outcome: RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Completed(summaries) => {
            if summaries.is_empty() {
                println!("Nothing to do.");
            }
            summaries.iter().for_each(print_summary);
        }
        RunOutcome::Skipped => println!("Already running; skipped."),
    }
    ExitCode::SUCCESS
}

async fn execute(command: Command) -> Result<ExitCode> {
    let config = AppConfig::load()?;

    match command {
        Command::Run { pipeline, output, period } => {
            let _t = utils::Timer::start(format!("{} run", pipeline));
            let dir = output_dir(&config, output);
            let coordinator = Coordinator::from_config(config);
            Ok(report(coordinator.run(pipeline, &dir, period).await?))
        }

        Command::Serve { output } => {
            let dir = output_dir(&config, output);
            let coordinator = Arc::new(Coordinator::from_config(config));
            info!("Scheduler started; artifacts go to {:?}", dir);
            schedule::serve(coordinator, dir, schedule::shutdown_signal()).await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Retry { pipeline, artifact } => {
            let _t = utils::Timer::start(format!("{} retry", pipeline));
            let coordinator = Coordinator::from_config(config);
            Ok(report(coordinator.retry_artifact(pipeline, &artifact).await?))
        }

        Command::Audit { pipeline, artifact } => {
            let p = pipeline_for_artifact(&config, pipeline, &artifact)?;
            let suspects = audit::audit_artifact(&artifact, p.output_schema(), &ZeroValueHeuristic)?;
            if suspects.is_empty() {
                println!("No suspect entities in {}.", artifact.display());
            } else {
                println!("{} suspect entities:", suspects.len());
                for name in &suspects {
                    println!("  {}", name);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Queue => {
            let cfg = &config.sindikasi;
            let items = queue::list(&cfg.queue_dir, &cfg.file_prefix)?;
            if items.is_empty() {
                println!("No queue files in {}.", cfg.queue_dir.display());
            }
            for item in &items {
                println!(
                    "  [{}] {:<30} {}  → {}  ({} banks)",
                    if item.scrape { "x" } else { " " },
                    item.title,
                    item.date.format("%d-%m-%Y"),
                    Period::target_quarter(item.date),
                    item.banks.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::History { limit } => {
            let ledger = RunLedger::open(&config.storage.db_path)?;
            let runs = ledger.recent(limit)?;
            if runs.is_empty() {
                println!("No runs recorded yet.");
            }
            for r in &runs {
                println!(
                    "  #{:<4} {:<10} {}  {:<7} {:>4} entities {:>8} rows {:>3} suspect  {}",
                    r.id,
                    r.pipeline,
                    r.started_at.format("%Y-%m-%d %H:%M"),
                    r.status,
                    r.entities,
                    utils::fmt_number(r.rows_written),
                    r.still_suspect,
                    r.error_msg.as_deref().or(r.artifact.as_deref()).unwrap_or("—")
                );
                let outcomes = ledger.outcomes(r.id)?;
                if !outcomes.is_empty() {
                    let parts: Vec<String> = outcomes.iter().map(|(o, n)| format!("{o} {n}")).collect();
                    println!("         {}", parts.join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Cleanup { all } => {
            let dir = (!all).then_some(config.browser.user_data_dir.as_path());
            let killed = kill_orphaned_browsers(&config.browser.process_names, dir);
            println!("Terminated {} browser processes.", killed);
            Ok(ExitCode::SUCCESS)
        }
    }
}
