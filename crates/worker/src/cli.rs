use std::path::PathBuf;

use anyhow::bail;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use scriptorium_core::{JobId, JobStatus, NewJob};

use crate::app::{App, BackendMode};

#[derive(Debug, Parser)]
#[command(name = "scriptorium", version, about = "Transcript processing job engine")]
pub struct Cli {
    /// Settings file (YAML, TOML or JSON). Defaults to config/scriptorium.* when present.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the dispatch loops and the reaper until Ctrl-C.
    Run {
        /// Drain the pending queue once, then exit. Needs database_url.
        #[arg(long)]
        once: bool,
        /// Answer every generation call locally instead of calling backends.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one reaper sweep.
    Reap,
    /// Queue a job.
    Submit(SubmitArgs),
    /// Re-run a failed or paused job at a higher tier.
    Retry {
        id: JobId,
        /// Reset every phase from this one on, completed ones included.
        #[arg(long)]
        from_phase: Option<String>,
    },
    Cancel { id: JobId },
    Pause { id: JobId },
    Resume { id: JobId },
    /// Print one job.
    Show { id: JobId },
    /// List jobs in claim order.
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Job counts per status.
    Stats,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Source transcript key in the inbox.
    #[arg(long)]
    pub source: String,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i32,
    /// Source length; longer sources route to higher tiers.
    #[arg(long)]
    pub duration_minutes: Option<f64>,
    /// Run every phase on this tier.
    #[arg(long)]
    pub tier: Option<usize>,
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl SubmitArgs {
    pub fn into_new_job(self) -> NewJob {
        let mut job = NewJob::new(self.source).with_priority(self.priority);
        if let Some(minutes) = self.duration_minutes {
            job = job.with_duration_minutes(minutes);
        }
        if let Some(tier) = self.tier {
            job = job.with_tier_override(tier);
        }
        if let Some(max_retries) = self.max_retries {
            job = job.with_max_retries(max_retries);
        }
        job
    }
}

impl Command {
    /// Whether the command only makes sense against a shared, durable store.
    ///
    /// A long-running `run` is the only one: `run --once` would start from an
    /// empty in-memory queue and exit.
    pub fn needs_persistent_store(&self) -> bool {
        !matches!(self, Command::Run { once: false, .. })
    }

    /// Only a live `run` talks to generation backends.
    pub fn backend_mode(&self) -> BackendMode {
        match self {
            Command::Run { dry_run: false, .. } => BackendMode::Configured,
            _ => BackendMode::DryRun,
        }
    }
}

pub async fn execute(app: App, command: Command) -> anyhow::Result<()> {
    if command.needs_persistent_store() && !app.persistent {
        bail!("this command needs database_url: an in-memory store is private to one process");
    }

    match command {
        Command::Run { once: true, .. } => {
            let mut processed = 0usize;
            while let Some(report) = app.dispatcher.run_once().await? {
                info!(job_id = %report.job_id, status = %report.status, "job finished");
                processed += 1;
            }
            print_json(&json!({ "processed": processed, "stats": app.queue.stats().await? }))
        }
        Command::Run { once: false, .. } => serve(app).await,
        Command::Reap => print_json(&app.reaper.sweep_at(Utc::now()).await?),
        Command::Submit(args) => print_json(&app.queue.submit(args.into_new_job()).await?),
        Command::Retry { id, from_phase } => {
            print_json(&app.queue.retry(id, from_phase.as_deref()).await?)
        }
        Command::Cancel { id } => print_json(&app.queue.cancel(id).await?),
        Command::Pause { id } => print_json(&app.queue.pause(id).await?),
        Command::Resume { id } => print_json(&app.queue.resume(id).await?),
        Command::Show { id } => print_json(&app.queue.get(id).await?),
        Command::List { status, limit } => print_json(&app.queue.list(status, limit).await?),
        Command::Stats => print_json(&app.queue.stats().await?),
    }
}

async fn serve(app: App) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let dispatcher = app.dispatcher.spawn(shutdown.clone());
    let reaper = app.reaper.spawn(shutdown.clone());
    info!(
        slots = app.settings.dispatcher.max_concurrent_jobs,
        persistent = app.persistent,
        "worker running; Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; waiting for in-flight jobs");
    dispatcher.shutdown().await;
    reaper.await?;
    info!("worker stopped");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submit_with_negative_priority() {
        let cli = Cli::try_parse_from([
            "scriptorium",
            "submit",
            "--source",
            "ep-1.txt",
            "--priority",
            "-3",
            "--duration-minutes",
            "42.5",
            "--tier",
            "2",
        ])
        .unwrap();
        let Command::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        let job = args.into_new_job();
        assert_eq!(job.source, "ep-1.txt");
        assert_eq!(job.priority, -3);
        assert_eq!(job.duration_minutes, Some(42.5));
        assert_eq!(job.tier_override, Some(2));
        assert_eq!(job.max_retries, 3);
    }

    #[test]
    fn parses_retry_and_global_config() {
        let cli = Cli::try_parse_from([
            "scriptorium",
            "retry",
            "17",
            "--from-phase",
            "seo",
            "--config",
            "prod.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("prod.yaml")));
        match cli.command {
            Command::Retry { id, from_phase } => {
                assert_eq!(id, JobId::new(17));
                assert_eq!(from_phase.as_deref(), Some("seo"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(Cli::try_parse_from(["scriptorium", "cancel", "abc"]).is_err());
    }

    #[test]
    fn only_a_serving_run_works_without_a_database() {
        assert!(!Command::Run { once: false, dry_run: true }.needs_persistent_store());
        assert!(Command::Run { once: true, dry_run: true }.needs_persistent_store());
        assert_eq!(
            Command::Run { once: true, dry_run: true }.backend_mode(),
            BackendMode::DryRun
        );
        assert_eq!(
            Command::Run { once: false, dry_run: false }.backend_mode(),
            BackendMode::Configured
        );
        assert_eq!(Command::Stats.backend_mode(), BackendMode::DryRun);
        assert!(Command::Stats.needs_persistent_store());
    }
}
