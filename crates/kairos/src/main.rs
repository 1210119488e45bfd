//! Kairos: durable sharded job scheduler
//!
//! Main binary with subcommands:
//! - `simulate`: In-process two-silo takeover demo
//! - `schedule`: Register a shard in a local store and add jobs to it
//! - `run`: Single-node runner over a local store
//! - `inspect`: Print shards and their live jobs

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kairos_jobs::{ExecutorOptions, ShardOptions, SiloAddress};

mod node;
mod simulate;

/// A job given on the command line as `name=+seconds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub delay_secs: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobSpecError {
    #[error("expected name=+seconds, got '{0}'")]
    Malformed(String),

    #[error("job name must not be empty")]
    EmptyName,

    #[error("invalid delay '{0}': expected +seconds")]
    InvalidDelay(String),
}

fn parse_job_spec(s: &str) -> Result<JobSpec, JobSpecError> {
    let (name, delay) = s
        .split_once('=')
        .ok_or_else(|| JobSpecError::Malformed(s.to_string()))?;
    if name.is_empty() {
        return Err(JobSpecError::EmptyName);
    }
    let delay_secs = delay
        .strip_prefix('+')
        .unwrap_or(delay)
        .parse::<i64>()
        .ok()
        .filter(|secs| *secs >= 0)
        .ok_or_else(|| JobSpecError::InvalidDelay(delay.to_string()))?;
    Ok(JobSpec {
        name: name.to_string(),
        delay_secs,
    })
}

#[derive(Parser)]
#[command(name = "kairos")]
#[command(about = "Durable sharded job scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Settings for a node working against a local store directory.
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Directory holding shard logs
    #[arg(long, env = "KAIROS_STORE_DIR", default_value = "./kairos-data")]
    pub store_dir: PathBuf,

    /// Silo endpoint
    #[arg(long, env = "KAIROS_SILO", default_value = "127.0.0.1:7000")]
    pub silo: String,

    /// Silo incarnation (defaults to the process start time)
    #[arg(long, env = "KAIROS_INCARNATION")]
    pub incarnation: Option<u64>,

    /// Shard name prefix
    #[arg(long, env = "KAIROS_SHARD_PREFIX", default_value = "jobs")]
    pub shard_prefix: String,

    /// Batches smaller than this wait for the flush interval
    #[arg(long, env = "KAIROS_MIN_BATCH_SIZE", default_value = "1")]
    pub min_batch_size: usize,

    /// Maximum operations per committed segment
    #[arg(long, env = "KAIROS_MAX_BATCH_SIZE", default_value = "128")]
    pub max_batch_size: usize,

    /// Flush interval for undersized batches, in milliseconds
    #[arg(long, env = "KAIROS_FLUSH_INTERVAL_MS", default_value = "50")]
    pub flush_interval_ms: u64,

    /// Jobs of one shard running at the same time
    #[arg(long, env = "KAIROS_MAX_CONCURRENT_JOBS", default_value = "16")]
    pub max_concurrent_jobs: usize,
}

impl NodeArgs {
    pub fn silo_address(&self) -> SiloAddress {
        let incarnation = self
            .incarnation
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis().max(0) as u64);
        SiloAddress::new(self.silo.clone(), incarnation)
    }

    pub fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            shard_prefix: self.shard_prefix.clone(),
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            batch_flush_interval_ms: self.flush_interval_ms,
            ..ShardOptions::default()
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            max_concurrent_jobs: self.max_concurrent_jobs,
            ..ExecutorOptions::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate two silos sharing a store and a takeover after one dies
    Simulate {
        /// Number of jobs to schedule
        #[arg(long, default_value = "5")]
        jobs: usize,

        /// Spacing between job due times, in milliseconds
        #[arg(long, default_value = "100")]
        spacing_ms: u64,

        /// Cancel every n-th job before the owner dies (0 disables)
        #[arg(long, default_value = "3")]
        cancel_every: usize,
    },

    /// Register a new shard and schedule jobs in it
    Schedule {
        #[command(flatten)]
        node: NodeArgs,

        /// Length of the shard window in minutes
        #[arg(long, default_value = "60")]
        window_minutes: i64,

        /// Jobs as name=+seconds
        #[arg(required = true, value_parser = parse_job_spec)]
        jobs: Vec<JobSpec>,
    },

    /// Run shards from the local store until interrupted
    Run {
        #[command(flatten)]
        node: NodeArgs,

        /// Claim shards starting within this many minutes
        #[arg(long, env = "KAIROS_HORIZON_MINUTES", default_value = "60")]
        horizon_minutes: i64,

        /// Seconds between assignment rounds
        #[arg(long, env = "KAIROS_ASSIGN_INTERVAL_SECS", default_value = "10")]
        assign_interval_secs: u64,

        /// New shards claimed per assignment round
        #[arg(long, env = "KAIROS_MAX_NEW_CLAIMS", default_value = "4")]
        max_new_claims: usize,

        /// Exit once every claimed shard has drained
        #[arg(long)]
        once: bool,
    },

    /// List shards and their live jobs
    Inspect {
        #[command(flatten)]
        node: NodeArgs,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "kairos=info,kairos_jobs=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            jobs,
            spacing_ms,
            cancel_every,
        } => simulate::run(jobs, spacing_ms, cancel_every).await,

        Commands::Schedule {
            node,
            window_minutes,
            jobs,
        } => node::schedule(&node, window_minutes, &jobs).await,

        Commands::Run {
            node,
            horizon_minutes,
            assign_interval_secs,
            max_new_claims,
            once,
        } => {
            node::run(
                &node,
                horizon_minutes,
                assign_interval_secs,
                max_new_claims,
                once,
            )
            .await
        }

        Commands::Inspect { node, json } => node::inspect(&node, json).await,
    }
}
