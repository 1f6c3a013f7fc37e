//! Courier: scheduled social publishing
//!
//! Main binary with subcommands:
//! - `daemon`: Run the scheduler, retry promoter, lease reaper and publish workers
//! - `migrate`: Apply the Postgres schema

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use courier_dispatch::DispatchConfig;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;
mod migrate;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Scheduled multi-platform social publishing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch daemon
    Daemon {
        /// Postgres connection string. Without one, state lives in memory.
        #[arg(long, env = "COURIER_DATABASE_URL")]
        database_url: Option<String>,

        /// Maximum pooled database connections
        #[arg(long, env = "COURIER_DB_MAX_CONNECTIONS", default_value = "10")]
        max_connections: u32,

        #[command(flatten)]
        dispatch: DispatchArgs,
    },

    /// Apply pending database migrations
    Migrate {
        /// Postgres connection string
        #[arg(long, env = "COURIER_DATABASE_URL")]
        database_url: String,
    },
}

/// Dispatch core tuning. Durations are in seconds.
#[derive(Args)]
struct DispatchArgs {
    /// Concurrent publish workers
    #[arg(long, env = "COURIER_WORKER_COUNT", default_value = "5")]
    worker_count: usize,

    #[arg(long, env = "COURIER_SCHEDULER_TICK_SECS", default_value = "30")]
    scheduler_tick: u64,

    #[arg(long, env = "COURIER_RETRY_TICK_SECS", default_value = "60")]
    retry_tick: u64,

    /// In-flight attempts untouched this long are released
    #[arg(long, env = "COURIER_LEASE_TIMEOUT_SECS", default_value = "60")]
    lease_timeout: u64,

    /// Posts older than this when first seen are not dispatched
    #[arg(long, env = "COURIER_CATCH_UP_GRACE_SECS", default_value = "300")]
    catch_up_grace: u64,

    #[arg(long, env = "COURIER_BACKOFF_BASE_SECS", default_value = "60")]
    backoff_base: u64,

    #[arg(long, env = "COURIER_BACKOFF_CEILING_SECS", default_value = "900")]
    backoff_ceiling: u64,

    /// Publish tries per platform attempt
    #[arg(long, env = "COURIER_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    #[arg(long, env = "COURIER_PUBLISH_TIMEOUT_SECS", default_value = "30")]
    publish_timeout: u64,

    /// Refresh tokens expiring within this window
    #[arg(long, env = "COURIER_CREDENTIAL_SKEW_SECS", default_value = "300")]
    credential_skew: u64,

    #[arg(long, env = "COURIER_QUEUE_CAPACITY", default_value = "1024")]
    queue_capacity: usize,

    /// Events buffered per subscriber before the oldest are dropped
    #[arg(long, env = "COURIER_SUBSCRIBER_BUFFER", default_value = "64")]
    subscriber_buffer: usize,
}

impl DispatchArgs {
    fn into_config(self) -> DispatchConfig {
        DispatchConfig {
            worker_count: self.worker_count,
            scheduler_tick: Duration::from_secs(self.scheduler_tick),
            retry_tick: Duration::from_secs(self.retry_tick),
            lease_timeout: Duration::from_secs(self.lease_timeout),
            catch_up_grace: Duration::from_secs(self.catch_up_grace),
            backoff_base: Duration::from_secs(self.backoff_base),
            backoff_ceiling: Duration::from_secs(self.backoff_ceiling),
            max_attempts: self.max_attempts,
            publish_timeout: Duration::from_secs(self.publish_timeout),
            credential_skew: Duration::from_secs(self.credential_skew),
            dispatch_queue_capacity: self.queue_capacity,
            subscriber_buffer: self.subscriber_buffer,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "courier=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            database_url,
            max_connections,
            dispatch,
        } => daemon::run(database_url.as_deref(), max_connections, dispatch.into_config()).await,

        Commands::Migrate { database_url } => migrate::run(&database_url).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_daemon_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["courier", "daemon"]).unwrap();
        let Commands::Daemon { dispatch, .. } = cli.command else {
            panic!("expected daemon");
        };
        assert_eq!(dispatch.into_config(), DispatchConfig::default());
    }

    #[test]
    fn test_daemon_flags_override() {
        let cli = Cli::try_parse_from([
            "courier",
            "daemon",
            "--worker-count",
            "12",
            "--max-attempts",
            "5",
        ])
        .unwrap();
        let Commands::Daemon { dispatch, .. } = cli.command else {
            panic!("expected daemon");
        };
        let config = dispatch.into_config();
        assert_eq!(config.worker_count, 12);
        assert_eq!(config.max_attempts, 5);
    }
}
