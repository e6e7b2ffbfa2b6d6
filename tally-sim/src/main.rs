//! Tally Sim - concurrency and fault-injection harness for vote consensus
//!
//! This CLI tool exercises the consensus engine and the offline queue:
//! - `run` - Run a voting scenario against a fault-injecting store and check invariants
//! - `queue` - Queue operations offline, reconnect over a flaky link and drain
//! - `list` - List the available voting scenarios

mod checker;
mod fault_injection;
mod metrics;
mod scenarios;

use clap::{Parser, Subcommand};
use fault_injection::FaultConfig;
use scenarios::{QueueScenarioConfig, RunOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "tally-sim")]
#[command(about = "Concurrency and fault-injection harness for tally vote consensus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Seed for ballot plans and fault injection
    #[arg(long, global = true, default_value = "42")]
    seed: u64,

    /// Base delay of the retry policy in milliseconds
    #[arg(long, global = true, default_value = "5")]
    base_delay_ms: u64,

    /// Back the store with a write-ahead log in this directory
    #[arg(long, global = true)]
    wal_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a voting scenario
    Run {
        /// Scenario to run
        #[arg(short, long, default_value = "happy")]
        scenario: String,

        /// Override the scenario's store fault rate (0.0-1.0)
        #[arg(long)]
        fault_rate: Option<f64>,

        /// Output directory for results
        #[arg(short = 'd', long, default_value = "./results")]
        output_dir: PathBuf,

        /// Path to write latency metrics JSON
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },

    /// Run the offline queue scenario
    Queue {
        /// Votes queued while offline
        #[arg(short, long, default_value = "12")]
        votes: usize,

        /// Failure rate of the device-to-server link (0.0-1.0)
        #[arg(long, default_value = "0.3")]
        failure_rate: f64,

        /// Queue capacity
        #[arg(long, default_value = "100")]
        max_queue_size: usize,

        /// Failed drain attempts before an operation is dropped
        #[arg(long, default_value = "3")]
        max_retries: u32,

        /// Drain passes before giving up
        #[arg(long, default_value = "10")]
        passes: usize,

        /// Output directory for results
        #[arg(short = 'd', long, default_value = "./results")]
        output_dir: PathBuf,
    },

    /// List available scenarios
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let options = RunOptions {
        seed: cli.seed,
        base_delay: Duration::from_millis(cli.base_delay_ms),
        wal_dir: cli.wal_dir,
    };

    match cli.command {
        Commands::Run {
            scenario,
            fault_rate,
            output_dir,
            metrics_file,
        } => {
            let mut config = scenarios::get_scenario(&scenario)?;
            if let Some(rate) = fault_rate {
                config.fault = config.fault.with_error_rate(rate);
            }
            info!("Running scenario: {} ({})", config.name, config.description);

            let results = scenarios::run_scenario(&config, &options).await?;

            std::fs::create_dir_all(&output_dir)?;
            let summary_path = output_dir.join(format!("{}-summary.json", config.name));
            std::fs::write(&summary_path, serde_json::to_string_pretty(&results)?)?;
            info!("Summary written to: {}", summary_path.display());

            if let Some(ref metrics_path) = metrics_file {
                let export = results.metrics.export(&config.name);
                std::fs::write(metrics_path, serde_json::to_string_pretty(&export)?)?;
                info!("Metrics written to: {}", metrics_path.display());
            }

            let summary = results.metrics.summary();
            println!("\nScenario {}:", results.scenario);
            println!("  Ballots: {}", results.ballots);
            println!("  Rooms matched: {}/{}", results.rooms_matched, config.rooms);
            println!("  Outcomes: {:?}", results.outcomes);
            println!(
                "  Injected faults: {} throttled, {} unavailable ({} calls)",
                results.faults.throttled, results.faults.unavailable, results.faults.calls
            );
            println!(
                "  Latency (min/avg/max): {}/{:.0}/{} us",
                summary.min_latency_us, summary.avg_latency_us, summary.max_latency_us
            );
            println!(
                "  Latency p50/p95: {}/{} us",
                summary.p50_latency_us, summary.p95_latency_us
            );
            println!("  Violations: {}", results.violations());

            if !results.is_valid() {
                std::process::exit(1);
            }
        }

        Commands::Queue {
            votes,
            failure_rate,
            max_queue_size,
            max_retries,
            passes,
            output_dir,
        } => {
            let config = QueueScenarioConfig {
                votes,
                link: FaultConfig::none().with_error_rate(failure_rate),
                max_queue_size,
                max_retries,
                max_passes: passes,
            };
            info!(
                "Running queue scenario: {} votes, {:.0}% link failures",
                votes,
                failure_rate * 100.0
            );

            let results = scenarios::run_queue_scenario(&config, &options).await?;

            std::fs::create_dir_all(&output_dir)?;
            let summary_path = output_dir.join("queue-summary.json");
            std::fs::write(&summary_path, serde_json::to_string_pretty(&results)?)?;
            info!("Summary written to: {}", summary_path.display());

            println!("\nQueue scenario:");
            println!("  Queued offline: {}", results.queued);
            println!("  Drain passes: {}", results.passes.len());
            println!("  Completed: {}", results.completed);
            println!("  Dropped: {:?}", results.dropped);
            println!("  Remaining: {}", results.remaining);
            println!("  Room status: {:?}", results.room_status);
        }

        Commands::List => {
            for name in scenarios::list_scenarios() {
                let config = scenarios::get_scenario(name)?;
                println!("{:<12} {}", config.name, config.description);
            }
        }
    }

    Ok(())
}
