// src/main.rs - Command line entry point
use clap::{Parser, Subcommand};
use clocksim::analysis;
use clocksim::config::{self, Config};
use clocksim::simulation::SimulationController;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lamport clock simulation over a fully connected set of virtual machines
#[derive(Parser, Debug)]
#[command(name = "clocksim", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (overrides the config file and RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulation
    Run {
        /// Number of virtual machines
        #[arg(short, long)]
        machines: Option<u32>,
        /// Run length in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// First listener port; 0 picks ephemeral ports
        #[arg(long)]
        base_port: Option<u16>,
        /// Seed for rate and event draws
        #[arg(long)]
        seed: Option<u64>,
        /// Directory for machine_<id>.log files
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Analyse the logs of a finished run
    Analyze {
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Print the report as JSON instead of writing analysis_report.txt
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load(path: Option<&Path>) -> Result<Config, BoxError> {
    match path {
        Some(path) => {
            let path = path.to_str().ok_or("config path is not valid UTF-8")?;
            Ok(config::load_config(path)?)
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let mut config = load(cli.config.as_deref())?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level);
    if let Some(path) = &cli.config {
        tracing::info!("Loaded configuration from {}", path.display());
    }

    match cli.command {
        Commands::Run { machines, duration, base_port, seed, log_dir } => {
            if let Some(machines) = machines {
                config.simulation.machines = machines;
            }
            if let Some(duration) = duration {
                config.simulation.duration_secs = duration;
            }
            if let Some(base_port) = base_port {
                config.network.base_port = base_port;
            }
            if seed.is_some() {
                config.simulation.seed = seed;
            }
            if let Some(log_dir) = log_dir {
                config.logging.dir = log_dir;
            }
            std::fs::create_dir_all(&config.logging.dir)?;

            let report = SimulationController::new(config).run().await.map_err(|e| {
                tracing::error!("Simulation failed: {}", e);
                e
            })?;
            for m in &report.machines {
                println!(
                    "Machine {}: rate {}, final clock {}, {} internal / {} send / {} receive, {} pending",
                    m.id,
                    m.rate,
                    m.final_clock,
                    m.stats.internal_events,
                    m.stats.send_events,
                    m.stats.receive_events,
                    m.pending_messages
                );
            }
            println!("Clock drift between machines: {}", report.clock_drift());
            if report.interrupted {
                println!("Run was interrupted after {}ms", report.elapsed_ms);
            }
        }
        Commands::Analyze { log_dir, json } => {
            let dir = log_dir.unwrap_or_else(|| config.logging.dir.clone());
            let report = analysis::analyze_dir(&dir)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let path = report.write_to(&dir)?;
                print!("{}", report.render_text());
                println!("Report written to {}", path.display());
            }
            if !report.is_valid() {
                return Err("invariant violations found in logs".into());
            }
        }
    }
    Ok(())
}
