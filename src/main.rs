use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use simmctl::adapters;
use simmctl::cli::Console;
use simmctl::config::{self, AppConfig};
use simmctl::core::{Orchestrator, Request, SimmCapacity};
use simmctl::logging::{self, LogConfig};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "simmctl")]
#[command(about = "Program, read and test Macintosh ROM SIMMs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

/// Options that can also come from the config file or `SIMMCTL_*` variables.
#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Config file to load instead of /etc/simmctl/config.toml
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SIMM capacity: 512K, 1M or 2M
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long = "capacity", global = true)]
    simm_capacity: Option<SimmCapacity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    simulation: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a ROM image to the SIMM
    Write {
        image: PathBuf,
        /// Skip reading the SIMM back afterwards
        #[arg(long)]
        no_verify: bool,
    },
    /// Save the SIMM contents to a file
    Read { output: PathBuf },
    /// Check the SIMM socket for shorted pins
    Test,
    /// Ask each chip for its manufacturer and device ID
    Identify,
    /// Update the programmer's own firmware
    FlashFirmware { image: PathBuf },
    /// List the supported SIMM capacities
    Capacities,
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the effective configuration as TOML
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.global.config.as_deref(), Some(&cli.global))
        .context("Failed to load configuration")?;

    logging::init(LogConfig {
        json: config.json,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Write { image, no_verify } => {
            let verify = config.verify_after_write && !no_verify;
            run_operation(&config, Request::Write { image, verify }).await
        }
        Commands::Read { output } => run_operation(&config, Request::Read { output }).await,
        Commands::Test => run_operation(&config, Request::ElectricalTest).await,
        Commands::Identify => run_operation(&config, Request::Identify).await,
        Commands::FlashFirmware { image } => {
            run_operation(&config, Request::FlashFirmware { image }).await
        }
        Commands::Capacities => {
            print_capacities(&config);
            Ok(())
        }
        Commands::Config {
            action: ConfigCommand::Init { path, force },
        } => init_config(&config, path, force),
    }
}

/// Connect, run one request to completion and turn its outcome into the exit status.
async fn run_operation(config: &AppConfig, request: Request) -> Result<()> {
    let adapter = adapters::get_adapter(config.simulation, &config.simulator)?;

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let mut orchestrator = Orchestrator::new(adapter, Box::new(status_tx));
    orchestrator.set_simm_capacity(config.simm_capacity)?;
    let (handle, task) = orchestrator.spawn();

    let mut console = Console::new(config.json);
    console
        .wait_for_board(
            &mut status_rx,
            Duration::from_secs(config.connect_timeout_secs),
        )
        .await?;

    handle
        .submit(request)
        .await
        .context("Programmer refused the request")?;
    let report = console.follow(&mut status_rx).await;

    drop(handle);
    task.await.context("Programmer task failed")?;

    match report {
        Some(report) if report.is_success() => Ok(()),
        Some(report) => bail!("{}", report.title),
        None => bail!("Programmer stopped before the operation finished"),
    }
}

fn print_capacities(config: &AppConfig) {
    for capacity in SimmCapacity::SUPPORTED {
        let marker = if capacity == config.simm_capacity {
            "*"
        } else {
            " "
        };
        println!("{} {:<6} {}", marker, capacity.to_string(), capacity.label());
    }
}

fn init_config(config: &AppConfig, path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from(config::CONFIG_PATH));
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }

    let written = config.write_to(&path)?;
    println!("Wrote configuration to {}", written.display());
    Ok(())
}
