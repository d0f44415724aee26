use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nova_vmops::{
    Flavor, Instance, RequestContext, VmOps, VmOpsConfig, check_resize,
    fake::{Call, Scenario},
    logger,
    progress::{ProgressReporter, progress_percent},
    session::ProductVersion,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Parser)]
#[command(name = "nova-vmops")]
#[command(about = "Xen VM resize and cold-migration driver")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the vmops configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a resize between two allocations is allowed
    CheckResize {
        /// Current root disk size in GB
        #[arg(long)]
        root_gb: u64,
        /// Current ephemeral disk size in GB
        #[arg(long, default_value_t = 0)]
        ephemeral_gb: u64,
        /// Requested root disk size in GB
        #[arg(long)]
        new_root_gb: u64,
        /// Requested ephemeral disk size in GB
        #[arg(long, default_value_t = 0)]
        new_ephemeral_gb: u64,
    },
    /// Show which resize call a host product uses
    ResizeFunc {
        /// Product brand (e.g. "XenServer", "XCP")
        brand: String,
        /// Product version as major.minor.micro
        version: String,
    },
    /// Run a resize scenario against the in-memory hypervisor
    Simulate {
        /// Scenario TOML file
        scenario: PathBuf,
        /// Revert the resize afterwards, as after a failed or cancelled resize
        #[arg(long)]
        revert: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Output path (defaults to the user config directory)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[derive(Default)]
struct RecordingProgress {
    steps: Mutex<Vec<(u32, u32)>>,
}

impl RecordingProgress {
    fn steps(&self) -> Vec<(u32, u32)> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressReporter for RecordingProgress {
    fn update_progress(
        &self,
        _context: &RequestContext,
        _instance: &Instance,
        step: u32,
        total: u32,
    ) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((step, total));
    }
}

#[derive(Serialize)]
struct SimulationReport {
    instance: String,
    migrated: bool,
    error: Option<String>,
    revert: Option<String>,
    progress: Vec<(u32, u32)>,
    calls: Vec<Call>,
    vms: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    if cli.verbose {
        logger::init_logger_with("nova_vmops=debug");
    } else {
        logger::init_logger_with(&config.logging.filter);
    }

    match cli.command {
        Commands::CheckResize {
            root_gb,
            ephemeral_gb,
            new_root_gb,
            new_ephemeral_gb,
        } => {
            let current = Flavor::new(root_gb, ephemeral_gb);
            let requested = Flavor::new(new_root_gb, new_ephemeral_gb);
            match check_resize(current, requested) {
                Ok(direction) => println!("Resize allowed: {}", direction),
                Err(err) => {
                    println!("Resize rejected: {}", err);
                    std::process::exit(1);
                }
            }
        }
        Commands::ResizeFunc { brand, version } => {
            let version = parse_product_version(&version)?;
            let func = nova_vmops::ResizeFunc::for_product(Some(brand.as_str()), Some(version));
            println!("{}", func.as_str());
        }
        Commands::Simulate {
            scenario,
            revert,
            json,
        } => {
            let scenario = Scenario::from_file(&scenario)
                .with_context(|| format!("failed to load scenario {}", scenario.display()))?;
            let report = simulate(&scenario, config, revert).await?;
            print_report(&report, json)?;
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Init { path, force } => {
                let path = path.unwrap_or_else(VmOpsConfig::default_path);
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists, pass --force to overwrite",
                        path.display()
                    );
                }
                VmOpsConfig::default().save_to_file(&path)?;
                println!("Wrote default configuration to {}", path.display());
            }
            ConfigCommands::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<VmOpsConfig> {
    let path = match path {
        Some(path) => path.clone(),
        None => VmOpsConfig::default_path(),
    };

    if path.exists() {
        VmOpsConfig::from_file(&path)
            .with_context(|| format!("failed to load config {}", path.display()))
    } else {
        Ok(VmOpsConfig::default())
    }
}

fn parse_product_version(raw: &str) -> Result<ProductVersion> {
    let mut parts = raw.split('.').map(|part| part.trim().parse::<u32>());
    let mut next = || -> Result<u32> {
        match parts.next() {
            Some(part) => part.with_context(|| format!("invalid product version '{}'", raw)),
            None => Ok(0),
        }
    };
    Ok(ProductVersion(next()?, next()?, next()?))
}

async fn simulate(
    scenario: &Scenario,
    config: VmOpsConfig,
    revert: bool,
) -> Result<SimulationReport> {
    let (session, _vm) = scenario.build()?;
    let session = Arc::new(session);
    let progress = Arc::new(RecordingProgress::default());
    let vmops = VmOps::new(session.clone(), config).with_progress(progress.clone());

    let context = RequestContext::new();
    let migrated = vmops
        .migrate_disk_and_power_off(
            &context,
            &scenario.instance,
            &scenario.destination,
            scenario.flavor,
            &scenario.block_devices,
        )
        .await;

    let error = migrated.as_ref().err().map(|err| err.to_string());
    let revert = if revert {
        session.clear_failures();
        let outcome = vmops
            .finish_revert_migration(&scenario.instance, &scenario.block_devices)
            .await?;
        Some(format!("{:?}", outcome))
    } else {
        None
    };

    Ok(SimulationReport {
        instance: scenario.instance.name.clone(),
        migrated: migrated.is_ok(),
        error,
        revert,
        progress: progress.steps(),
        calls: session.calls(),
        vms: session.vm_names(),
    })
}

fn print_report(report: &SimulationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Resize of '{}'", report.instance);
    println!("{}", "=".repeat(50));
    for (step, total) in &report.progress {
        println!("  step {}/{} ({}%)", step, total, progress_percent(*step, *total));
    }
    match &report.error {
        None => println!("Disks migrated, source VM powered off"),
        Some(err) => println!("Migration failed: {}", err),
    }
    if let Some(outcome) = &report.revert {
        println!("Revert: {}", outcome);
    }

    println!();
    println!("{} hypervisor call(s):", report.calls.len());
    for call in &report.calls {
        println!("  {}", serde_json::to_string(call)?);
    }
    println!("VMs on host: {}", report.vms.join(", "));
    Ok(())
}
