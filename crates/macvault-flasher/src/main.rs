//! Provisioning front end: take the next free address from the pool, burn it
//! into the NIC, and record who got it.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use log::{info, warn};
use macvault_core::{
    allocation,
    config::MacvaultConfig,
    logging, oplog,
    workflow::{
        self, ProvisionRequest, ProvisionSettings, Provisioner, WorkflowLevel, WorkflowReport,
        ACTION_FAILED,
    },
    MacAddress, MacvaultError, OperationRecord, PoolRepository,
};
use macvault_provider::{CommandRunner, SecretInput, SystemInfo};
use macvault_system::{SystemPorts, TerminalSecret};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

const UNKNOWN_PRODUCT: &str = "Unknown";

#[derive(Parser, Debug)]
#[command(
    name = "macvault-flash",
    version,
    about = "Write the next available pool MAC address into this machine's NIC."
)]
struct Cli {
    /// Encrypted pool file; overrides `pool.path` from the configuration.
    #[arg(long)]
    pool: Option<PathBuf>,

    /// Path to the macvault configuration file (default: $MACVAULT_CONFIG or /etc/macvault.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the vendor driver sources and programming utility.
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Do not offer a reboot after flashing.
    #[arg(long)]
    no_reboot: bool,

    /// Do not write the operation log to disk.
    #[arg(long)]
    no_log: bool,

    /// Ship the operation log to `user@host:path` with scp.
    #[arg(long)]
    server: Option<String>,
}

/// Where the completed-operation record goes.
struct Archive {
    dir: Option<PathBuf>,
    server: Option<String>,
}

impl Archive {
    fn from_cli(cli: &Cli, config: &MacvaultConfig) -> Self {
        Self {
            dir: (config.oplog.enabled && !cli.no_log).then(|| config.oplog.dir.clone()),
            server: cli.server.clone().or_else(|| config.oplog.server.clone()),
        }
    }

    fn store<R, S>(
        &self,
        runner: &R,
        system: &S,
        product: &str,
        address: &MacAddress,
        action: &str,
        success: bool,
    ) where
        R: CommandRunner<Error = MacvaultError>,
        S: SystemInfo,
    {
        if self.dir.is_none() && self.server.is_none() {
            return;
        }
        println!("Creating operation log...");
        let record = OperationRecord::capture(system, product, address, action, success);

        if let Some(dir) = &self.dir {
            match record.write_to_dir(dir) {
                Ok(path) => println!("Log saved to: {}", path.display()),
                Err(err) => warn!("could not write operation log: {err}"),
            }
        }
        if let Some(server) = &self.server {
            match oplog::ship(runner, &record, server) {
                Ok(destination) => println!("Log sent to server: {destination}"),
                Err(err) => warn!("could not send operation log: {err}"),
            }
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    workflow::ensure_root()?;

    let config_path = MacvaultConfig::resolve_path(cli.config.as_deref());
    let mut config = MacvaultConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    if let Some(workdir) = &cli.workdir {
        config.driver.workdir = workdir.clone();
    }
    config
        .ensure_valid()
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    let archive = Archive::from_cli(&cli, &config);

    println!("Starting MAC address flashing tool...");
    let SystemPorts {
        runner,
        driver,
        programmer,
        network,
        system,
    } = SystemPorts::from_config(&config.driver).context("failed to set up host tools")?;

    let product = match system.product_name() {
        Ok(name) => name,
        Err(err) => {
            warn!("could not get product name: {err}; using '{UNKNOWN_PRODUCT}'");
            UNKNOWN_PRODUCT.to_string()
        }
    };
    println!("Product Name: {product}");

    let pool_path = cli.pool.clone().unwrap_or_else(|| config.pool.path.clone());
    let mut repository = PoolRepository::new(&pool_path, config.repository_options());
    ensure!(
        repository.exists(),
        "MAC address pool file {} does not exist",
        pool_path.display()
    );

    let passphrase = TerminalSecret.read_secret("Pool passphrase: ")?;
    let loaded = repository
        .load_verified(&passphrase)
        .context("failed to load MAC address pool")?;
    if loaded.is_legacy_unsigned() {
        println!("  [SEC] Pool carries no signature; its integrity could not be verified.");
    }
    let mut pool = loaded.pool;

    let address = allocation::select_available(&pool)
        .and_then(|entry| entry.parsed_address())
        .context("failed to get an available MAC address")?;
    println!("Selected MAC address: {address}");

    let request = ProvisionRequest {
        address,
        hostname: system.hostname().unwrap_or_else(|err| {
            warn!("could not read hostname: {err}");
            allocation::UNKNOWN_ATTRIBUTION.to_string()
        }),
        product_name: product.clone(),
    };

    let provisioner = Provisioner::new(
        driver,
        programmer,
        network,
        ProvisionSettings::from_retry(&config.retry),
    );
    let outcome = match provisioner.run_reported(&request) {
        Ok(outcome) => outcome,
        Err(failure) => {
            print_report(&failure.report());
            let err = failure.error;
            if err.is_hardware_fatal() {
                eprintln!(
                    "  [ERR] {err}. It is recommended to power off the system and diagnose the hardware manually."
                );
            }
            archive.store(&runner, &system, &product, &address, ACTION_FAILED, false);
            return Err(err.into());
        }
    };
    print_report(&outcome.report());

    let recorded = workflow::record_allocation(
        &mut repository,
        &mut pool,
        &passphrase,
        &request,
        &outcome.interfaces,
    );
    archive.store(&runner, &system, &product, &address, outcome.action(), true);
    let used_by = recorded.with_context(|| {
        format!(
            "{address} is on the NIC but the pool at {} could not be updated; mark it used by hand",
            pool_path.display()
        )
    })?;
    info!("{address} recorded as used by {used_by}");

    if outcome.satisfied() {
        println!("No reflash required: system already has the correct MAC address");
    } else {
        println!("MAC address updated successfully");
    }

    if !cli.no_reboot {
        offer_reboot(&runner)?;
    }
    Ok(())
}

fn offer_reboot<R>(runner: &R) -> Result<()>
where
    R: CommandRunner<Error = MacvaultError>,
{
    print!("Reboot system now? (Y/n): ");
    io::stdout().flush()?;
    let mut choice = String::new();
    io::stdin().lock().read_line(&mut choice)?;
    if choice.trim().eq_ignore_ascii_case("n") {
        println!("Exiting without reboot.");
        return Ok(());
    }

    println!("Rebooting system...");
    let output = runner.run("reboot", &[])?;
    if !output.success() {
        warn!("reboot failed: {}", output.diagnostic());
    }
    Ok(())
}

fn print_report(report: &WorkflowReport) {
    println!("{}", report.title);
    for event in &report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
