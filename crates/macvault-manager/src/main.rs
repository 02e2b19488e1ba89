//! macvault command-line interface for administering encrypted MAC address pools.

use anyhow::{bail, ensure, Context, Result};
use chrono::{Local, Utc};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use log::warn;
use macvault_core::{
    address::{MacAddress, VendorPrefix},
    allocation::Selection,
    config::MacvaultConfig,
    logging,
    report::{format_timestamp, ExportInclude, ListFilter},
    workflow::{self, ResetSelection, WorkflowLevel, WorkflowReport},
    PoolRepository,
};
use macvault_provider::{SecretInput, SystemInfo};
use macvault_system::{HostSystem, SystemCommandRunner, TerminalSecret};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "macvault",
    version,
    about = "Manage encrypted, signed MAC address pools used by macvault-flash."
)]
struct Cli {
    /// Path to the macvault configuration file (default: $MACVAULT_CONFIG or /etc/macvault.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pool file to operate on; overrides `pool.path` from the configuration.
    #[arg(short, long, global = true)]
    pool: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty pool protected by a passphrase.
    Create {
        /// Vendor prefix stored in the pool and used for generation (e.g. 00:1A:2B).
        #[arg(long)]
        prefix: Option<VendorPrefix>,

        /// Overwrite an existing pool file.
        #[arg(long)]
        force: bool,
    },

    /// Show pool metadata, usage counts and recently used addresses.
    Info,

    /// List the addresses in the pool.
    List {
        #[arg(long, value_enum, default_value_t = ListArg::All)]
        filter: ListArg,
    },

    /// Add addresses by hand, by random generation, or from a file.
    #[command(group(
        ArgGroup::new("source")
            .required(true)
            .args(["addresses", "generate", "import"])
    ))]
    Add {
        /// Addresses in colon, dash or bare hex notation.
        addresses: Vec<MacAddress>,

        /// Generate this many random addresses under the vendor prefix.
        #[arg(long, value_name = "COUNT")]
        generate: Option<usize>,

        /// Vendor prefix for --generate; defaults to the pool's stored prefix.
        #[arg(long, requires = "generate")]
        prefix: Option<VendorPrefix>,

        /// Import every address found in FILE (`-` reads standard input).
        #[arg(long, value_name = "FILE")]
        import: Option<PathBuf>,
    },

    /// Remove addresses from the pool.
    #[command(group(
        ArgGroup::new("selection")
            .required(true)
            .args(["index", "unused", "address"])
    ))]
    Remove {
        /// One-based positions as shown by `list`.
        #[arg(long, value_delimiter = ',')]
        index: Vec<usize>,

        /// Remove every address that is neither used nor reserved.
        #[arg(long)]
        unused: bool,

        #[arg(long)]
        address: Option<MacAddress>,

        /// Also remove addresses that are marked used.
        #[arg(long)]
        force: bool,
    },

    /// Return used addresses to the unused state.
    #[command(group(
        ArgGroup::new("selection")
            .required(true)
            .args(["index", "all", "address"])
    ))]
    Reset {
        /// One-based positions as shown by `list --filter used`.
        #[arg(long, value_delimiter = ',')]
        index: Vec<usize>,

        #[arg(long)]
        all: bool,

        #[arg(long)]
        address: Option<MacAddress>,
    },

    /// Reserve, unreserve or comment an address.
    Annotate {
        address: MacAddress,

        #[arg(long, conflicts_with = "unreserve")]
        reserve: bool,

        #[arg(long)]
        unreserve: bool,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Re-encrypt and re-sign the pool under a new passphrase.
    Passwd,

    /// Write a plain-text statistics report.
    Export {
        #[arg(long, value_enum, default_value_t = IncludeArg::All)]
        include: IncludeArg,

        /// Report path; defaults to mac_pool_stats_<timestamp>.txt next to the pool.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Adjust per-user manager settings.
    Settings {
        /// Default vendor prefix used when neither --prefix nor the pool provides one.
        #[arg(long)]
        vendor_prefix: Option<VendorPrefix>,

        /// Number of recently opened pools to remember.
        #[arg(long)]
        max_recent: Option<usize>,

        /// Forget the recently opened pools.
        #[arg(long)]
        clear_recent: bool,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListArg {
    All,
    Used,
    Unused,
}

impl From<ListArg> for ListFilter {
    fn from(value: ListArg) -> Self {
        match value {
            ListArg::All => ListFilter::All,
            ListArg::Used => ListFilter::Used,
            ListArg::Unused => ListFilter::Unused,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IncludeArg {
    None,
    All,
    Used,
    Unused,
}

impl From<IncludeArg> for ExportInclude {
    fn from(value: IncludeArg) -> Self {
        match value {
            IncludeArg::None => ExportInclude::None,
            IncludeArg::All => ExportInclude::All,
            IncludeArg::Used => ExportInclude::Used,
            IncludeArg::Unused => ExportInclude::Unused,
        }
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    if let Commands::Validate { file, schema } = &cli.command {
        return validate(file.as_deref().or(cli.config.as_deref()), *schema);
    }

    let config_path = MacvaultConfig::resolve_path(cli.config.as_deref());
    let config = MacvaultConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    config
        .ensure_valid()
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    let mut user = load_user_settings();

    if let Commands::Settings {
        vendor_prefix,
        max_recent,
        clear_recent,
    } = cli.command
    {
        return settings(&mut user, vendor_prefix, max_recent, clear_recent);
    }

    let pool_path = cli.pool.clone().unwrap_or_else(|| config.pool.path.clone());
    let mut repository = PoolRepository::new(&pool_path, config.repository_options());
    let secret = TerminalSecret;
    let min_len = config.pool.min_passphrase_len;

    let report = match cli.command {
        Commands::Create { prefix, force } => {
            ensure!(
                force || !repository.exists(),
                "{} already exists; pass --force to overwrite it",
                pool_path.display()
            );
            let passphrase = prompt_new_passphrase(&secret, min_len)?;
            let prefix = match prefix {
                Some(prefix) => Some(prefix),
                None => default_prefix(&config, &user)?,
            };
            workflow::create_pool(
                &mut repository,
                &passphrase,
                &creator(),
                prefix.as_ref(),
                force,
            )?
        }
        Commands::Info => {
            let passphrase = prompt_passphrase(&secret)?;
            workflow::pool_info(&repository, &passphrase)?
        }
        Commands::List { filter } => {
            let passphrase = prompt_passphrase(&secret)?;
            workflow::list_pool(&repository, &passphrase, filter.into())?
        }
        Commands::Add {
            addresses,
            generate,
            prefix,
            import,
        } => {
            let passphrase = prompt_passphrase(&secret)?;
            if let Some(count) = generate {
                let fallback = default_prefix(&config, &user)?;
                workflow::add_generated(
                    &mut repository,
                    &passphrase,
                    count,
                    prefix.as_ref(),
                    fallback.as_ref(),
                )?
            } else if let Some(source) = import {
                let text = read_import(&source)?;
                workflow::add_imported(&mut repository, &passphrase, &text)?
            } else {
                workflow::add_manual(&mut repository, &passphrase, &addresses)?
            }
        }
        Commands::Remove {
            index,
            unused,
            address,
            force,
        } => {
            let selection = match (address, unused) {
                (Some(address), _) => Selection::Address(address),
                (None, true) => Selection::Unused,
                (None, false) => Selection::Indices(index),
            };
            let passphrase = prompt_passphrase(&secret)?;
            workflow::remove_entries(&mut repository, &passphrase, &selection, force)?
        }
        Commands::Reset {
            index,
            all,
            address,
        } => {
            let selection = match (address, all) {
                (Some(address), _) => ResetSelection::Address(address),
                (None, true) => ResetSelection::All,
                (None, false) => ResetSelection::Indices(index),
            };
            let passphrase = prompt_passphrase(&secret)?;
            workflow::reset_entries(&mut repository, &passphrase, &selection)?
        }
        Commands::Annotate {
            address,
            reserve,
            unreserve,
            comment,
        } => {
            let reserved = match (reserve, unreserve) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let passphrase = prompt_passphrase(&secret)?;
            workflow::annotate_entry(
                &mut repository,
                &passphrase,
                &address,
                reserved,
                comment.as_deref(),
            )?
        }
        Commands::Passwd => {
            let current = secret.read_secret("Current pool passphrase: ")?;
            let new = prompt_new_passphrase(&secret, min_len)?;
            workflow::change_passphrase(&mut repository, &current, &new)?
        }
        Commands::Export { include, output } => {
            let passphrase = prompt_passphrase(&secret)?;
            workflow::export_stats(
                &repository,
                &passphrase,
                include.into(),
                output,
                Local::now(),
            )?
        }
        Commands::Settings { .. } | Commands::Validate { .. } => {
            unreachable!("handled before the pool is opened")
        }
    };

    print_report(&report);
    remember_pool(&mut user, &pool_path);
    Ok(())
}

fn validate(file: Option<&Path>, schema: bool) -> Result<()> {
    if schema {
        println!("{}", MacvaultConfig::json_schema()?);
        return Ok(());
    }

    let file = MacvaultConfig::resolve_path(file);
    let cfg = MacvaultConfig::load(&file)
        .with_context(|| format!("failed to load configuration from {}", file.display()))?;

    let issues = cfg.validate();
    if !issues.is_empty() {
        eprintln!("Configuration validation failed:");
        for issue in issues {
            eprintln!("  - {issue}");
        }
        std::process::exit(1);
    }
    println!(
        "Configuration valid (pool={}, driver={}, {} write attempts).",
        cfg.pool.path.display(),
        cfg.driver.module,
        cfg.retry.write_attempts
    );
    Ok(())
}

/// Per-user bookkeeping; `None` when no home directory can be determined.
fn load_user_settings() -> Option<MacvaultConfig> {
    let path = MacvaultConfig::user_config_path()?;
    match MacvaultConfig::load_or_default(&path) {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            warn!("ignoring unreadable user settings {}: {err}", path.display());
            None
        }
    }
}

fn remember_pool(user: &mut Option<MacvaultConfig>, pool: &Path) {
    let Some(user) = user else {
        return;
    };
    let pool = fs::canonicalize(pool).unwrap_or_else(|_| pool.to_path_buf());
    user.manager.remember(&pool, "", Utc::now());
    if let Err(err) = user.save() {
        warn!("could not update recent pools in {}: {err}", user.path.display());
    }
}

fn default_prefix(
    config: &MacvaultConfig,
    user: &Option<MacvaultConfig>,
) -> Result<Option<VendorPrefix>> {
    if let Some(prefix) = config.vendor_prefix()? {
        return Ok(Some(prefix));
    }
    match user {
        Some(user) => Ok(user.vendor_prefix()?),
        None => Ok(None),
    }
}

fn settings(
    user: &mut Option<MacvaultConfig>,
    vendor_prefix: Option<VendorPrefix>,
    max_recent: Option<usize>,
    clear_recent: bool,
) -> Result<()> {
    let Some(user) = user else {
        bail!("no per-user configuration directory is available on this system");
    };

    let mut events = Vec::new();
    if let Some(prefix) = vendor_prefix {
        user.manager.default_vendor_prefix = Some(prefix.to_string());
        events.push(format!("Default vendor prefix set to {prefix}"));
    }
    if let Some(max) = max_recent {
        ensure!(max > 0, "--max-recent must be at least 1");
        user.manager.max_recent = max;
        user.manager.recent_pools.truncate(max);
        events.push(format!("Remembering up to {max} recent pools"));
    }
    if clear_recent {
        user.manager.recent_pools.clear();
        events.push("Cleared the recent pools list.".to_string());
    }

    if events.is_empty() {
        println!("No settings were changed. Use --vendor-prefix, --max-recent, or --clear-recent.");
    } else {
        user.save()
            .with_context(|| format!("failed to save {}", user.path.display()))?;
        for line in events {
            println!("• {line}");
        }
        println!("Settings saved to {}", user.path.display());
    }
    print_settings_snapshot(user);
    Ok(())
}

fn print_settings_snapshot(user: &MacvaultConfig) {
    println!("Current Settings");
    println!(
        "  Default vendor prefix: {}",
        user.manager
            .default_vendor_prefix
            .as_deref()
            .unwrap_or("(not set)")
    );
    println!("  Maximum recent pools: {}", user.manager.max_recent);
    println!("  Recent pools:");
    if user.manager.recent_pools.is_empty() {
        println!("    (none)");
    }
    for recent in &user.manager.recent_pools {
        println!(
            "    - {} (last opened {})",
            recent.path.display(),
            format_timestamp(&recent.last_opened)
        );
    }
}

fn read_import(source: &Path) -> Result<String> {
    if source == Path::new("-") {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    fs::read_to_string(source).with_context(|| format!("failed to read {}", source.display()))
}

fn prompt_passphrase<S>(secret: &S) -> Result<String>
where
    S: SecretInput,
{
    Ok(secret.read_secret("Pool passphrase: ")?)
}

fn prompt_new_passphrase<S>(secret: &S, min_len: usize) -> Result<String>
where
    S: SecretInput,
{
    let passphrase = secret.read_secret("New pool passphrase: ")?;
    let confirmation = secret.read_secret("Confirm passphrase: ")?;
    workflow::validate_new_passphrase(&passphrase, &confirmation, min_len)?;
    Ok(passphrase)
}

/// `user@host` recorded as the pool creator.
fn creator() -> String {
    let user = std::env::var("USER")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let host = HostSystem::new(SystemCommandRunner::new())
        .hostname()
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{user}@{host}")
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: &WorkflowReport) {
    println!("{}", report.title);
    for event in &report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
