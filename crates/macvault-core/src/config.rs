//! Configuration model shared by the manager and flasher binaries.

use crate::address::VendorPrefix;
use crate::error::{MacvaultError, MacvaultResult};
use crate::repository::RepositoryOptions;
use chrono::{DateTime, Utc};
use directories_next::ProjectDirs;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/macvault.toml";
pub const CONFIG_PATH_ENV: &str = "MACVAULT_CONFIG";
const USER_CONFIG_FILE_NAME: &str = "macvault.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Macvault";
const APP_NAME: &str = "macvault";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// Where the pool lives and how strictly it is treated.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolCfg {
    #[serde(default = "default_pool_path")]
    pub path: PathBuf,

    /// Prefix used by `add --generate` when none is given on the command line.
    #[serde(default)]
    pub vendor_prefix: Option<String>,

    #[serde(default = "default_true")]
    pub backup: bool,

    #[serde(default)]
    pub reject_unsigned: bool,

    #[serde(default = "default_min_passphrase_len")]
    pub min_passphrase_len: usize,
}

fn default_pool_path() -> PathBuf {
    PathBuf::from("mac_pool.enc")
}

fn default_true() -> bool {
    true
}

fn default_min_passphrase_len() -> usize {
    8
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self {
            path: default_pool_path(),
            vendor_prefix: None,
            backup: true,
            reject_unsigned: false,
            min_passphrase_len: default_min_passphrase_len(),
        }
    }
}

/// Vendor programming driver and utility layout.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DriverCfg {
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    #[serde(default = "default_module")]
    pub module: String,

    /// NIC drivers that must be unloaded before the programming driver can bind.
    #[serde(default = "default_conflicting_modules")]
    pub conflicting_modules: Vec<String>,

    #[serde(default = "default_programmer_prefix")]
    pub programmer_prefix: String,
}

fn default_workdir() -> PathBuf {
    PathBuf::from("rtnicpg")
}

fn default_module() -> String {
    "pgdrv".to_string()
}

fn default_conflicting_modules() -> Vec<String> {
    ["r8169", "r8168", "r8125", "r8101"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_programmer_prefix() -> String {
    "rtnicpg".to_string()
}

impl Default for DriverCfg {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            module: default_module(),
            conflicting_modules: default_conflicting_modules(),
            programmer_prefix: default_programmer_prefix(),
        }
    }
}

impl DriverCfg {
    /// `<workdir>/<prefix>-<arch>`
    pub fn programmer_path(&self, arch: &str) -> PathBuf {
        self.workdir
            .join(format!("{}-{}", self.programmer_prefix, arch.trim()))
    }
}

/// Bounded retry policy for hardware writes and network restore.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    #[serde(default = "default_write_backoff_ms")]
    pub write_backoff_ms: u64,

    #[serde(default = "default_restore_attempts")]
    pub restore_attempts: u32,

    #[serde(default = "default_restore_backoff_ms")]
    pub restore_backoff_ms: u64,
}

fn default_write_attempts() -> u32 {
    3
}

fn default_write_backoff_ms() -> u64 {
    1_000
}

fn default_restore_attempts() -> u32 {
    3
}

fn default_restore_backoff_ms() -> u64 {
    500
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            write_attempts: default_write_attempts(),
            write_backoff_ms: default_write_backoff_ms(),
            restore_attempts: default_restore_attempts(),
            restore_backoff_ms: default_restore_backoff_ms(),
        }
    }
}

impl RetryCfg {
    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }

    pub fn restore_backoff(&self) -> Duration {
        Duration::from_millis(self.restore_backoff_ms)
    }
}

/// Completed-operation records written by the flasher.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OplogCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_oplog_dir")]
    pub dir: PathBuf,

    /// `user@host:path` destination for `scp`.
    #[serde(default)]
    pub server: Option<String>,
}

fn default_oplog_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for OplogCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_oplog_dir(),
            server: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecentPool {
    pub path: PathBuf,
    pub last_opened: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

/// Manager bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ManagerCfg {
    #[serde(default = "default_max_recent")]
    pub max_recent: usize,

    #[serde(default)]
    pub default_vendor_prefix: Option<String>,

    /// Most recent first.
    #[serde(default)]
    pub recent_pools: Vec<RecentPool>,
}

fn default_max_recent() -> usize {
    10
}

impl Default for ManagerCfg {
    fn default() -> Self {
        Self {
            max_recent: default_max_recent(),
            default_vendor_prefix: None,
            recent_pools: Vec::new(),
        }
    }
}

impl ManagerCfg {
    /// Move `path` to the front of the recent list, trimming to `max_recent`.
    pub fn remember(&mut self, path: &Path, description: &str, now: DateTime<Utc>) {
        self.recent_pools.retain(|recent| recent.path != path);
        self.recent_pools.insert(
            0,
            RecentPool {
                path: path.to_path_buf(),
                last_opened: now,
                description: description.to_string(),
            },
        );
        self.recent_pools.truncate(self.max_recent);
    }
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl ConfigFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Toml,
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MacvaultConfig {
    #[serde(default)]
    pub pool: PoolCfg,

    #[serde(default)]
    pub driver: DriverCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(default)]
    pub oplog: OplogCfg,

    #[serde(default)]
    pub manager: ManagerCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl MacvaultConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Per-user configuration, used for manager bookkeeping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(USER_CONFIG_FILE_NAME))
    }

    /// Explicit path, then `MACVAULT_CONFIG`, then the system default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match env::var(CONFIG_PATH_ENV) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
            _ => Self::default_path().to_path_buf(),
        }
    }

    /// Read a config file from disk, detecting the format by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> MacvaultResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = ConfigFormat::for_path(path);
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = path.to_path_buf();
        cfg.format = format;
        Ok(cfg)
    }

    /// Like [`load`](Self::load), but a missing file yields defaults bound to `path`.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> MacvaultResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        debug!("no configuration at {}; using defaults", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            format: ConfigFormat::for_path(path),
            ..Self::default()
        })
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.pool.path.as_os_str().is_empty() {
            issues.push("pool.path must not be empty".to_string());
        }
        if let Some(prefix) = &self.pool.vendor_prefix {
            if let Err(err) = prefix.parse::<VendorPrefix>() {
                issues.push(format!("pool.vendor_prefix: {err}"));
            }
        }
        if self.pool.min_passphrase_len == 0 {
            issues.push("pool.min_passphrase_len must be at least 1".to_string());
        }

        if self.driver.workdir.as_os_str().is_empty() {
            issues.push("driver.workdir must not be empty".to_string());
        }
        if self.driver.module.trim().is_empty() {
            issues.push("driver.module must not be empty".to_string());
        }
        if self.driver.programmer_prefix.trim().is_empty() {
            issues.push("driver.programmer_prefix must not be empty".to_string());
        }
        if self
            .driver
            .conflicting_modules
            .iter()
            .any(|module| module.trim().is_empty())
        {
            issues.push("driver.conflicting_modules contains an empty entry".to_string());
        }

        if self.retry.write_attempts == 0 {
            issues.push("retry.write_attempts must be at least 1".to_string());
        }
        if self.retry.restore_attempts == 0 {
            issues.push("retry.restore_attempts must be at least 1".to_string());
        }

        if self.oplog.enabled && self.oplog.dir.as_os_str().is_empty() {
            issues.push("oplog.dir must not be empty when oplog.enabled is true".to_string());
        }
        if let Some(server) = &self.oplog.server {
            let host = server.split(':').next().unwrap_or("").trim();
            if host.is_empty() {
                issues.push(format!("oplog.server `{server}` has no host"));
            }
        }

        if self.manager.max_recent == 0 {
            issues.push("manager.max_recent must be at least 1".to_string());
        }
        if let Some(prefix) = &self.manager.default_vendor_prefix {
            if let Err(err) = prefix.parse::<VendorPrefix>() {
                issues.push(format!("manager.default_vendor_prefix: {err}"));
            }
        }

        issues
    }

    /// Fail with every validation issue joined, or succeed.
    pub fn ensure_valid(&self) -> MacvaultResult<()> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(MacvaultError::InvalidConfig(issues.join("; ")))
        }
    }

    /// Vendor prefix for generation: `[pool]` first, then the manager default.
    pub fn vendor_prefix(&self) -> MacvaultResult<Option<VendorPrefix>> {
        self.pool
            .vendor_prefix
            .as_deref()
            .or(self.manager.default_vendor_prefix.as_deref())
            .map(str::parse)
            .transpose()
    }

    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            backup: self.pool.backup,
            reject_unsigned: self.pool.reject_unsigned,
        }
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> MacvaultResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, payload)?;
        Ok(())
    }

    pub fn json_schema() -> MacvaultResult<String> {
        let schema = schemars::schema_for!(MacvaultConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: impl Into<String>) -> Self {
            let prev = env::var(key).ok();
            env::set_var(key, value.into());
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = &self.prev {
                env::set_var(self.key, prev);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    #[test]
    fn resolve_path_prefers_explicit_then_env() {
        let guard = EnvGuard::set(CONFIG_PATH_ENV, "/tmp/env-macvault.toml");
        assert_eq!(
            MacvaultConfig::resolve_path(Some(Path::new("/tmp/explicit.toml"))),
            PathBuf::from("/tmp/explicit.toml")
        );
        assert_eq!(
            MacvaultConfig::resolve_path(None),
            PathBuf::from("/tmp/env-macvault.toml")
        );
        drop(guard);
    }

    #[test]
    fn missing_file_yields_documented_defaults() {
        let dir = tempdir().unwrap();
        let cfg = MacvaultConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.pool.path, PathBuf::from("mac_pool.enc"));
        assert!(cfg.pool.backup);
        assert!(!cfg.pool.reject_unsigned);
        assert_eq!(cfg.driver.module, "pgdrv");
        assert_eq!(cfg.driver.conflicting_modules.len(), 4);
        assert_eq!(cfg.retry.write_attempts, 3);
        assert_eq!(cfg.retry.write_backoff(), Duration::from_millis(1000));
        assert_eq!(cfg.retry.restore_backoff(), Duration::from_millis(500));
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn loads_partial_toml_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("macvault.toml");
        fs::write(
            &path,
            "[pool]\npath = \"/srv/pools/line3.enc\"\nvendor_prefix = \"00:1A:2B\"\n\n[retry]\nwrite_attempts = 5\n",
        )
        .unwrap();

        let mut cfg = MacvaultConfig::load(&path).unwrap();
        assert_eq!(cfg.pool.path, PathBuf::from("/srv/pools/line3.enc"));
        assert_eq!(cfg.retry.write_attempts, 5);
        assert_eq!(cfg.retry.restore_attempts, 3);
        assert_eq!(cfg.vendor_prefix().unwrap().unwrap().to_string(), "00:1A:2B");

        cfg.oplog.server = Some("ops@logs:/srv/macs".into());
        cfg.save().unwrap();
        let reloaded = MacvaultConfig::load(&path).unwrap();
        assert_eq!(reloaded.oplog.server.as_deref(), Some("ops@logs:/srv/macs"));
        assert_eq!(reloaded.format, ConfigFormat::Toml);
    }

    #[test]
    fn loads_yaml_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("macvault.yaml");
        fs::write(&path, "driver:\n  module: pgdrv2\n").unwrap();
        let cfg = MacvaultConfig::load(&path).unwrap();
        assert_eq!(cfg.format, ConfigFormat::Yaml);
        assert_eq!(cfg.driver.module, "pgdrv2");
    }

    #[test]
    fn malformed_toml_is_invalid_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[pool\npath = 1").unwrap();
        assert!(matches!(
            MacvaultConfig::load(&path),
            Err(MacvaultError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_reports_each_problem() {
        let mut cfg = MacvaultConfig::default();
        cfg.pool.vendor_prefix = Some("zz:zz".into());
        cfg.retry.write_attempts = 0;
        cfg.driver.module = " ".into();
        cfg.manager.max_recent = 0;

        let issues = cfg.validate();
        assert_eq!(issues.len(), 4, "{issues:?}");
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn recent_pools_are_deduplicated_and_capped() {
        let mut manager = ManagerCfg {
            max_recent: 2,
            ..ManagerCfg::default()
        };
        let start = Utc::now();
        manager.remember(Path::new("/a.enc"), "a", start);
        manager.remember(Path::new("/b.enc"), "b", start + ChronoDuration::seconds(1));
        manager.remember(Path::new("/a.enc"), "a again", start + ChronoDuration::seconds(2));
        manager.remember(Path::new("/c.enc"), "c", start + ChronoDuration::seconds(3));

        let paths: Vec<_> = manager
            .recent_pools
            .iter()
            .map(|recent| recent.path.clone())
            .collect();
        assert_eq!(paths, vec![PathBuf::from("/c.enc"), PathBuf::from("/a.enc")]);
    }

    #[test]
    fn programmer_path_combines_prefix_and_arch() {
        let driver = DriverCfg::default();
        assert_eq!(
            driver.programmer_path("x86_64\n"),
            PathBuf::from("rtnicpg/rtnicpg-x86_64")
        );
    }
}
