//! Host identity via `dmidecode`, `uname` and `uptime`.

use crate::command::run_checked;
use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::{CommandRunner, SystemInfo};
use std::fs;

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

/// Value of the first `Product Name:` line in `dmidecode -t system` output.
pub fn parse_product_name(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Product Name:"))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct HostSystem<R> {
    runner: R,
}

impl<R> HostSystem<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R> HostSystem<R>
where
    R: CommandRunner<Error = MacvaultError>,
{
    fn trimmed(&self, program: &str, args: &[&str]) -> MacvaultResult<String> {
        let output = run_checked(&self.runner, program, args)?;
        Ok(output.stdout.trim().to_string())
    }
}

impl<R> SystemInfo for HostSystem<R>
where
    R: CommandRunner<Error = MacvaultError>,
{
    type Error = MacvaultError;

    fn product_name(&self) -> MacvaultResult<String> {
        let output = run_checked(&self.runner, "dmidecode", &["-t", "system"])?;
        parse_product_name(&output.stdout)
            .ok_or_else(|| MacvaultError::Provider("could not determine product name".into()))
    }

    fn dmi_dump(&self) -> MacvaultResult<String> {
        run_checked(&self.runner, "dmidecode", &[]).map(|output| output.stdout)
    }

    fn hostname(&self) -> MacvaultResult<String> {
        match fs::read_to_string(HOSTNAME_PATH) {
            Ok(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
            _ => self.trimmed("hostname", &[]),
        }
    }

    fn kernel_release(&self) -> MacvaultResult<String> {
        self.trimmed("uname", &["-r"])
    }

    fn machine_arch(&self) -> MacvaultResult<String> {
        self.trimmed("uname", &["-m"])
    }

    fn uptime(&self) -> MacvaultResult<String> {
        self.trimmed("uptime", &[])
    }
}
