//! Vendor address programming utility.

use crate::command::run_checked;
use log::info;
use macvault_core::config::DriverCfg;
use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::{AddressProgrammer, CommandRunner};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Runs `<workdir>/<prefix>-<arch> /efuse /nicmac /nodeid <HEX12>`.
#[derive(Debug, Clone)]
pub struct RtnicProgrammer<R> {
    runner: R,
    utility: PathBuf,
}

impl<R> RtnicProgrammer<R> {
    pub fn new(runner: R, utility: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            utility: utility.into(),
        }
    }

    pub fn from_config(runner: R, cfg: &DriverCfg, arch: &str) -> Self {
        Self::new(runner, cfg.programmer_path(arch))
    }

    pub fn utility(&self) -> &Path {
        &self.utility
    }
}

fn make_executable(path: &Path) -> MacvaultResult<()> {
    let mut perms = fs::metadata(path)
        .map_err(|err| {
            MacvaultError::Provider(format!(
                "programming utility {} is missing: {err}",
                path.display()
            ))
        })?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

impl<R> AddressProgrammer for RtnicProgrammer<R>
where
    R: CommandRunner<Error = MacvaultError>,
{
    type Error = MacvaultError;

    fn write(&self, compact: &str) -> MacvaultResult<()> {
        if compact.len() != 12 || !compact.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MacvaultError::InvalidAddress(compact.to_string()));
        }
        make_executable(&self.utility)?;

        let utility = self.utility.to_string_lossy();
        info!("programming {compact} with {utility}");
        run_checked(
            &self.runner,
            utility.as_ref(),
            &["/efuse", "/nicmac", "/nodeid", compact],
        )
        .map(|_| ())
    }
}
