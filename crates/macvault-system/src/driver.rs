//! Lifecycle of the vendor NIC programming driver.
//!
//! The programming driver cannot bind while a regular Realtek NIC driver owns
//! the device, so loading it first unloads every conflicting module and
//! remembers which one was displaced; `release` puts that one back.

use crate::command::run_checked;
use log::{debug, info, warn};
use macvault_core::config::DriverCfg;
use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::{CommandRunner, DriverLoad, DriverManager, ModuleInspector};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const UNKNOWN_KERNEL: &str = "unknown";

/// [`DriverManager`] over the vendor `pgdrv` sources in the configured workdir.
#[derive(Debug)]
pub struct RtnicDriver<R, M> {
    runner: R,
    modules: M,
    workdir: PathBuf,
    module: String,
    conflicting: Vec<String>,
    displaced: Mutex<Option<String>>,
}

impl<R, M> RtnicDriver<R, M> {
    pub fn new(runner: R, modules: M, cfg: &DriverCfg) -> Self {
        Self {
            runner,
            modules,
            workdir: cfg.workdir.clone(),
            module: cfg.module.clone(),
            conflicting: cfg.conflicting_modules.clone(),
            displaced: Mutex::new(None),
        }
    }

    /// NIC driver unloaded to make room for the programming driver, if any.
    pub fn displaced(&self) -> Option<String> {
        self.displaced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_displaced(&self, module: &str) {
        *self.displaced.lock().unwrap_or_else(PoisonError::into_inner) = Some(module.to_string());
    }

    fn take_displaced(&self) -> Option<String> {
        self.displaced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn built_object(&self) -> PathBuf {
        self.workdir.join(format!("{}.ko", self.module))
    }
}

/// Object file name for the programming driver: kernel-specific when it
/// displaced a NIC driver, plain otherwise.
pub(crate) fn object_name(module: &str, displaced: Option<&str>, kernel: &str) -> String {
    match displaced {
        Some(displaced) => format!("{displaced}_mod_{kernel}.ko"),
        None => format!("{module}.ko"),
    }
}

impl<R, M> RtnicDriver<R, M>
where
    R: CommandRunner<Error = MacvaultError>,
    M: ModuleInspector<Error = MacvaultError>,
{
    fn require_workdir(&self) -> MacvaultResult<()> {
        if self.workdir.is_dir() {
            return Ok(());
        }
        Err(MacvaultError::DriverLoad(format!(
            "driver directory {} does not exist",
            self.workdir.display()
        )))
    }

    fn unload_conflicting(&self) {
        for module in &self.conflicting {
            match self.modules.is_loaded(module) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!("could not check whether {module} is loaded: {err}");
                    continue;
                }
            }
            info!("removing NIC driver {module}");
            match self.modules.remove(module) {
                Ok(()) => self.set_displaced(module),
                Err(err) => warn!("could not remove module {module}: {err}"),
            }
        }
    }

    fn kernel_release(&self) -> String {
        match run_checked(&self.runner, "uname", &["-r"]) {
            Ok(output) if !output.stdout.trim().is_empty() => output.stdout.trim().to_string(),
            Ok(_) => UNKNOWN_KERNEL.to_string(),
            Err(err) => {
                warn!("could not read kernel release: {err}");
                UNKNOWN_KERNEL.to_string()
            }
        }
    }

    fn compile(&self) -> MacvaultResult<()> {
        let workdir = self.workdir.to_string_lossy();
        info!("compiling {} in {workdir}", self.module);
        run_checked(&self.runner, "make", &["-C", workdir.as_ref(), "clean", "all"])
            .map_err(|err| MacvaultError::DriverLoad(format!("compilation failed: {err}")))?;

        let built = self.built_object();
        if !built.is_file() {
            return Err(MacvaultError::DriverLoad(format!(
                "compiled module {} not found",
                built.display()
            )));
        }
        Ok(())
    }

    /// Move a freshly built object to `target` when the names differ.
    fn place_built(&self, target: &Path) -> MacvaultResult<()> {
        let built = self.built_object();
        if built == target {
            return Ok(());
        }
        fs::rename(&built, target).map_err(|err| {
            MacvaultError::DriverLoad(format!(
                "failed to rename {} to {}: {err}",
                built.display(),
                target.display()
            ))
        })
    }

    fn insert(&self, path: &Path) -> MacvaultResult<()> {
        self.modules.insert(path).map_err(|err| {
            MacvaultError::DriverLoad(format!("failed to load module {}: {err}", path.display()))
        })
    }
}

impl<R, M> DriverManager for RtnicDriver<R, M>
where
    R: CommandRunner<Error = MacvaultError>,
    M: ModuleInspector<Error = MacvaultError>,
{
    type Error = MacvaultError;

    fn ensure_loaded(&self) -> MacvaultResult<DriverLoad> {
        self.require_workdir()?;
        self.unload_conflicting();

        let displaced = self.displaced();
        let kernel = self.kernel_release();
        let target = self
            .workdir
            .join(object_name(&self.module, displaced.as_deref(), &kernel));

        if target.is_file() {
            if self.modules.is_loaded(&self.module)? {
                info!("module {} is already loaded", self.module);
                return Ok(DriverLoad::AlreadyLoaded(self.module.clone()));
            }
            info!("loading existing driver {}", target.display());
            self.insert(&target)?;
            return Ok(DriverLoad::Inserted(target));
        }

        self.compile()?;
        self.place_built(&target)?;
        self.insert(&target)?;
        info!("compiled and loaded {}", target.display());
        Ok(DriverLoad::Compiled(target))
    }

    fn rebuild(&self) -> MacvaultResult<()> {
        self.require_workdir()?;
        match self.modules.is_loaded(&self.module) {
            Ok(true) => {
                if let Err(err) = self.modules.remove(&self.module) {
                    warn!("could not unload {} before rebuilding: {err}", self.module);
                }
            }
            Ok(false) => {}
            Err(err) => debug!("module check before rebuild failed: {err}"),
        }

        self.compile()?;
        if let Some(displaced) = self.displaced() {
            let kernel = self.kernel_release();
            let target = self
                .workdir
                .join(object_name(&self.module, Some(&displaced), &kernel));
            self.place_built(&target)?;
        }
        Ok(())
    }

    fn release(&self) -> MacvaultResult<()> {
        if let Err(err) = self.modules.remove(&self.module) {
            debug!("unloading {} failed: {err}", self.module);
        }
        match self.take_displaced() {
            Some(displaced) => {
                info!("restoring NIC driver {displaced}");
                self.modules.probe(&displaced)
            }
            None => Ok(()),
        }
    }
}
