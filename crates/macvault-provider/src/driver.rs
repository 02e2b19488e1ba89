//! Contracts for kernel modules, the vendor programming driver, and the
//! hardware address programming utility.

use std::error::Error;
use std::path::{Path, PathBuf};

/// Read/modify access to the kernel module table.
pub trait ModuleInspector {
    type Error: Error + Send + Sync + 'static;

    /// True when `name` appears in the loaded module list.
    fn is_loaded(&self, name: &str) -> Result<bool, Self::Error>;

    /// Unload a module by name.
    fn remove(&self, name: &str) -> Result<(), Self::Error>;

    /// Load a module from an object file.
    fn insert(&self, path: &Path) -> Result<(), Self::Error>;

    /// Load a module (and its dependencies) by name from the module tree.
    fn probe(&self, name: &str) -> Result<(), Self::Error>;
}

/// Outcome of a successful driver load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverLoad {
    /// The module was already resident; nothing was inserted.
    AlreadyLoaded(String),
    /// An existing object file was inserted.
    Inserted(PathBuf),
    /// The module was compiled from source and then inserted.
    Compiled(PathBuf),
}

/// Vendor-specific programming driver lifecycle.
pub trait DriverManager {
    type Error: Error + Send + Sync + 'static;

    /// Make sure the programming driver is resident, building it when no object
    /// file exists yet.
    fn ensure_loaded(&self) -> Result<DriverLoad, Self::Error>;

    /// Force a clean rebuild of the driver from source. Does not load it.
    fn rebuild(&self) -> Result<(), Self::Error>;

    /// Unload the programming driver and restore whichever NIC driver was
    /// displaced to make room for it.
    fn release(&self) -> Result<(), Self::Error>;
}

/// Writes a hardware address into device storage.
pub trait AddressProgrammer {
    type Error: Error + Send + Sync + 'static;

    /// `compact` is the address with separators stripped (`AABBCCDDEEFF`).
    fn write(&self, compact: &str) -> Result<(), Self::Error>;
}
