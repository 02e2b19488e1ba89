//! Error taxonomy shared by every macvault crate.

use std::path::PathBuf;
use thiserror::Error;

use crate::address::MacAddress;

pub type MacvaultResult<T> = Result<T, MacvaultError>;

#[derive(Debug, Error)]
pub enum MacvaultError {
    #[error("pool file {0} does not exist")]
    NotFound(PathBuf),

    /// Wrong passphrase, corrupted ciphertext, or a truncated blob. Callers must
    /// not be able to tell these apart.
    #[error("failed to decrypt pool: wrong passphrase or corrupted data")]
    Decryption,

    #[error("pool data is malformed: {0}")]
    MalformedData(String),

    #[error("integrity check failed: the pool file may have been tampered with")]
    Integrity,

    #[error("no available MAC addresses in pool")]
    PoolExhausted,

    #[error("{0} is not in the pool")]
    UnknownAddress(MacAddress),

    #[error("invalid vendor prefix: {0}")]
    InvalidPrefix(String),

    #[error("requested {requested} addresses but the prefix only leaves room for {capacity}")]
    CapacityExceeded { requested: u64, capacity: u64 },

    #[error("could only generate {} of {requested} unique addresses after {attempts} attempts", generated.len())]
    PartialGeneration {
        generated: Vec<MacAddress>,
        requested: usize,
        attempts: usize,
    },

    #[error("driver load failed: {0}")]
    DriverLoad(String),

    #[error("failed to write MAC address after {attempts} attempts: {last_error}")]
    HardwareWriteExhausted { attempts: u32, last_error: String },

    #[error("no interface carries {0} after the write reported success")]
    InterfaceNotFound(String),

    #[error("network restore failed: {0}")]
    NetworkRestore(String),

    #[error("invalid MAC address: {0}")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid passphrase: {0}")]
    InvalidPassphrase(String),

    #[error("{0}")]
    Privilege(String),

    #[error("{0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MacvaultError {
    /// Fatal provisioning failures that must stop the operator before anything
    /// else touches the machine.
    pub fn is_hardware_fatal(&self) -> bool {
        matches!(
            self,
            MacvaultError::DriverLoad(_)
                | MacvaultError::HardwareWriteExhausted { .. }
                | MacvaultError::InterfaceNotFound(_)
        )
    }
}

impl From<toml::de::Error> for MacvaultError {
    fn from(err: toml::de::Error) -> Self {
        MacvaultError::InvalidConfig(err.to_string())
    }
}

impl From<toml::ser::Error> for MacvaultError {
    fn from(err: toml::ser::Error) -> Self {
        MacvaultError::InvalidConfig(err.to_string())
    }
}

impl From<serde_yaml::Error> for MacvaultError {
    fn from(err: serde_yaml::Error) -> Self {
        MacvaultError::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for MacvaultError {
    fn from(err: serde_json::Error) -> Self {
        MacvaultError::MalformedData(err.to_string())
    }
}
