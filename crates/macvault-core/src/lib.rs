//! Core building blocks shared by the macvault binaries.
//!
//! The encrypted pool store, allocation rules, configuration and the
//! provisioning state machine live here so the manager and flasher only
//! handle operator interaction.

pub mod address;
pub mod allocation;
pub mod cipher;
pub mod config;
pub mod error;
pub mod logging;
pub mod oplog;
pub mod pool;
pub mod report;
pub mod repository;
pub mod signer;
pub mod workflow;

pub use address::{MacAddress, VendorPrefix};
pub use config::{ConfigFormat, MacvaultConfig};
pub use error::{MacvaultError, MacvaultResult};
pub use oplog::{HostInfo, OperationRecord};
pub use pool::{Entry, Pool, PoolSummary};
pub use repository::{LoadedPool, PoolRepository, RepositoryOptions};
pub use signer::SignatureStatus;
pub use workflow::{WorkflowEvent, WorkflowLevel, WorkflowReport};
