#![forbid(unsafe_code)]

//! Capability contracts shared across macvault.
//!
//! Workflows in `macvault-core` only ever talk to the host through these traits,
//! so the provisioning state machine can run against fakes without hardware or
//! root privilege. Real implementations live in `macvault-system`.

pub mod command;
pub mod driver;
pub mod network;
pub mod secret;
pub mod system;

pub use command::{CommandOutput, CommandRunner};
pub use driver::{AddressProgrammer, DriverLoad, DriverManager, ModuleInspector};
pub use network::{InterfaceAddress, NetworkManager};
pub use secret::SecretInput;
pub use system::SystemInfo;
