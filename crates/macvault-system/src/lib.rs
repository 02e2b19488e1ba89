#![forbid(unsafe_code)]

//! Host-backed implementations of the macvault capability ports.
//!
//! Integrates with the machine being provisioned via:
//! - `ip` for link and IPv4 state
//! - `lsmod`/`rmmod`/`insmod`/`modprobe` and `make` for the vendor programming driver
//! - the vendor `rtnicpg-<arch>` utility for burning the address
//! - `dmidecode`, `uname` and `uptime` for identity

mod command;
mod driver;
mod kmod;
mod network;
mod ports;
mod programmer;
mod secret;
mod sysinfo;

pub use command::SystemCommandRunner;
pub use driver::RtnicDriver;
pub use kmod::{parse_lsmod, SystemModules};
pub use network::{find_active_ipv4, parse_link_addresses, IpNetwork};
pub use ports::{SystemDriver, SystemPorts};
pub use programmer::RtnicProgrammer;
pub use secret::TerminalSecret;
pub use sysinfo::{parse_product_name, HostSystem};
