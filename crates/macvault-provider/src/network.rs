//! Contract for inspecting and reconfiguring network links.

use std::error::Error;

/// An interface together with one IPv4 address in CIDR notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub interface: String,
    /// e.g. `192.168.1.20/24`
    pub cidr: String,
}

/// Link-layer and IPv4 operations over the host's interfaces.
///
/// Addresses passed in are lowercase colon form (`aa:bb:cc:dd:ee:ff`).
pub trait NetworkManager {
    type Error: Error + Send + Sync + 'static;

    /// Names of every interface currently carrying `address`.
    fn interfaces_with_address(&self, address: &str) -> Result<Vec<String>, Self::Error>;

    /// First UP, non-loopback interface together with its first IPv4 address.
    fn active_ipv4(&self) -> Result<Option<InterfaceAddress>, Self::Error>;

    fn link_down(&self, interface: &str) -> Result<(), Self::Error>;

    fn flush_addresses(&self, interface: &str) -> Result<(), Self::Error>;

    fn set_address(&self, interface: &str, address: &str) -> Result<(), Self::Error>;

    fn link_up(&self, interface: &str) -> Result<(), Self::Error>;

    fn add_address(&self, interface: &str, cidr: &str) -> Result<(), Self::Error>;

    /// True when `cidr` is already assigned to `interface`.
    fn has_address(&self, interface: &str, cidr: &str) -> Result<bool, Self::Error>;
}
