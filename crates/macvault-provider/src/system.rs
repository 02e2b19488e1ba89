//! Contract for host identity queries.

use std::error::Error;

/// Product and host identity strings used for attribution and operation logs.
pub trait SystemInfo {
    type Error: Error + Send + Sync + 'static;

    /// SMBIOS product name of the machine being provisioned.
    fn product_name(&self) -> Result<String, Self::Error>;

    /// Full, unparsed SMBIOS dump.
    fn dmi_dump(&self) -> Result<String, Self::Error>;

    fn hostname(&self) -> Result<String, Self::Error>;

    fn kernel_release(&self) -> Result<String, Self::Error>;

    fn machine_arch(&self) -> Result<String, Self::Error>;

    fn uptime(&self) -> Result<String, Self::Error>;
}
