//! Wiring of the host-backed ports from configuration.

use crate::command::SystemCommandRunner;
use crate::driver::RtnicDriver;
use crate::kmod::SystemModules;
use crate::network::IpNetwork;
use crate::programmer::RtnicProgrammer;
use crate::sysinfo::HostSystem;
use macvault_core::config::DriverCfg;
use macvault_core::error::MacvaultResult;
use macvault_provider::SystemInfo;

pub type SystemDriver = RtnicDriver<SystemCommandRunner, SystemModules<SystemCommandRunner>>;

/// Every port the flasher needs, backed by the real host.
#[derive(Debug)]
pub struct SystemPorts {
    pub runner: SystemCommandRunner,
    pub driver: SystemDriver,
    pub programmer: RtnicProgrammer<SystemCommandRunner>,
    pub network: IpNetwork<SystemCommandRunner>,
    pub system: HostSystem<SystemCommandRunner>,
}

impl SystemPorts {
    /// Build the ports; the programming utility path needs the machine
    /// architecture, so this fails when `uname -m` does.
    pub fn from_config(cfg: &DriverCfg) -> MacvaultResult<Self> {
        let runner = SystemCommandRunner::new();
        let system = HostSystem::new(runner);
        let arch = system.machine_arch()?;
        Ok(Self {
            runner,
            driver: RtnicDriver::new(runner, SystemModules::new(runner), cfg),
            programmer: RtnicProgrammer::from_config(runner, cfg, &arch),
            network: IpNetwork::new(runner),
            system,
        })
    }
}
