//! Hardware address provisioning.
//!
//! One run walks `CheckExisting → {Satisfied | NeedsWrite} → DriverLoad →
//! WriteAttempt(1..n) → {Written | Exhausted} → VerifyInterface →
//! RestoreNetwork(1..m) → Done`. Every loop has a fixed bound. Exhausted
//! writes and a missing interface after a reported write are fatal; a failed
//! network restore is only a warning because the address is already burned in.

use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::address::MacAddress;
use crate::allocation;
use crate::config::RetryCfg;
use crate::error::{MacvaultError, MacvaultResult};
use crate::pool::Pool;
use crate::repository::PoolRepository;
use log::{debug, error, info, warn};
use macvault_provider::{
    AddressProgrammer, DriverLoad, DriverManager, InterfaceAddress, NetworkManager,
};
use std::mem;
use std::time::Duration;

pub const ACTION_NO_CHANGE: &str = "No changes required";
pub const ACTION_UPDATED: &str = "MAC address update";
pub const ACTION_FAILED: &str = "MAC address update failed";

/// Position in the provisioning state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    CheckExisting,
    Satisfied,
    NeedsWrite,
    DriverLoad,
    WriteAttempt(u32),
    Written,
    Exhausted,
    VerifyInterface,
    RestoreNetwork(u32),
    Done,
}

/// Retry bounds and backoff for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionSettings {
    pub write_attempts: u32,
    pub write_backoff: Duration,
    pub restore_attempts: u32,
    pub restore_backoff: Duration,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self::from_retry(&RetryCfg::default())
    }
}

impl ProvisionSettings {
    pub fn from_retry(retry: &RetryCfg) -> Self {
        Self {
            write_attempts: retry.write_attempts.max(1),
            write_backoff: retry.write_backoff(),
            restore_attempts: retry.restore_attempts.max(1),
            restore_backoff: retry.restore_backoff(),
        }
    }
}

/// Blocking wait between retries.
pub trait Pause {
    fn pause(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Everything one provisioning run needs to know about its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub address: MacAddress,
    pub hostname: String,
    pub product_name: String,
}

/// How the previously active IPv4 configuration was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkRestoreStatus {
    /// No write happened, so nothing was disturbed.
    NotNeeded,
    /// No active IPv4 address was captured before the write.
    NothingCaptured,
    Restored {
        interface: String,
        cidr: String,
        attempts: u32,
    },
    /// `ip addr add` failed but the address turned out to be present already.
    AlreadyAssigned { interface: String, cidr: String },
    Failed {
        interface: String,
        cidr: String,
        reason: String,
    },
}

/// Result of a run that did not hit a fatal condition.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub address: MacAddress,
    /// Interfaces carrying the address at the end of the run.
    pub interfaces: Vec<String>,
    pub driver: Option<DriverLoad>,
    pub write_attempts: u32,
    pub restore: NetworkRestoreStatus,
    pub trace: Vec<ProvisionState>,
    pub events: Vec<WorkflowEvent>,
}

impl ProvisionOutcome {
    /// True when the target already carried the address and nothing was written.
    pub fn satisfied(&self) -> bool {
        self.trace.contains(&ProvisionState::Satisfied)
    }

    pub fn action(&self) -> &'static str {
        if self.satisfied() {
            ACTION_NO_CHANGE
        } else {
            ACTION_UPDATED
        }
    }

    pub fn report(&self) -> WorkflowReport {
        WorkflowReport {
            title: format!("Provisioned {}", self.address),
            events: self.events.clone(),
        }
    }
}

/// A fatal run, with everything reported before it stopped.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub address: MacAddress,
    pub error: MacvaultError,
    pub trace: Vec<ProvisionState>,
    pub events: Vec<WorkflowEvent>,
}

impl ProvisionFailure {
    pub fn report(&self) -> WorkflowReport {
        WorkflowReport {
            title: format!("Provisioning {} failed", self.address),
            events: self.events.clone(),
        }
    }
}

/// Drives one hardware target through the provisioning state machine.
pub struct Provisioner<D, P, N, S = ThreadPause> {
    driver: D,
    programmer: P,
    network: N,
    pause: S,
    settings: ProvisionSettings,
}

impl<D, P, N> Provisioner<D, P, N, ThreadPause> {
    pub fn new(driver: D, programmer: P, network: N, settings: ProvisionSettings) -> Self {
        Self {
            driver,
            programmer,
            network,
            pause: ThreadPause,
            settings,
        }
    }
}

impl<D, P, N, S> Provisioner<D, P, N, S> {
    /// Replace the sleeper, e.g. with a recorder in tests.
    pub fn with_pause<T>(self, pause: T) -> Provisioner<D, P, N, T> {
        Provisioner {
            driver: self.driver,
            programmer: self.programmer,
            network: self.network,
            pause,
            settings: self.settings,
        }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }
}

struct Run {
    trace: Vec<ProvisionState>,
    events: Vec<WorkflowEvent>,
}

impl Run {
    fn enter(&mut self, state: ProvisionState) {
        debug!("provisioning state: {state:?}");
        self.trace.push(state);
    }

    fn note(&mut self, level: WorkflowLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            WorkflowLevel::Warn => warn!("{message}"),
            WorkflowLevel::Error => error!("{message}"),
            _ => info!("{message}"),
        }
        self.events.push(event(level, message));
    }
}

impl<D, P, N, S> Provisioner<D, P, N, S>
where
    D: DriverManager<Error = MacvaultError>,
    P: AddressProgrammer<Error = MacvaultError>,
    N: NetworkManager<Error = MacvaultError>,
    S: Pause,
{
    /// Put `request.address` on the target. Fatal conditions come back as
    /// `DriverLoad`, `HardwareWriteExhausted` or `InterfaceNotFound`.
    pub fn run(&self, request: &ProvisionRequest) -> MacvaultResult<ProvisionOutcome> {
        self.run_reported(request).map_err(|failure| failure.error)
    }

    /// Like [`run`](Self::run), but a fatal error keeps the attempt history.
    pub fn run_reported(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionOutcome, ProvisionFailure> {
        let mut run = Run {
            trace: Vec::new(),
            events: Vec::new(),
        };
        self.drive(request, &mut run).map_err(|error| ProvisionFailure {
            address: request.address,
            error,
            trace: run.trace,
            events: run.events,
        })
    }

    fn drive(
        &self,
        request: &ProvisionRequest,
        run: &mut Run,
    ) -> MacvaultResult<ProvisionOutcome> {
        let address = request.address;
        let link_form = address.to_link_form();

        run.enter(ProvisionState::CheckExisting);
        let existing = match self.network.interfaces_with_address(&link_form) {
            Ok(found) => found,
            Err(err) => {
                debug!("interface scan failed, assuming {address} is absent: {err}");
                Vec::new()
            }
        };
        if !existing.is_empty() {
            run.enter(ProvisionState::Satisfied);
            run.note(
                WorkflowLevel::Success,
                format!(
                    "{address} is already present on {}; no reflash required",
                    existing.join(", ")
                ),
            );
            run.enter(ProvisionState::Done);
            return Ok(ProvisionOutcome {
                address,
                interfaces: existing,
                driver: None,
                write_attempts: 0,
                restore: NetworkRestoreStatus::NotNeeded,
                trace: mem::take(&mut run.trace),
                events: mem::take(&mut run.events),
            });
        }

        run.enter(ProvisionState::NeedsWrite);
        run.note(
            WorkflowLevel::Info,
            format!("{address} not found on any interface; flashing is required"),
        );

        let previous = match self.network.active_ipv4() {
            Ok(Some(found)) => {
                run.note(
                    WorkflowLevel::Info,
                    format!("Captured {} on {} for restore", found.cidr, found.interface),
                );
                Some(found)
            }
            Ok(None) => {
                run.note(
                    WorkflowLevel::Warn,
                    "No active IPv4 interface found; network settings will not be restored",
                );
                None
            }
            Err(err) => {
                run.note(
                    WorkflowLevel::Warn,
                    format!("Could not read active network configuration: {err}"),
                );
                None
            }
        };

        run.enter(ProvisionState::DriverLoad);
        let driver = self.load_driver(run)?;

        let write_attempts = self.write_with_retries(run, &address)?;
        run.enter(ProvisionState::Written);
        run.note(
            WorkflowLevel::Success,
            format!("{address} written after {write_attempts} attempt(s)"),
        );

        if let Err(err) = self.driver.release() {
            run.note(
                WorkflowLevel::Warn,
                format!("Could not hand the NIC back to its regular driver: {err}"),
            );
        }

        run.enter(ProvisionState::VerifyInterface);
        let interfaces = match self.network.interfaces_with_address(&link_form) {
            Ok(found) if !found.is_empty() => found,
            Ok(_) => {
                run.note(
                    WorkflowLevel::Error,
                    format!("No interface reports {address} after a successful write"),
                );
                return Err(MacvaultError::InterfaceNotFound(address.to_string()));
            }
            Err(err) => {
                run.note(
                    WorkflowLevel::Error,
                    format!("Interface scan after write failed: {err}"),
                );
                return Err(MacvaultError::InterfaceNotFound(address.to_string()));
            }
        };
        run.note(
            WorkflowLevel::Info,
            format!("{address} is live on {}", interfaces.join(", ")),
        );

        let restore = match previous {
            Some(previous) => self.restore_network(run, &link_form, &interfaces, previous),
            None => NetworkRestoreStatus::NothingCaptured,
        };

        run.enter(ProvisionState::Done);
        Ok(ProvisionOutcome {
            address,
            interfaces,
            driver: Some(driver),
            write_attempts,
            restore,
            trace: mem::take(&mut run.trace),
            events: mem::take(&mut run.events),
        })
    }

    /// Load the programming driver, rebuilding once if the first load fails.
    fn load_driver(&self, run: &mut Run) -> MacvaultResult<DriverLoad> {
        match self.driver.ensure_loaded() {
            Ok(load) => {
                run.note(WorkflowLevel::Info, describe_driver_load(&load));
                return Ok(load);
            }
            Err(err) => run.note(
                WorkflowLevel::Warn,
                format!("Initial driver load failed: {err}; recompiling"),
            ),
        }

        let retried = self
            .driver
            .rebuild()
            .and_then(|()| self.driver.ensure_loaded());
        match retried {
            Ok(load) => {
                run.note(WorkflowLevel::Info, describe_driver_load(&load));
                Ok(load)
            }
            Err(err) => {
                run.note(
                    WorkflowLevel::Error,
                    format!("Driver load failed even after recompilation: {err}"),
                );
                Err(match err {
                    MacvaultError::DriverLoad(reason) => MacvaultError::DriverLoad(reason),
                    other => MacvaultError::DriverLoad(other.to_string()),
                })
            }
        }
    }

    /// Returns the number of attempts used.
    fn write_with_retries(&self, run: &mut Run, address: &MacAddress) -> MacvaultResult<u32> {
        let max = self.settings.write_attempts.max(1);
        let compact = address.compact();
        let mut last_error = String::new();

        for attempt in 1..=max {
            run.enter(ProvisionState::WriteAttempt(attempt));
            match self.programmer.write(&compact) {
                Ok(()) => return Ok(attempt),
                Err(err) => {
                    last_error = err.to_string();
                    run.note(
                        WorkflowLevel::Warn,
                        format!("Attempt {attempt}/{max}: failed to write {address}: {err}"),
                    );
                }
            }

            if attempt == 1 {
                self.recover_driver(run);
            }
            if attempt < max {
                self.pause.pause(self.settings.write_backoff);
            }
        }

        run.enter(ProvisionState::Exhausted);
        run.note(
            WorkflowLevel::Error,
            format!(
                "Failed to write {address} after {max} attempts. Power off the system and \
                 diagnose the hardware before retrying."
            ),
        );
        Err(MacvaultError::HardwareWriteExhausted {
            attempts: max,
            last_error,
        })
    }

    fn recover_driver(&self, run: &mut Run) {
        run.note(
            WorkflowLevel::Warn,
            "Recompiling and reloading the driver before retrying",
        );
        if let Err(err) = self.driver.rebuild() {
            run.note(
                WorkflowLevel::Warn,
                format!("Driver recompilation failed: {err}"),
            );
            return;
        }
        if let Err(err) = self.driver.ensure_loaded() {
            run.note(
                WorkflowLevel::Warn,
                format!("Driver reload after recompilation failed: {err}"),
            );
        }
    }

    fn restore_network(
        &self,
        run: &mut Run,
        link_form: &str,
        interfaces: &[String],
        previous: InterfaceAddress,
    ) -> NetworkRestoreStatus {
        let interface = match interfaces
            .iter()
            .find(|candidate| **candidate == previous.interface)
        {
            Some(same) => same.clone(),
            None => {
                let first = interfaces[0].clone();
                if interfaces.len() > 1 {
                    run.note(
                        WorkflowLevel::Warn,
                        format!("Several interfaces carry the new address; using {first}"),
                    );
                }
                first
            }
        };
        let cidr = previous.cidr;
        let max = self.settings.restore_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            run.enter(ProvisionState::RestoreNetwork(attempt));
            self.reset_link(&interface, link_form);

            match self.network.add_address(&interface, &cidr) {
                Ok(()) => {
                    run.note(
                        WorkflowLevel::Success,
                        format!("Interface {interface} restarted with {cidr}"),
                    );
                    return NetworkRestoreStatus::Restored {
                        interface,
                        cidr,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    last_error = err.to_string();
                    run.note(
                        WorkflowLevel::Warn,
                        format!("Attempt {attempt}/{max}: could not assign {cidr} to {interface}: {err}"),
                    );
                }
            }

            if let Ok(true) = self.network.has_address(&interface, &cidr) {
                run.note(
                    WorkflowLevel::Info,
                    format!("{cidr} is already assigned to {interface}"),
                );
                return NetworkRestoreStatus::AlreadyAssigned { interface, cidr };
            }

            if attempt < max {
                self.pause.pause(self.settings.restore_backoff);
            }
        }

        run.note(
            WorkflowLevel::Warn,
            format!(
                "Network restore on {interface} failed after {max} attempts; the address \
                 write itself succeeded. Reassign {cidr} manually."
            ),
        );
        NetworkRestoreStatus::Failed {
            interface,
            cidr,
            reason: last_error,
        }
    }

    /// Down, flush, set address, up. Individual failures are not fatal; the
    /// address assignment that follows decides the outcome.
    fn reset_link(&self, interface: &str, link_form: &str) {
        let steps = [
            ("link down", self.network.link_down(interface)),
            ("flush addresses", self.network.flush_addresses(interface)),
            ("set address", self.network.set_address(interface, link_form)),
            ("link up", self.network.link_up(interface)),
        ];
        for (step, result) in steps {
            if let Err(err) = result {
                debug!("{step} on {interface} failed: {err}");
            }
        }
    }
}

fn describe_driver_load(load: &DriverLoad) -> String {
    match load {
        DriverLoad::AlreadyLoaded(name) => format!("Driver {name} already loaded"),
        DriverLoad::Inserted(path) => format!("Loaded driver {}", path.display()),
        DriverLoad::Compiled(path) => format!("Compiled and loaded driver {}", path.display()),
    }
}

/// Mark the provisioned address used, attributed to the host and interfaces,
/// then sign and save. Returns the attribution written.
pub fn record_allocation(
    repository: &mut PoolRepository,
    pool: &mut Pool,
    passphrase: &str,
    request: &ProvisionRequest,
    interfaces: &[String],
) -> MacvaultResult<String> {
    let used_by = allocation::attribution(&request.hostname, interfaces);
    if !allocation::mark_used(pool, &request.address, &used_by) {
        return Err(MacvaultError::UnknownAddress(request.address));
    }
    repository.commit(pool, passphrase)?;
    info!("{} marked used by {used_by}", request.address);
    Ok(used_by)
}
