use crate::error::{MacvaultError, MacvaultResult};

/// Loading kernel modules and rewriting interfaces needs root; check once at
/// startup instead of failing halfway through a write.
pub fn ensure_root() -> MacvaultResult<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(missing_privilege_error())
    }
}

#[cfg(unix)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    true
}

fn missing_privilege_error() -> MacvaultError {
    MacvaultError::Privilege(
        "macvault-flash must run as root to load the programming driver and reconfigure \
         network interfaces. Re-run it with sudo."
            .into(),
    )
}
