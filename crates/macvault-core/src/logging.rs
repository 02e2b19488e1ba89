//! Process-wide logger setup shared by the binaries.

use std::sync::Once;

const LOG_ENV: &str = "MACVAULT_LOG";
const FALLBACK_ENV: &str = "RUST_LOG";

static INIT: Once = Once::new();

/// Install `env_logger`, honouring `MACVAULT_LOG` then `RUST_LOG`, else `default_level`.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let filter = std::env::var(LOG_ENV)
            .or_else(|_| std::env::var(FALLBACK_ENV))
            .unwrap_or_else(|_| default_level.to_string());
        let _ = env_logger::Builder::new()
            .parse_filters(&filter)
            .format_timestamp_secs()
            .try_init();
    });
}
