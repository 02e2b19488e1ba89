use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::SecretInput;

/// Reads passphrases from the controlling terminal without echo.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalSecret;

impl SecretInput for TerminalSecret {
    type Error = MacvaultError;

    fn read_secret(&self, prompt: &str) -> MacvaultResult<String> {
        Ok(rpassword::prompt_password(prompt)?)
    }
}
