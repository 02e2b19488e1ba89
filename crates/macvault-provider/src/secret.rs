//! Contract for reading secrets from the operator.

use std::error::Error;

/// Interactive secret entry without echo.
pub trait SecretInput {
    type Error: Error + Send + Sync + 'static;

    fn read_secret(&self, prompt: &str) -> Result<String, Self::Error>;
}
