//! Contract for running external programs.

use std::error::Error;

/// Captured result of a finished external program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr, fall back to stdout, trimmed.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }

    /// stdout followed by stderr, the way an operator would see it in a terminal.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

/// Synchronous process execution.
///
/// A non-zero exit status is reported through [`CommandOutput::status`], not as an
/// error; `Err` is reserved for failures to spawn or collect the process.
pub trait CommandRunner {
    type Error: Error + Send + Sync + 'static;

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, Self::Error>;
}
