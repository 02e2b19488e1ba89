//! Execution wrapper for host tools.
//!
//! Keeps process handling isolated so the adapters above it stay testable
//! against a scripted [`CommandRunner`].

use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::{CommandOutput, CommandRunner};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;

/// Runs programs on the host with a fixed `C` locale so parsers see stable output.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    type Error = MacvaultError;

    fn run(&self, program: &str, args: &[&str]) -> MacvaultResult<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                MacvaultError::Provider(format!("failed to start {program}: {err}"))
            })?;

        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());
        let status = child.wait()?;

        let stdout = stdout_handle
            .join()
            .map_err(|_| MacvaultError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| MacvaultError::Provider("stderr reader thread panicked".into()))??;

        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<MacvaultResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> MacvaultResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

/// Run `program` and turn a non-zero exit into a `Provider` error carrying
/// the tool's own diagnostic.
pub(crate) fn run_checked<R>(
    runner: &R,
    program: &str,
    args: &[&str],
) -> MacvaultResult<CommandOutput>
where
    R: CommandRunner<Error = MacvaultError>,
{
    let output = runner.run(program, args)?;
    if output.success() {
        return Ok(output);
    }
    Err(MacvaultError::Provider(describe_failure(program, args, &output)))
}

pub(crate) fn describe_failure(program: &str, args: &[&str], output: &CommandOutput) -> String {
    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = if diagnostic.is_empty() {
        "no additional output".to_string()
    } else {
        diagnostic
    };
    let invocation = if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    };

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "`{invocation}` failed: {diagnostic}. This requires root privileges (exit code {})",
            output.status
        );
    }

    format!("`{invocation}` failed: {diagnostic} (exit code {})", output.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn failure_message_names_invocation_and_exit_code() {
        let message = describe_failure(
            "ip",
            &["link", "set", "dev", "eth9", "up"],
            &failed("Cannot find device \"eth9\""),
        );
        assert_eq!(
            message,
            "`ip link set dev eth9 up` failed: Cannot find device \"eth9\" (exit code 1)"
        );
    }

    #[test]
    fn permission_failures_point_at_root() {
        let message = describe_failure(
            "rmmod",
            &["r8169"],
            &failed("rmmod: ERROR: Operation not permitted"),
        );
        assert!(message.contains("requires root"));
    }

    #[test]
    fn empty_diagnostic_is_spelled_out() {
        let message = describe_failure("make", &[], &failed(""));
        assert!(message.contains("no additional output"));
    }

    #[test]
    fn captures_status_and_streams_of_real_process() {
        let output = SystemCommandRunner::new()
            .run("sh", &["-c", "echo out; echo err >&2; exit 3"])
            .unwrap();
        assert_eq!(output.status, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn missing_program_is_a_provider_error() {
        let err = SystemCommandRunner::new()
            .run("/nonexistent/macvault-test-binary", &[])
            .unwrap_err();
        assert!(matches!(err, MacvaultError::Provider(_)));
    }
}
