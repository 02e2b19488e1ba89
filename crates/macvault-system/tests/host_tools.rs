use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::{AddressProgrammer, CommandRunner, NetworkManager};
use macvault_system::{IpNetwork, RtnicProgrammer, SystemCommandRunner};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

fn write_script(path: &Path, contents: &str, mode: u32) -> MacvaultResult<()> {
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[test]
fn programmer_makes_utility_executable_and_passes_nodeid() -> MacvaultResult<()> {
    let dir = tempdir()?;
    let args_file = dir.path().join("args.txt");
    let utility = dir.path().join("rtnicpg-x86_64");
    write_script(
        &utility,
        &format!("#!/bin/sh\necho \"$@\" > '{}'\n", args_file.display()),
        0o644,
    )?;

    let programmer = RtnicProgrammer::new(SystemCommandRunner::new(), &utility);
    programmer.write("001A2B3C4D5E")?;

    let mode = fs::metadata(&utility)?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
    assert_eq!(
        fs::read_to_string(&args_file)?.trim(),
        "/efuse /nicmac /nodeid 001A2B3C4D5E"
    );
    Ok(())
}

#[test]
fn programmer_failure_carries_utility_output() -> MacvaultResult<()> {
    let dir = tempdir()?;
    let utility = dir.path().join("rtnicpg-x86_64");
    write_script(
        &utility,
        "#!/bin/sh\necho 'EFUSE write failed' >&2\nexit 4\n",
        0o755,
    )?;

    let err = RtnicProgrammer::new(SystemCommandRunner::new(), &utility)
        .write("001A2B3C4D5E")
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("EFUSE write failed"));
    assert!(message.contains("exit code 4"));
    Ok(())
}

#[test]
fn programmer_rejects_non_compact_input_and_missing_utility() {
    let dir = tempdir().unwrap();
    let programmer =
        RtnicProgrammer::new(SystemCommandRunner::new(), dir.path().join("rtnicpg-x86_64"));
    assert!(matches!(
        programmer.write("00:1A:2B:3C:4D:5E"),
        Err(MacvaultError::InvalidAddress(_))
    ));
    assert!(matches!(
        programmer.write("001A2B3C4D5E"),
        Err(MacvaultError::Provider(_))
    ));
}

/// Replays canned `ip` output and records every invocation.
#[derive(Clone, Default)]
struct IpRecorder {
    calls: Arc<Mutex<Vec<String>>>,
    addr_add_status: i32,
}

impl CommandRunner for IpRecorder {
    type Error = MacvaultError;

    fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> MacvaultResult<macvault_provider::CommandOutput> {
        let call = format!("{program} {}", args.join(" "));
        self.calls.lock().unwrap().push(call.clone());
        let mut output = macvault_provider::CommandOutput::default();
        match call.as_str() {
            "ip -o link show" => {
                output.stdout = "2: enp3s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 \\    link/ether 00:1a:2b:3c:4d:5e brd ff:ff:ff:ff:ff:ff\n".into();
            }
            "ip addr show dev enp3s0" => {
                output.stdout = "2: enp3s0: <UP>\n    inet 10.0.0.5/24 scope global enp3s0\n".into();
            }
            call if call.starts_with("ip addr add") => {
                output.status = self.addr_add_status;
                if output.status != 0 {
                    output.stderr = "RTNETLINK answers: File exists".into();
                }
            }
            _ => {}
        }
        Ok(output)
    }
}

#[test]
fn network_commands_follow_iproute2_syntax() -> MacvaultResult<()> {
    let runner = IpRecorder::default();
    let network = IpNetwork::new(runner.clone());

    assert_eq!(
        network.interfaces_with_address("00:1a:2b:3c:4d:5e")?,
        vec!["enp3s0".to_string()]
    );
    assert!(network.interfaces_with_address("00:1a:2b:3c:4d:5f")?.is_empty());

    network.link_down("enp3s0")?;
    network.flush_addresses("enp3s0")?;
    network.set_address("enp3s0", "00:1a:2b:3c:4d:5e")?;
    network.link_up("enp3s0")?;
    network.add_address("enp3s0", "10.0.0.5/24")?;
    assert!(network.has_address("enp3s0", "10.0.0.5/24")?);
    assert!(!network.has_address("enp3s0", "10.0.0.6/24")?);

    let calls = runner.calls.lock().unwrap().clone();
    assert_eq!(
        &calls[2..7],
        [
            "ip link set dev enp3s0 down",
            "ip addr flush dev enp3s0",
            "ip link set dev enp3s0 address 00:1a:2b:3c:4d:5e",
            "ip link set dev enp3s0 up",
            "ip addr add 10.0.0.5/24 dev enp3s0",
        ]
    );
    Ok(())
}

#[test]
fn failed_address_assignment_is_a_restore_error() {
    let runner = IpRecorder {
        addr_add_status: 2,
        ..IpRecorder::default()
    };
    let err = IpNetwork::new(runner)
        .add_address("enp3s0", "10.0.0.5/24")
        .unwrap_err();
    assert!(matches!(err, MacvaultError::NetworkRestore(ref reason) if reason.contains("File exists")));
}
