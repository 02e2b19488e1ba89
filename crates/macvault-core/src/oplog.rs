//! Completed-operation records: what was written to which machine, captured
//! as JSON for local archival and optional shipping to a collection host.

use crate::address::MacAddress;
use crate::error::{MacvaultError, MacvaultResult};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use macvault_provider::{CommandRunner, SystemInfo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const UNKNOWN: &str = "unknown";

/// `key: value` pairs of one `dmidecode` handle block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DmiSection {
    /// First non key/value line of the block, e.g. `System Information`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

/// Parsed `dmidecode` output keyed by the `Handle ...` header line.
pub type DmiTable = BTreeMap<String, DmiSection>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub kernel: String,
    pub arch: String,
    pub uptime: String,
}

impl HostInfo {
    /// Query each field independently; failures become `unknown`.
    pub fn collect<S>(system: &S) -> Self
    where
        S: SystemInfo,
    {
        Self {
            hostname: or_unknown("hostname", system.hostname()),
            kernel: or_unknown("kernel release", system.kernel_release()),
            arch: or_unknown("machine architecture", system.machine_arch()),
            uptime: or_unknown("uptime", system.uptime()),
        }
    }
}

fn or_unknown<E: std::fmt::Display>(what: &str, value: Result<String, E>) -> String {
    match value {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => UNKNOWN.to_string(),
        Err(err) => {
            debug!("could not determine {what}: {err}");
            UNKNOWN.to_string()
        }
    }
}

/// One provisioning run, as archived.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub timestamp: String,
    pub product_name: String,
    pub mac_address: String,
    pub action_performed: String,
    pub success: bool,
    pub system_info: DmiTable,
    pub host_info: HostInfo,
    #[serde(skip)]
    recorded_at: DateTime<Local>,
}

impl OperationRecord {
    pub fn new(
        product_name: impl Into<String>,
        address: &MacAddress,
        action: impl Into<String>,
        success: bool,
        system_info: DmiTable,
        host_info: HostInfo,
        recorded_at: DateTime<Local>,
    ) -> Self {
        Self {
            timestamp: recorded_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            product_name: product_name.into(),
            mac_address: address.to_string(),
            action_performed: action.into(),
            success,
            system_info,
            host_info,
            recorded_at,
        }
    }

    /// Build a record, querying the host for SMBIOS and identity details.
    pub fn capture<S>(
        system: &S,
        product_name: &str,
        address: &MacAddress,
        action: &str,
        success: bool,
    ) -> Self
    where
        S: SystemInfo,
    {
        let system_info = match system.dmi_dump() {
            Ok(dump) => parse_dmidecode(&dump),
            Err(err) => {
                warn!("could not read dmidecode output for the operation log: {err}");
                DmiTable::new()
            }
        };
        Self::new(
            product_name,
            address,
            action,
            success,
            system_info,
            HostInfo::collect(system),
            Local::now(),
        )
    }

    /// `<product>_MAC-<HEX12>_<yymmdd_HHMMSS>.json`
    pub fn file_name(&self) -> String {
        let compact: String = self
            .mac_address
            .chars()
            .filter(|ch| ch.is_ascii_hexdigit())
            .collect();
        format!(
            "{}_MAC-{}_{}.json",
            file_safe(&self.product_name),
            compact,
            self.recorded_at.format("%y%m%d_%H%M%S")
        )
    }

    pub fn to_json(&self) -> MacvaultResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write under `dir`, creating it if needed. Falls back to the working
    /// directory when `dir` cannot be created.
    pub fn write_to_dir(&self, dir: &Path) -> MacvaultResult<PathBuf> {
        let target_dir = match fs::create_dir_all(dir) {
            Ok(()) => dir.to_path_buf(),
            Err(err) => {
                warn!(
                    "could not create log directory {}: {err}; writing to the working directory",
                    dir.display()
                );
                PathBuf::from(".")
            }
        };
        let path = target_dir.join(self.file_name());
        fs::write(&path, self.to_json()?)?;
        info!("operation log saved to {}", path.display());
        Ok(path)
    }
}

/// Product names end up in file names; keep them to a portable character set.
fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "Unknown".to_string()
    } else {
        cleaned
    }
}

/// Group `dmidecode` output into sections. Every `Handle` line opens a new
/// section; `key: value` lines inside it become fields. Sections without
/// fields are dropped.
pub fn parse_dmidecode(output: &str) -> DmiTable {
    let mut table = DmiTable::new();
    let mut current: Option<(String, DmiSection)> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("Handle") {
            if let Some((key, section)) = current.take() {
                if !section.fields.is_empty() {
                    table.insert(key, section);
                }
            }
            current = Some((line.to_string(), DmiSection::default()));
            continue;
        }

        let Some((_, section)) = current.as_mut() else {
            continue;
        };
        match line.split_once(':') {
            Some((key, value)) => {
                section
                    .fields
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
            None if section.title.is_none() => section.title = Some(line.to_string()),
            None => {}
        }
    }

    if let Some((key, section)) = current {
        if !section.fields.is_empty() {
            table.insert(key, section);
        }
    }
    table
}

/// `user@host:dir` → (`user@host`, `dir`).
fn split_server(server: &str) -> (&str, Option<&str>) {
    match server.split_once(':') {
        Some((host, path)) if !path.is_empty() => (host, Some(path.trim_end_matches('/'))),
        Some((host, _)) => (host, None),
        None => (server, None),
    }
}

/// scp destination for `file_name` on `server`.
pub fn remote_destination(server: &str, file_name: &str) -> String {
    match split_server(server.trim()) {
        (host, Some(dir)) => format!("{host}:{dir}/{file_name}"),
        (host, None) => format!("{host}:{file_name}"),
    }
}

/// Copy the record to `server` with `scp`. Returns the remote destination.
pub fn ship<R>(runner: &R, record: &OperationRecord, server: &str) -> MacvaultResult<String>
where
    R: CommandRunner<Error = MacvaultError>,
{
    let mut staged = tempfile::Builder::new()
        .prefix("mac-log-")
        .suffix(".json")
        .tempfile()?;
    staged.write_all(record.to_json()?.as_bytes())?;
    staged.flush()?;

    let destination = remote_destination(server, &record.file_name());
    let staged_path = staged.path().to_string_lossy().into_owned();
    let output = runner.run(
        "scp",
        &[
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            &staged_path,
            &destination,
        ],
    )?;
    if !output.success() {
        return Err(MacvaultError::Provider(format!(
            "scp to {destination} failed: {}",
            output.combined()
        )));
    }
    info!("operation log sent to {destination}");
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use macvault_provider::CommandOutput;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    const DMI_SAMPLE: &str = "\
# dmidecode 3.3
Getting SMBIOS data from sysfs.

Handle 0x0000, DMI type 0, 26 bytes
BIOS Information
\tVendor: American Megatrends Inc.
\tVersion: 1.2.3

Handle 0x0001, DMI type 1, 27 bytes
System Information
\tManufacturer: Acme
\tProduct Name: Bench Unit 7
\tSerial Number: ABC123

Handle 0x0002, DMI type 127, 4 bytes
End Of Table
";

    fn record(product: &str) -> OperationRecord {
        OperationRecord::new(
            product,
            &"00:1A:2B:3C:4D:5E".parse().unwrap(),
            "MAC address written",
            true,
            parse_dmidecode(DMI_SAMPLE),
            HostInfo {
                hostname: "bench-7".into(),
                kernel: "6.1.0".into(),
                arch: "x86_64".into(),
                uptime: UNKNOWN.into(),
            },
            Local.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap(),
        )
    }

    #[test]
    fn parses_dmidecode_sections() {
        let table = parse_dmidecode(DMI_SAMPLE);
        assert_eq!(table.len(), 2, "empty End Of Table section is dropped");
        let system = &table["Handle 0x0001, DMI type 1, 27 bytes"];
        assert_eq!(system.title.as_deref(), Some("System Information"));
        assert_eq!(system.fields["Product Name"], "Bench Unit 7");
        assert_eq!(system.fields["Serial Number"], "ABC123");
    }

    #[test]
    fn names_and_serialises_records() {
        let record = record("Bench Unit/7");
        assert_eq!(
            record.file_name(),
            "Bench_Unit_7_MAC-001A2B3C4D5E_250304_050607.json"
        );

        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["timestamp"], "2025-03-04T05:06:07");
        assert_eq!(json["mac_address"], "00:1A:2B:3C:4D:5E");
        assert_eq!(json["success"], true);
        assert_eq!(json["host_info"]["hostname"], "bench-7");
        assert_eq!(
            json["system_info"]["Handle 0x0000, DMI type 0, 26 bytes"]["Vendor"],
            "American Megatrends Inc."
        );
        assert!(json.get("recorded_at").is_none());
    }

    #[test]
    fn writes_into_created_directory() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        let path = record("Bench").write_to_dir(&logs).unwrap();
        assert!(path.starts_with(&logs));
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.contains("\"product_name\": \"Bench\""));
    }

    #[test]
    fn builds_remote_destinations() {
        assert_eq!(
            remote_destination("ops@logs:/srv/macs/", "a.json"),
            "ops@logs:/srv/macs/a.json"
        );
        assert_eq!(remote_destination("ops@logs", "a.json"), "ops@logs:a.json");
        assert_eq!(remote_destination("ops@logs:", "a.json"), "ops@logs:a.json");
    }

    #[derive(Default, Clone)]
    struct RecordingRunner {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        status: i32,
    }

    impl CommandRunner for RecordingRunner {
        type Error = MacvaultError;

        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, Self::Error> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().map(|arg| arg.to_string()));
            self.calls.lock().unwrap().push(call);
            Ok(CommandOutput {
                status: self.status,
                stdout: String::new(),
                stderr: if self.status == 0 {
                    String::new()
                } else {
                    "Connection refused".into()
                },
            })
        }
    }

    #[test]
    fn ships_with_scp() {
        let runner = RecordingRunner::default();
        let destination = ship(&runner, &record("Bench"), "ops@logs:/srv").unwrap();
        assert_eq!(
            destination,
            "ops@logs:/srv/Bench_MAC-001A2B3C4D5E_250304_050607.json"
        );
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0][0], "scp");
        assert_eq!(calls[0].last().unwrap(), &destination);
    }

    #[test]
    fn failed_scp_is_an_error() {
        let runner = RecordingRunner {
            status: 1,
            ..RecordingRunner::default()
        };
        let err = ship(&runner, &record("Bench"), "ops@logs").unwrap_err();
        assert!(err.to_string().contains("Connection refused"));
    }
}
