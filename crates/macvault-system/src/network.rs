//! Link and IPv4 handling through iproute2.

use crate::command::run_checked;
use macvault_core::error::{MacvaultError, MacvaultResult};
use macvault_provider::{CommandRunner, InterfaceAddress, NetworkManager};
use regex::Regex;
use std::sync::OnceLock;

static LINK_RE: OnceLock<Regex> = OnceLock::new();
static HEADER_RE: OnceLock<Regex> = OnceLock::new();

fn header_re() -> &'static Regex {
    HEADER_RE.get_or_init(|| {
        Regex::new(r"^\d+:\s+([^:]+):\s+<([^>]*)>").expect("valid interface header regex")
    })
}

/// Strip the `@peer` suffix `ip` prints for veth and VLAN links.
fn interface_name(raw: &str) -> &str {
    raw.split('@').next().unwrap_or(raw).trim()
}

/// `(interface, lowercase mac)` pairs from `ip -o link show`.
pub fn parse_link_addresses(output: &str) -> Vec<(String, String)> {
    let re = LINK_RE.get_or_init(|| {
        Regex::new(r"^\d+:\s+([^:]+):.*link/ether\s+([0-9A-Fa-f:]+)").expect("valid link regex")
    });
    output
        .lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| {
            (
                interface_name(&caps[1]).to_string(),
                caps[2].to_ascii_lowercase(),
            )
        })
        .collect()
}

/// First UP, non-loopback interface with an `inet` address in `ip a` output.
pub fn find_active_ipv4(output: &str) -> Option<InterfaceAddress> {
    let re = header_re();
    let mut current: Option<String> = None;

    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(caps) = re.captures(line) {
            let name = interface_name(&caps[1]);
            let up = caps[2].split(',').any(|flag| flag == "UP");
            current = (up && name != "lo").then(|| name.to_string());
            continue;
        }
        let Some(interface) = &current else {
            continue;
        };
        if let Some(rest) = line.strip_prefix("inet ") {
            if let Some(cidr) = rest.split_whitespace().next() {
                return Some(InterfaceAddress {
                    interface: interface.clone(),
                    cidr: cidr.to_string(),
                });
            }
        }
    }
    None
}

/// IPv4 addresses (CIDR form) listed in `ip addr show dev <iface>` output.
fn inet_addresses(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("inet "))
        .filter_map(|rest| rest.split_whitespace().next())
        .collect()
}

/// [`NetworkManager`] backed by the `ip` tool.
#[derive(Debug, Clone)]
pub struct IpNetwork<R> {
    runner: R,
}

impl<R> IpNetwork<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R> IpNetwork<R>
where
    R: CommandRunner<Error = MacvaultError>,
{
    fn ip(&self, args: &[&str]) -> MacvaultResult<String> {
        run_checked(&self.runner, "ip", args).map(|output| output.stdout)
    }
}

impl<R> NetworkManager for IpNetwork<R>
where
    R: CommandRunner<Error = MacvaultError>,
{
    type Error = MacvaultError;

    fn interfaces_with_address(&self, address: &str) -> MacvaultResult<Vec<String>> {
        let listing = self.ip(&["-o", "link", "show"])?;
        Ok(parse_link_addresses(&listing)
            .into_iter()
            .filter(|(_, mac)| mac.eq_ignore_ascii_case(address))
            .map(|(interface, _)| interface)
            .collect())
    }

    fn active_ipv4(&self) -> MacvaultResult<Option<InterfaceAddress>> {
        let listing = self.ip(&["a"])?;
        Ok(find_active_ipv4(&listing))
    }

    fn link_down(&self, interface: &str) -> MacvaultResult<()> {
        self.ip(&["link", "set", "dev", interface, "down"]).map(|_| ())
    }

    fn flush_addresses(&self, interface: &str) -> MacvaultResult<()> {
        self.ip(&["addr", "flush", "dev", interface]).map(|_| ())
    }

    fn set_address(&self, interface: &str, address: &str) -> MacvaultResult<()> {
        self.ip(&["link", "set", "dev", interface, "address", address])
            .map(|_| ())
    }

    fn link_up(&self, interface: &str) -> MacvaultResult<()> {
        self.ip(&["link", "set", "dev", interface, "up"]).map(|_| ())
    }

    fn add_address(&self, interface: &str, cidr: &str) -> MacvaultResult<()> {
        self.ip(&["addr", "add", cidr, "dev", interface])
            .map(|_| ())
            .map_err(|err| MacvaultError::NetworkRestore(err.to_string()))
    }

    fn has_address(&self, interface: &str, cidr: &str) -> MacvaultResult<bool> {
        let listing = self.ip(&["addr", "show", "dev", interface])?;
        Ok(inet_addresses(&listing).contains(&cidr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINKS: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: enp3s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000\\    link/ether 00:1a:2b:3c:4d:5e brd ff:ff:ff:ff:ff:ff
3: enp4s0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq_codel state DOWN mode DEFAULT group default qlen 1000\\    link/ether 00:E0:4C:68:00:01 brd ff:ff:ff:ff:ff:ff
4: veth1@if5: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default qlen 1000\\    link/ether 3a:11:22:33:44:55 brd ff:ff:ff:ff:ff:ff link-netnsid 0
";

    const ADDRS: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000
    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
    inet 127.0.0.1/8 scope host lo
       valid_lft forever preferred_lft forever
2: enp4s0: <NO-CARRIER,BROADCAST,MULTICAST> mtu 1500 qdisc fq_codel state DOWN group default qlen 1000
    link/ether 00:e0:4c:68:00:01 brd ff:ff:ff:ff:ff:ff
    inet 10.9.9.9/24 brd 10.9.9.255 scope global enp4s0
3: wlp2s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000
    link/ether 9c:b6:d0:00:00:01 brd ff:ff:ff:ff:ff:ff
    inet6 fe80::1/64 scope link
       valid_lft forever preferred_lft forever
4: enp3s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP group default qlen 1000
    link/ether 00:1a:2b:3c:4d:5e brd ff:ff:ff:ff:ff:ff
    inet 192.168.1.20/24 brd 192.168.1.255 scope global dynamic enp3s0
       valid_lft 86000sec preferred_lft 86000sec
    inet 192.168.1.21/24 scope global secondary enp3s0
";

    #[test]
    fn link_listing_yields_lowercase_addresses() {
        let links = parse_link_addresses(LINKS);
        assert_eq!(
            links,
            vec![
                ("enp3s0".to_string(), "00:1a:2b:3c:4d:5e".to_string()),
                ("enp4s0".to_string(), "00:e0:4c:68:00:01".to_string()),
                ("veth1".to_string(), "3a:11:22:33:44:55".to_string()),
            ]
        );
    }

    #[test]
    fn active_ipv4_skips_loopback_down_and_ipv6_only_links() {
        assert_eq!(
            find_active_ipv4(ADDRS),
            Some(InterfaceAddress {
                interface: "enp3s0".into(),
                cidr: "192.168.1.20/24".into(),
            })
        );
    }

    #[test]
    fn no_active_ipv4_when_only_loopback_is_up() {
        let only_lo = ADDRS.lines().take(4).collect::<Vec<_>>().join("\n");
        assert_eq!(find_active_ipv4(&only_lo), None);
    }

    #[test]
    fn inet_listing_matches_exact_cidr() {
        let addrs = inet_addresses(ADDRS);
        assert!(addrs.contains(&"192.168.1.21/24"));
        assert!(!addrs.contains(&"192.168.1.2/24"));
    }
}
