//! Hardware address and vendor prefix value types.

use crate::error::{MacvaultError, MacvaultResult};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const ADDRESS_OCTETS: usize = 6;

static EMBEDDED_ADDRESS_RE: OnceLock<Regex> = OnceLock::new();

/// A 48-bit hardware address.
///
/// Displays in canonical form: uppercase octets separated by colons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; ADDRESS_OCTETS]);

impl MacAddress {
    pub fn from_octets(octets: [u8; ADDRESS_OCTETS]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; ADDRESS_OCTETS] {
        self.0
    }

    /// Separators stripped, uppercase (`AABBCCDDEEFF`), as the programming utility expects.
    pub fn compact(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Lowercase colon form, as reported by `ip link`.
    pub fn to_link_form(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    /// Case-insensitive comparison against a stored textual address.
    pub fn matches(&self, text: &str) -> bool {
        text.parse::<MacAddress>()
            .map(|other| other == *self)
            .unwrap_or(false)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = MacvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets = parse_octets(s.trim())
            .filter(|octets| octets.len() == ADDRESS_OCTETS)
            .ok_or_else(|| MacvaultError::InvalidAddress(s.trim().to_string()))?;
        let mut raw = [0u8; ADDRESS_OCTETS];
        raw.copy_from_slice(&octets);
        Ok(Self(raw))
    }
}

/// Fixed leading octets that constrain generated addresses to an organisational range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VendorPrefix(Vec<u8>);

impl VendorPrefix {
    pub fn octets(&self) -> &[u8] {
        &self.0
    }

    /// Number of random octets left for generated addresses.
    pub fn suffix_len(&self) -> usize {
        ADDRESS_OCTETS - self.0.len()
    }

    /// Size of the address space under this prefix: 16^(12 - prefix digits).
    pub fn capacity(&self) -> u64 {
        1u64 << (8 * self.suffix_len())
    }

    /// Combine the prefix with `suffix`; `suffix.len()` must equal `suffix_len()`.
    pub fn with_suffix(&self, suffix: &[u8]) -> Option<MacAddress> {
        if suffix.len() != self.suffix_len() {
            return None;
        }
        let mut raw = [0u8; ADDRESS_OCTETS];
        raw[..self.0.len()].copy_from_slice(&self.0);
        raw[self.0.len()..].copy_from_slice(suffix);
        Some(MacAddress(raw))
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        address.0.starts_with(&self.0)
    }
}

impl fmt::Display for VendorPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|byte| format!("{byte:02X}")).collect();
        f.write_str(&rendered.join(":"))
    }
}

impl FromStr for VendorPrefix {
    type Err = MacvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let octets = parse_octets(trimmed).ok_or_else(|| {
            MacvaultError::InvalidPrefix(format!(
                "`{trimmed}` is not a hex octet sequence such as 00:1A:2B"
            ))
        })?;
        if octets.is_empty() || octets.len() >= ADDRESS_OCTETS {
            return Err(MacvaultError::InvalidPrefix(format!(
                "`{trimmed}` must contain between 1 and {} octets (got {})",
                ADDRESS_OCTETS - 1,
                octets.len()
            )));
        }
        Ok(Self(octets))
    }
}

/// Accepts `AA:BB`, `aa-bb`, or bare `AABB`. Separators must sit between every
/// octet when present.
fn parse_octets(text: &str) -> Option<Vec<u8>> {
    if text.is_empty() {
        return None;
    }

    if text.contains([':', '-']) {
        let mut octets = Vec::new();
        for part in text.split([':', '-']) {
            if part.len() != 2 {
                return None;
            }
            octets.push(u8::from_str_radix(part, 16).ok()?);
        }
        return Some(octets);
    }

    if text.len() % 2 != 0 || !text.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    hex::decode(text).ok()
}

/// Pull every colon- or dash-separated address out of free-form text.
///
/// Blank lines and lines starting with `#` are ignored.
pub fn extract_addresses(text: &str) -> Vec<MacAddress> {
    let re = EMBEDDED_ADDRESS_RE.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}").expect("valid address regex")
    });

    let mut found = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        for candidate in re.find_iter(line) {
            if let Ok(address) = candidate.as_str().parse::<MacAddress>() {
                found.push(address);
            }
        }
    }
    found
}

/// Canonicalise a textual address, if it parses.
pub fn canonicalize(text: &str) -> MacvaultResult<String> {
    text.parse::<MacAddress>().map(|address| address.to_string())
}
