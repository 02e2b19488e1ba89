//! In-memory pool model and its on-disk (plaintext) document shape.
//!
//! Field names match the JSON documents written by earlier pool tooling so
//! existing inventories keep loading.

use crate::address::{MacAddress, VendorPrefix};
use crate::error::{MacvaultError, MacvaultResult};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

/// Schema version written by this crate. Readers refuse anything else.
pub const FORMAT_VERSION: u32 = 1;

/// The encrypted, signed inventory of allocatable addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    #[serde(rename = "version")]
    pub format_version: u32,

    #[serde(rename = "addresses", default)]
    pub entries: Vec<Entry>,

    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    pub created_by: String,

    /// Hex HMAC over the document with this field empty. Empty on legacy pools.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,

    #[serde(
        rename = "mac_vendor_prefix",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub vendor_prefix: Option<String>,
}

/// One allocatable address and its allocation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub address: String,

    #[serde(default)]
    pub used: bool,

    #[serde(
        default,
        deserialize_with = "zero_time_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub used_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub used_by: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub reserved: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl Entry {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address: address.to_string(),
            used: false,
            used_at: None,
            used_by: String::new(),
            reserved: false,
            comment: String::new(),
        }
    }

    /// Eligible for allocation: neither used nor reserved.
    pub fn is_available(&self) -> bool {
        !self.used && !self.reserved
    }

    pub fn parsed_address(&self) -> MacvaultResult<MacAddress> {
        self.address.parse()
    }
}

/// Allocation counts. An entry that is both used and reserved counts as used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub total: usize,
    pub used: usize,
    pub unused: usize,
    pub reserved: usize,
}

impl PoolSummary {
    pub fn percentage(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            part as f64 / total as f64 * 100.0
        }
    }
}

impl Pool {
    /// Fresh, empty, unsigned pool.
    pub fn new(created_by: impl Into<String>, vendor_prefix: Option<&VendorPrefix>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            entries: Vec::new(),
            last_updated: Utc::now(),
            created_by: created_by.into(),
            signature: String::new(),
            vendor_prefix: vendor_prefix.map(ToString::to_string),
        }
    }

    /// Record a mutation.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn vendor_prefix(&self) -> MacvaultResult<Option<VendorPrefix>> {
        self.vendor_prefix
            .as_deref()
            .map(str::parse::<VendorPrefix>)
            .transpose()
    }

    pub fn find(&self, address: &MacAddress) -> Option<&Entry> {
        self.entries.iter().find(|entry| address.matches(&entry.address))
    }

    pub fn position(&self, address: &MacAddress) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| address.matches(&entry.address))
    }

    /// Addresses currently in the pool, canonicalised where possible.
    pub fn address_set(&self) -> HashSet<String> {
        self.entries
            .iter()
            .map(|entry| {
                entry
                    .parsed_address()
                    .map(|address| address.to_string())
                    .unwrap_or_else(|_| entry.address.to_ascii_uppercase())
            })
            .collect()
    }

    pub fn summary(&self) -> PoolSummary {
        let mut summary = PoolSummary {
            total: self.entries.len(),
            ..PoolSummary::default()
        };
        for entry in &self.entries {
            if entry.used {
                summary.used += 1;
            } else if entry.reserved {
                summary.reserved += 1;
            } else {
                summary.unused += 1;
            }
        }
        summary
    }

    /// Used entries, newest first, at most `limit`.
    pub fn recently_used(&self, limit: usize) -> Vec<&Entry> {
        let mut used: Vec<&Entry> = self.entries.iter().filter(|entry| entry.used).collect();
        used.sort_by(|a, b| b.used_at.cmp(&a.used_at));
        used.truncate(limit);
        used
    }

    /// Structural checks applied after decryption.
    pub fn validate(&self) -> MacvaultResult<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(MacvaultError::MalformedData(format!(
                "unsupported format version {} (this build understands {FORMAT_VERSION})",
                self.format_version
            )));
        }

        if let Some(prefix) = self.vendor_prefix.as_deref() {
            prefix.parse::<VendorPrefix>().map_err(|err| {
                MacvaultError::MalformedData(format!("vendor prefix `{prefix}`: {err}"))
            })?;
        }

        let mut seen = HashSet::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.iter().enumerate() {
            let address = entry.parsed_address().map_err(|_| {
                MacvaultError::MalformedData(format!(
                    "entry {} has invalid address `{}`",
                    idx + 1,
                    entry.address
                ))
            })?;
            if !seen.insert(address) {
                return Err(MacvaultError::MalformedData(format!(
                    "duplicate address {address}"
                )));
            }
            if entry.used && entry.used_at.is_none() {
                return Err(MacvaultError::MalformedData(format!(
                    "entry {address} is marked used without a usage timestamp"
                )));
            }
        }
        Ok(())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|text| !text.trim().is_empty()))
}

/// Older writers serialise "never used" as `0001-01-01T00:00:00Z`.
fn zero_time_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(value.filter(|stamp| stamp.year() > 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: &str) -> Entry {
        Entry::new(address.parse().unwrap())
    }

    #[test]
    fn reads_legacy_document_with_zero_timestamps() {
        let doc = r#"{
            "version": 1,
            "addresses": [
                {"address": "00:1A:2B:00:00:01", "used": false, "used_at": "0001-01-01T00:00:00Z"},
                {"address": "00:1A:2B:00:00:02", "used": true, "used_at": "2024-03-01T10:00:00+03:00", "used_by": "bench-7 on enp3s0"}
            ],
            "last_updated": "2024-03-01T10:00:00.123456789+03:00",
            "created_by": "ops@bench",
            "mac_vendor_prefix": ""
        }"#;
        let pool: Pool = serde_json::from_str(doc).unwrap();
        assert_eq!(pool.entries[0].used_at, None);
        assert!(pool.entries[1].used_at.is_some());
        assert_eq!(pool.vendor_prefix, None);
        assert!(pool.signature.is_empty());
        pool.validate().unwrap();
    }

    #[test]
    fn serialisation_omits_empty_optional_fields() {
        let mut pool = Pool::new("ops@bench", None);
        pool.entries.push(entry("00:1a:2b:00:00:01"));
        let json = serde_json::to_string(&pool).unwrap();
        assert!(json.contains("\"address\":\"00:1A:2B:00:00:01\""));
        assert!(!json.contains("used_at"));
        assert!(!json.contains("signature"));
        assert!(!json.contains("reserved"));
        assert!(!json.contains("mac_vendor_prefix"));
    }

    #[test]
    fn validate_rejects_unknown_version() {
        let mut pool = Pool::new("ops", None);
        pool.format_version = 2;
        assert!(matches!(pool.validate(), Err(MacvaultError::MalformedData(_))));
    }

    #[test]
    fn validate_rejects_case_insensitive_duplicates() {
        let mut pool = Pool::new("ops", None);
        pool.entries.push(entry("00:1A:2B:00:00:01"));
        pool.entries.push(Entry {
            address: "00:1a:2b:00:00:01".into(),
            ..entry("00:1A:2B:00:00:09")
        });
        let err = pool.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn validate_requires_timestamp_on_used_entries() {
        let mut pool = Pool::new("ops", None);
        let mut used = entry("00:1A:2B:00:00:01");
        used.used = true;
        pool.entries.push(used);
        assert!(matches!(pool.validate(), Err(MacvaultError::MalformedData(_))));
    }

    #[test]
    fn summary_counts_used_before_reserved() {
        let mut pool = Pool::new("ops", None);
        let mut used_and_reserved = entry("00:00:00:00:00:01");
        used_and_reserved.used = true;
        used_and_reserved.used_at = Some(Utc::now());
        used_and_reserved.reserved = true;
        let mut reserved = entry("00:00:00:00:00:02");
        reserved.reserved = true;
        pool.entries = vec![used_and_reserved, reserved, entry("00:00:00:00:00:03")];

        let summary = pool.summary();
        assert_eq!(
            summary,
            PoolSummary {
                total: 3,
                used: 1,
                unused: 1,
                reserved: 1
            }
        );
        assert_eq!(PoolSummary::percentage(1, 4), 25.0);
        assert_eq!(PoolSummary::percentage(1, 0), 0.0);
    }
}
