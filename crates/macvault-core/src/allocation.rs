//! Pure operations over an in-memory pool: selection, marking, reset,
//! generation and the bookkeeping edits behind the manager commands.
//!
//! Nothing here touches the filesystem. Callers persist through
//! [`PoolRepository::commit`](crate::repository::PoolRepository::commit).

use crate::address::{MacAddress, VendorPrefix};
use crate::error::{MacvaultError, MacvaultResult};
use crate::pool::{Entry, Pool};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use std::collections::HashSet;

/// Generation gives up after `count * GENERATION_ATTEMPT_FACTOR` draws.
pub const GENERATION_ATTEMPT_FACTOR: usize = 10;

/// Attribution used when the caller supplies none.
pub const UNKNOWN_ATTRIBUTION: &str = "unknown";

/// First entry in pool order that is neither used nor reserved.
pub fn select_available(pool: &Pool) -> MacvaultResult<&Entry> {
    pool.entries
        .iter()
        .find(|entry| entry.is_available())
        .ok_or(MacvaultError::PoolExhausted)
}

/// Mark `address` as used now by `used_by`. Returns `false` when the address is
/// not in the pool, which is not an error.
pub fn mark_used(pool: &mut Pool, address: &MacAddress, used_by: &str) -> bool {
    let Some(idx) = pool.position(address) else {
        return false;
    };
    let used_by = used_by.trim();
    let entry = &mut pool.entries[idx];
    entry.used = true;
    entry.used_at = Some(Utc::now());
    entry.used_by = if used_by.is_empty() {
        UNKNOWN_ATTRIBUTION.to_string()
    } else {
        used_by.to_string()
    };
    true
}

/// Return the matching entries to the unused state. Idempotent; yields the
/// number of entries that actually changed.
pub fn reset(pool: &mut Pool, addresses: &[MacAddress]) -> usize {
    let mut changed = 0;
    for entry in pool.entries.iter_mut() {
        if !addresses.iter().any(|address| address.matches(&entry.address)) {
            continue;
        }
        if entry.used || entry.used_at.is_some() || !entry.used_by.is_empty() {
            changed += 1;
        }
        entry.used = false;
        entry.used_at = None;
        entry.used_by.clear();
    }
    changed
}

/// Used entries in pool order, paired with their position in `pool.entries`.
pub fn used_entries(pool: &Pool) -> Vec<(usize, &Entry)> {
    pool.entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.used)
        .collect()
}

/// Draw `count` fresh addresses under `prefix` from the OS CSPRNG.
///
/// `existing` holds canonical addresses already in the pool.
pub fn generate(
    prefix: &VendorPrefix,
    count: usize,
    existing: &HashSet<String>,
) -> MacvaultResult<Vec<MacAddress>> {
    generate_with_rng(prefix, count, existing, &mut OsRng)
}

/// [`generate`] with an explicit random source.
///
/// Fails with `CapacityExceeded` before drawing anything when `count` exceeds
/// the prefix's address space, and with `PartialGeneration` (carrying what was
/// produced) when the attempt budget runs out.
pub fn generate_with_rng<R>(
    prefix: &VendorPrefix,
    count: usize,
    existing: &HashSet<String>,
    rng: &mut R,
) -> MacvaultResult<Vec<MacAddress>>
where
    R: RngCore + CryptoRng,
{
    let capacity = prefix.capacity();
    if count as u64 > capacity {
        return Err(MacvaultError::CapacityExceeded {
            requested: count as u64,
            capacity,
        });
    }

    let budget = count.saturating_mul(GENERATION_ATTEMPT_FACTOR);
    let mut suffix = vec![0u8; prefix.suffix_len()];
    let mut seen: HashSet<MacAddress> = HashSet::with_capacity(count);
    let mut generated = Vec::with_capacity(count);
    let mut attempts = 0;

    while generated.len() < count && attempts < budget {
        attempts += 1;
        rng.fill_bytes(&mut suffix);
        let Some(address) = prefix.with_suffix(&suffix) else {
            continue;
        };
        if existing.contains(&address.to_string()) || !seen.insert(address) {
            continue;
        }
        generated.push(address);
    }

    if generated.len() < count {
        return Err(MacvaultError::PartialGeneration {
            generated,
            requested: count,
            attempts,
        });
    }
    Ok(generated)
}

/// What happened when appending addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome {
    pub added: Vec<MacAddress>,
    /// Already in the pool or repeated within the input.
    pub duplicates: Vec<MacAddress>,
}

/// Append new unused entries, skipping anything already present.
pub fn add_addresses<I>(pool: &mut Pool, addresses: I) -> AddOutcome
where
    I: IntoIterator<Item = MacAddress>,
{
    let mut present = pool.address_set();
    let mut outcome = AddOutcome::default();
    for address in addresses {
        if present.insert(address.to_string()) {
            pool.entries.push(Entry::new(address));
            outcome.added.push(address);
        } else {
            outcome.duplicates.push(address);
        }
    }
    outcome
}

/// Which entries a removal targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// One-based positions in pool order.
    Indices(Vec<usize>),
    /// Every entry that is neither used nor reserved.
    Unused,
    Address(MacAddress),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub removed: Vec<Entry>,
    /// Used entries left in place because removal of used entries was not allowed.
    pub kept_used: Vec<Entry>,
    /// Requested one-based indices outside the pool.
    pub invalid_indices: Vec<usize>,
}

/// Remove the selected entries. Used entries are only removed with
/// `allow_used`; otherwise they stay and are reported in `kept_used`.
pub fn remove(
    pool: &mut Pool,
    selection: &Selection,
    allow_used: bool,
) -> MacvaultResult<RemoveOutcome> {
    let mut outcome = RemoveOutcome::default();
    let mut targets: Vec<usize> = match selection {
        Selection::Indices(indices) => {
            let mut picked = Vec::new();
            for &index in indices {
                if index == 0 || index > pool.entries.len() {
                    outcome.invalid_indices.push(index);
                } else {
                    picked.push(index - 1);
                }
            }
            picked
        }
        Selection::Unused => pool
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_available())
            .map(|(idx, _)| idx)
            .collect(),
        Selection::Address(address) => {
            vec![pool
                .position(address)
                .ok_or(MacvaultError::UnknownAddress(*address))?]
        }
    };

    targets.sort_unstable();
    targets.dedup();

    if !allow_used {
        targets.retain(|&idx| {
            let entry = &pool.entries[idx];
            if entry.used {
                outcome.kept_used.push(entry.clone());
                false
            } else {
                true
            }
        });
    }

    for idx in targets.into_iter().rev() {
        outcome.removed.push(pool.entries.remove(idx));
    }
    outcome.removed.reverse();
    Ok(outcome)
}

/// Change the reservation flag and/or comment of one entry.
pub fn annotate(
    pool: &mut Pool,
    address: &MacAddress,
    reserved: Option<bool>,
    comment: Option<&str>,
) -> MacvaultResult<()> {
    let idx = pool
        .position(address)
        .ok_or(MacvaultError::UnknownAddress(*address))?;
    let entry = &mut pool.entries[idx];
    if let Some(reserved) = reserved {
        entry.reserved = reserved;
    }
    if let Some(comment) = comment {
        entry.comment = comment.trim().to_string();
    }
    Ok(())
}

/// `"<host> on <iface,...>"`, or just the host when no interfaces are known.
pub fn attribution(hostname: &str, interfaces: &[String]) -> String {
    let hostname = hostname.trim();
    let hostname = if hostname.is_empty() {
        UNKNOWN_ATTRIBUTION
    } else {
        hostname
    };
    if interfaces.is_empty() {
        hostname.to_string()
    } else {
        format!("{hostname} on {}", interfaces.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Error as RandError;

    fn mac(text: &str) -> MacAddress {
        text.parse().unwrap()
    }

    /// Fails the test if generation draws any randomness.
    struct NoDrawRng;

    impl RngCore for NoDrawRng {
        fn next_u32(&mut self) -> u32 {
            panic!("unexpected random draw")
        }
        fn next_u64(&mut self) -> u64 {
            panic!("unexpected random draw")
        }
        fn fill_bytes(&mut self, _dest: &mut [u8]) {
            panic!("unexpected random draw")
        }
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), RandError> {
            panic!("unexpected random draw")
        }
    }

    impl CryptoRng for NoDrawRng {}

    /// Always yields the same bytes, forcing collisions.
    struct ConstantRng {
        draws: usize,
    }

    impl RngCore for ConstantRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.draws += 1;
            dest.fill(0x42);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), RandError> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for ConstantRng {}

    fn abc_pool() -> Pool {
        let mut pool = Pool::new("ops", None);
        pool.entries.push(Entry::new(mac("00:00:00:00:00:0A")));
        let mut used = Entry::new(mac("00:00:00:00:00:0B"));
        used.used = true;
        used.used_at = Some(Utc::now());
        used.used_by = "earlier".into();
        pool.entries.push(used);
        let mut reserved = Entry::new(mac("00:00:00:00:00:0C"));
        reserved.reserved = true;
        pool.entries.push(reserved);
        pool
    }

    #[test]
    fn select_mark_and_reset_lifecycle() {
        let mut pool = abc_pool();
        let a = mac("00:00:00:00:00:0A");

        assert_eq!(select_available(&pool).unwrap().address, a.to_string());

        assert!(mark_used(&mut pool, &a, "host1/eth0"));
        let entry = pool.find(&a).unwrap();
        assert!(entry.used);
        assert_eq!(entry.used_by, "host1/eth0");
        assert!(entry.used_at.is_some());

        assert_eq!(reset(&mut pool, &[a]), 1);
        let entry = pool.find(&a).unwrap();
        assert!(!entry.used);
        assert!(entry.used_at.is_none());
        assert!(entry.used_by.is_empty());

        assert_eq!(reset(&mut pool, &[a]), 0, "reset is idempotent");
    }

    #[test]
    fn exhausted_when_only_used_or_reserved_remain() {
        let mut pool = abc_pool();
        pool.entries.remove(0);
        assert!(matches!(
            select_available(&pool),
            Err(MacvaultError::PoolExhausted)
        ));
    }

    #[test]
    fn mark_used_matches_case_insensitively_and_ignores_unknown() {
        let mut pool = Pool::new("ops", None);
        pool.entries.push(Entry {
            address: "aa:bb:cc:dd:ee:ff".into(),
            ..Entry::new(mac("00:00:00:00:00:01"))
        });
        assert!(mark_used(&mut pool, &mac("AA:BB:CC:DD:EE:FF"), "  "));
        assert_eq!(pool.entries[0].used_by, UNKNOWN_ATTRIBUTION);
        assert!(!mark_used(&mut pool, &mac("01:02:03:04:05:06"), "host"));
    }

    #[test]
    fn generate_refuses_oversized_requests_without_drawing() {
        let prefix: VendorPrefix = "00:1A:2B:3C:4D".parse().unwrap();
        let err = generate_with_rng(&prefix, 257, &HashSet::new(), &mut NoDrawRng).unwrap_err();
        match err {
            MacvaultError::CapacityExceeded {
                requested,
                capacity,
            } => {
                assert_eq!(requested, 257);
                assert_eq!(capacity, 256);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn generate_zero_is_empty() {
        let prefix: VendorPrefix = "00:1A:2B".parse().unwrap();
        assert!(generate_with_rng(&prefix, 0, &HashSet::new(), &mut NoDrawRng)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn generated_addresses_are_unique_prefixed_and_fresh() {
        let prefix: VendorPrefix = "00:1A:2B:3C".parse().unwrap();
        let existing: HashSet<String> = (0..100u8)
            .filter_map(|n| prefix.with_suffix(&[0, n]))
            .map(|address| address.to_string())
            .collect();

        let generated = generate(&prefix, 500, &existing).unwrap();
        assert_eq!(generated.len(), 500);

        let unique: HashSet<_> = generated.iter().collect();
        assert_eq!(unique.len(), 500);
        for address in &generated {
            assert!(prefix.contains(address));
            assert!(!existing.contains(&address.to_string()));
        }
    }

    #[test]
    fn generate_reports_partial_results_when_budget_runs_out() {
        let prefix: VendorPrefix = "00:1A:2B".parse().unwrap();
        let mut rng = ConstantRng { draws: 0 };
        let err = generate_with_rng(&prefix, 3, &HashSet::new(), &mut rng).unwrap_err();
        match err {
            MacvaultError::PartialGeneration {
                generated,
                requested,
                attempts,
            } => {
                assert_eq!(generated, vec![mac("00:1A:2B:42:42:42")]);
                assert_eq!(requested, 3);
                assert_eq!(attempts, 3 * GENERATION_ATTEMPT_FACTOR);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(rng.draws, 3 * GENERATION_ATTEMPT_FACTOR);
    }

    #[test]
    fn add_skips_duplicates_in_pool_and_input() {
        let mut pool = abc_pool();
        let outcome = add_addresses(
            &mut pool,
            [
                mac("00:00:00:00:00:0a"),
                mac("00:00:00:00:00:0D"),
                mac("00-00-00-00-00-0d"),
            ],
        );
        assert_eq!(outcome.added, vec![mac("00:00:00:00:00:0D")]);
        assert_eq!(outcome.duplicates.len(), 2);
        assert_eq!(pool.entries.len(), 4);
    }

    #[test]
    fn remove_keeps_used_entries_unless_allowed() {
        let mut pool = abc_pool();
        let outcome = remove(&mut pool, &Selection::Indices(vec![1, 2, 9, 0]), false).unwrap();
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].address, "00:00:00:00:00:0A");
        assert_eq!(outcome.kept_used.len(), 1);
        assert_eq!(outcome.invalid_indices, vec![9, 0]);
        assert_eq!(pool.entries.len(), 2);

        let outcome = remove(&mut pool, &Selection::Indices(vec![1]), true).unwrap();
        assert_eq!(outcome.removed[0].address, "00:00:00:00:00:0B");
    }

    #[test]
    fn remove_unused_spares_reserved_entries() {
        let mut pool = abc_pool();
        let outcome = remove(&mut pool, &Selection::Unused, false).unwrap();
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(pool.entries.len(), 2);
        assert!(pool.entries.iter().all(|entry| entry.used || entry.reserved));
    }

    #[test]
    fn remove_by_unknown_address_fails() {
        let mut pool = abc_pool();
        let missing = mac("00:00:00:00:00:FF");
        assert!(matches!(
            remove(&mut pool, &Selection::Address(missing), true),
            Err(MacvaultError::UnknownAddress(address)) if address == missing
        ));
    }

    #[test]
    fn annotate_updates_flags_independently() {
        let mut pool = abc_pool();
        let a = mac("00:00:00:00:00:0A");
        annotate(&mut pool, &a, Some(true), None).unwrap();
        annotate(&mut pool, &a, None, Some("  lab spare ")).unwrap();
        let entry = pool.find(&a).unwrap();
        assert!(entry.reserved);
        assert_eq!(entry.comment, "lab spare");
        assert!(select_available(&pool).is_err());
    }

    #[test]
    fn attribution_formats_interfaces() {
        assert_eq!(
            attribution("bench-7", &["enp3s0".into(), "enp4s0".into()]),
            "bench-7 on enp3s0,enp4s0"
        );
        assert_eq!(attribution("bench-7", &[]), "bench-7");
        assert_eq!(attribution("", &[]), UNKNOWN_ATTRIBUTION);
    }
}
