//! Pool administration behind the `macvault` subcommands.
//!
//! Each mutation is load → change → touch → sign → save through
//! [`PoolRepository::commit`]; nothing is written when loading fails.

use super::{signature_event, WorkflowLevel, WorkflowReport};
use crate::address::{extract_addresses, MacAddress, VendorPrefix};
use crate::allocation::{self, AddOutcome, Selection};
use crate::error::{MacvaultError, MacvaultResult};
use crate::pool::Pool;
use crate::report::{self as render, ExportInclude, ListFilter};
use crate::repository::{LoadedPool, PoolRepository};
use chrono::{DateTime, Local};
use std::fs;
use std::path::PathBuf;

/// Largest batch `add --generate` accepts.
pub const MAX_GENERATE: usize = 10_000;
const RECENT_SHOWN: usize = 5;

/// Which used entries a reset targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetSelection {
    /// One-based positions in the list of used entries.
    Indices(Vec<usize>),
    All,
    Address(MacAddress),
}

/// Check a new passphrase against its confirmation and the minimum length.
pub fn validate_new_passphrase(
    passphrase: &str,
    confirmation: &str,
    min_len: usize,
) -> MacvaultResult<()> {
    if passphrase.chars().count() < min_len {
        return Err(MacvaultError::InvalidPassphrase(format!(
            "must be at least {min_len} characters long"
        )));
    }
    if passphrase != confirmation {
        return Err(MacvaultError::InvalidPassphrase(
            "passphrases do not match".into(),
        ));
    }
    Ok(())
}

fn open(
    repository: &PoolRepository,
    passphrase: &str,
    report: &mut WorkflowReport,
) -> MacvaultResult<Pool> {
    let loaded: LoadedPool = repository.load_verified(passphrase)?;
    if let Some(event) = signature_event(&loaded) {
        report.events.push(event);
    }
    Ok(loaded.pool)
}

pub fn create_pool(
    repository: &mut PoolRepository,
    passphrase: &str,
    created_by: &str,
    prefix: Option<&VendorPrefix>,
    overwrite: bool,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new(format!(
        "Created pool {}",
        repository.path().display()
    ));
    let pool = repository.create(Pool::new(created_by, prefix), passphrase, overwrite)?;
    report.push(
        WorkflowLevel::Success,
        format!("Empty pool created by {}", pool.created_by),
    );
    if let Some(prefix) = prefix {
        report.push(WorkflowLevel::Info, format!("Vendor prefix: {prefix}"));
    }
    report.push(
        WorkflowLevel::Security,
        "Keep the passphrase safe: the pool cannot be recovered without it.",
    );
    Ok(report)
}

pub fn pool_info(
    repository: &PoolRepository,
    passphrase: &str,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new(format!(
        "Pool information: {}",
        repository.path().display()
    ));
    let pool = open(repository, passphrase, &mut report)?;

    let size = repository.file_size().unwrap_or(0);
    report.push(WorkflowLevel::Info, format!("File size: {}", render::format_size(size)));
    report.push(WorkflowLevel::Info, format!("Created by: {}", pool.created_by));
    report.push(
        WorkflowLevel::Info,
        format!("Last updated: {}", render::format_timestamp(&pool.last_updated)),
    );
    report.push(WorkflowLevel::Info, format!("Version: {}", pool.format_version));
    if let Some(prefix) = &pool.vendor_prefix {
        report.push(WorkflowLevel::Info, format!("Vendor prefix: {prefix}"));
    }
    for line in render::summary_lines(&pool.summary()) {
        report.push(WorkflowLevel::Info, line);
    }

    let recent = pool.recently_used(RECENT_SHOWN);
    if !recent.is_empty() {
        report.push(WorkflowLevel::Info, "Recently used MAC addresses:");
        for entry in recent {
            report.push(WorkflowLevel::Info, format!("  {}", render::describe_entry(entry)));
        }
    }
    Ok(report)
}

pub fn list_pool(
    repository: &PoolRepository,
    passphrase: &str,
    filter: ListFilter,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new(format!(
        "MAC addresses in {}",
        repository.path().display()
    ));
    let pool = open(repository, passphrase, &mut report)?;

    let lines = render::list_lines(&pool, filter);
    if lines.is_empty() {
        report.push(WorkflowLevel::Warn, "No MAC addresses match the selected filter.");
    }
    for line in lines {
        report.push(WorkflowLevel::Info, line);
    }

    let summary = pool.summary();
    report.push(
        WorkflowLevel::Info,
        format!(
            "Summary: {} total, {} used, {} unused, {} reserved",
            summary.total, summary.used, summary.unused, summary.reserved
        ),
    );
    Ok(report)
}

fn commit_additions(
    repository: &mut PoolRepository,
    pool: &mut Pool,
    passphrase: &str,
    outcome: &AddOutcome,
    report: &mut WorkflowReport,
) -> MacvaultResult<()> {
    for duplicate in &outcome.duplicates {
        report.push(
            WorkflowLevel::Warn,
            format!("{duplicate} already in pool or repeated in input, skipped"),
        );
    }
    if outcome.added.is_empty() {
        report.push(WorkflowLevel::Warn, "No new MAC addresses to add.");
        return Ok(());
    }
    repository.commit(pool, passphrase)?;
    report.push(
        WorkflowLevel::Success,
        format!("Added {} MAC address(es)", outcome.added.len()),
    );
    Ok(())
}

pub fn add_manual(
    repository: &mut PoolRepository,
    passphrase: &str,
    addresses: &[MacAddress],
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new("Add MAC addresses");
    let mut pool = open(repository, passphrase, &mut report)?;
    let outcome = allocation::add_addresses(&mut pool, addresses.iter().copied());
    commit_additions(repository, &mut pool, passphrase, &outcome, &mut report)?;
    Ok(report)
}

/// Import every address found in `text`, one or more per line.
pub fn add_imported(
    repository: &mut PoolRepository,
    passphrase: &str,
    text: &str,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new("Import MAC addresses");
    let found = extract_addresses(text);
    if found.is_empty() {
        report.push(WorkflowLevel::Warn, "No MAC addresses found in input.");
        return Ok(report);
    }
    report.push(
        WorkflowLevel::Info,
        format!("Found {} MAC address(es) in input", found.len()),
    );
    let mut pool = open(repository, passphrase, &mut report)?;
    let outcome = allocation::add_addresses(&mut pool, found);
    commit_additions(repository, &mut pool, passphrase, &outcome, &mut report)?;
    Ok(report)
}

/// Generate `count` random addresses under `prefix`, else the pool's stored
/// prefix, else `fallback`. A shortfall still adds what was produced.
pub fn add_generated(
    repository: &mut PoolRepository,
    passphrase: &str,
    count: usize,
    prefix: Option<&VendorPrefix>,
    fallback: Option<&VendorPrefix>,
) -> MacvaultResult<WorkflowReport> {
    if count == 0 || count > MAX_GENERATE {
        return Err(MacvaultError::InvalidConfig(format!(
            "generate count must be between 1 and {MAX_GENERATE}"
        )));
    }

    let mut report = WorkflowReport::new("Generate MAC addresses");
    let mut pool = open(repository, passphrase, &mut report)?;
    let prefix = match prefix {
        Some(prefix) => prefix.clone(),
        None => match pool.vendor_prefix()? {
            Some(stored) => stored,
            None => fallback.cloned().ok_or_else(|| {
                MacvaultError::InvalidPrefix(
                    "no vendor prefix given, stored in the pool, or configured".into(),
                )
            })?,
        },
    };

    let generated = match allocation::generate(&prefix, count, &pool.address_set()) {
        Ok(generated) => generated,
        Err(MacvaultError::PartialGeneration {
            generated,
            requested,
            attempts,
        }) => {
            report.push(
                WorkflowLevel::Warn,
                format!(
                    "Only {} of {requested} unique addresses could be generated after {attempts} attempts",
                    generated.len()
                ),
            );
            generated
        }
        Err(err) => return Err(err),
    };

    if pool.vendor_prefix.is_none() {
        pool.vendor_prefix = Some(prefix.to_string());
    }
    let outcome = allocation::add_addresses(&mut pool, generated);
    commit_additions(repository, &mut pool, passphrase, &outcome, &mut report)?;
    Ok(report)
}

pub fn remove_entries(
    repository: &mut PoolRepository,
    passphrase: &str,
    selection: &Selection,
    allow_used: bool,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new("Remove MAC addresses");
    let mut pool = open(repository, passphrase, &mut report)?;
    let outcome = allocation::remove(&mut pool, selection, allow_used)?;

    for index in &outcome.invalid_indices {
        report.push(WorkflowLevel::Warn, format!("Invalid index {index}, skipped"));
    }
    for entry in &outcome.kept_used {
        report.push(
            WorkflowLevel::Warn,
            format!("{} is marked used; pass --force to remove it", entry.address),
        );
    }
    if outcome.removed.is_empty() {
        report.push(WorkflowLevel::Warn, "No MAC addresses selected for removal.");
        return Ok(report);
    }

    repository.commit(&mut pool, passphrase)?;
    for entry in &outcome.removed {
        report.push(WorkflowLevel::Info, format!("Removed {}", entry.address));
    }
    report.push(
        WorkflowLevel::Success,
        format!("Removed {} MAC address(es)", outcome.removed.len()),
    );
    Ok(report)
}

pub fn reset_entries(
    repository: &mut PoolRepository,
    passphrase: &str,
    selection: &ResetSelection,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new("Reset MAC addresses");
    let mut pool = open(repository, passphrase, &mut report)?;

    let used: Vec<MacAddress> = allocation::used_entries(&pool)
        .into_iter()
        .filter_map(|(_, entry)| entry.parsed_address().ok())
        .collect();
    if used.is_empty() {
        report.push(WorkflowLevel::Warn, "No used MAC addresses in pool.");
        return Ok(report);
    }

    let targets: Vec<MacAddress> = match selection {
        ResetSelection::All => used,
        ResetSelection::Address(address) => {
            if pool.position(address).is_none() {
                return Err(MacvaultError::UnknownAddress(*address));
            }
            vec![*address]
        }
        ResetSelection::Indices(indices) => {
            let mut picked = Vec::new();
            for &index in indices {
                match index.checked_sub(1).and_then(|idx| used.get(idx)) {
                    Some(address) => picked.push(*address),
                    None => report.push(
                        WorkflowLevel::Warn,
                        format!("Invalid index {index}, skipped"),
                    ),
                }
            }
            picked
        }
    };

    let changed = allocation::reset(&mut pool, &targets);
    if changed == 0 {
        report.push(WorkflowLevel::Warn, "No MAC addresses were reset.");
        return Ok(report);
    }
    repository.commit(&mut pool, passphrase)?;
    report.push(
        WorkflowLevel::Success,
        format!("Reset {changed} MAC address(es) to unused"),
    );
    Ok(report)
}

pub fn annotate_entry(
    repository: &mut PoolRepository,
    passphrase: &str,
    address: &MacAddress,
    reserved: Option<bool>,
    comment: Option<&str>,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new(format!("Annotate {address}"));
    if reserved.is_none() && comment.is_none() {
        report.push(WorkflowLevel::Warn, "Nothing to change.");
        return Ok(report);
    }
    let mut pool = open(repository, passphrase, &mut report)?;
    allocation::annotate(&mut pool, address, reserved, comment)?;
    repository.commit(&mut pool, passphrase)?;

    if let Some(entry) = pool.find(address) {
        report.push(WorkflowLevel::Success, render::describe_entry(entry));
    }
    Ok(report)
}

/// Re-sign and re-encrypt under a new passphrase.
pub fn change_passphrase(
    repository: &mut PoolRepository,
    old_passphrase: &str,
    new_passphrase: &str,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new("Change pool passphrase");
    let mut pool = open(repository, old_passphrase, &mut report)?;
    repository.change_passphrase(&mut pool, old_passphrase, new_passphrase)?;
    report.push(
        WorkflowLevel::Success,
        "Pool re-encrypted under the new passphrase",
    );
    Ok(report)
}

/// Write the statistics report; `output` overrides the default location next
/// to the pool file.
pub fn export_stats(
    repository: &PoolRepository,
    passphrase: &str,
    include: ExportInclude,
    output: Option<PathBuf>,
    now: DateTime<Local>,
) -> MacvaultResult<WorkflowReport> {
    let mut report = WorkflowReport::new("Export pool statistics");
    let pool = open(repository, passphrase, &mut report)?;
    let target = output.unwrap_or_else(|| render::stats_path(repository.path(), &now));
    fs::write(
        &target,
        render::render_stats(&pool, repository.path(), include, &now),
    )?;
    report.push(
        WorkflowLevel::Success,
        format!("Statistics exported to {}", target.display()),
    );
    Ok(report)
}
