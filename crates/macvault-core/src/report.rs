//! Human-readable renderings of a pool: entry status lines, summaries and
//! the exported statistics file.

use crate::pool::{Entry, Pool, PoolSummary};
use chrono::{DateTime, Local, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const DISPLAY_TIME: &str = "%Y-%m-%d %H:%M:%S";

/// Entries shown by `list`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListFilter {
    #[default]
    All,
    Used,
    Unused,
}

impl ListFilter {
    pub fn matches(self, entry: &Entry) -> bool {
        match self {
            ListFilter::All => true,
            ListFilter::Used => entry.used,
            ListFilter::Unused => !entry.used,
        }
    }
}

/// Which entries to append to an exported statistics file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportInclude {
    #[default]
    None,
    All,
    Used,
    /// Allocatable entries only; reserved ones are left out.
    Unused,
}

impl ExportInclude {
    fn matches(self, entry: &Entry) -> bool {
        match self {
            ExportInclude::None => false,
            ExportInclude::All => true,
            ExportInclude::Used => entry.used,
            ExportInclude::Unused => entry.is_available(),
        }
    }
}

pub fn format_timestamp(stamp: &DateTime<Utc>) -> String {
    stamp.with_timezone(&Local).format(DISPLAY_TIME).to_string()
}

/// `"Unused"`, `"Used at <time> by <who>"`, plus reservation marker and comment.
pub fn describe_entry(entry: &Entry) -> String {
    let mut status = if entry.used {
        let mut used = match &entry.used_at {
            Some(stamp) => format!("Used at {}", format_timestamp(stamp)),
            None => "Used".to_string(),
        };
        if !entry.used_by.is_empty() {
            let _ = write!(used, " by {}", entry.used_by);
        }
        used
    } else {
        "Unused".to_string()
    };
    if entry.reserved {
        status.push_str(" (Reserved)");
    }
    if !entry.comment.is_empty() {
        let _ = write!(status, " - {}", entry.comment);
    }
    format!("{} - {status}", entry.address)
}

/// Numbered lines for the entries passing `filter`. Numbers count within the
/// filtered view.
pub fn list_lines(pool: &Pool, filter: ListFilter) -> Vec<String> {
    pool.entries
        .iter()
        .filter(|entry| filter.matches(entry))
        .enumerate()
        .map(|(idx, entry)| format!("{}. {}", idx + 1, describe_entry(entry)))
        .collect()
}

pub fn summary_lines(summary: &PoolSummary) -> Vec<String> {
    vec![
        format!("Total MAC addresses: {}", summary.total),
        format!(
            "Used: {} ({:.1}%)",
            summary.used,
            PoolSummary::percentage(summary.used, summary.total)
        ),
        format!(
            "Unused: {} ({:.1}%)",
            summary.unused,
            PoolSummary::percentage(summary.unused, summary.total)
        ),
        format!(
            "Reserved: {} ({:.1}%)",
            summary.reserved,
            PoolSummary::percentage(summary.reserved, summary.total)
        ),
    ]
}

/// SI-scaled byte count (`"1.5 kB"`).
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['k', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {suffix}B", bytes as f64 / div as f64)
}

pub fn stats_file_name(now: &DateTime<Local>) -> String {
    format!("mac_pool_stats_{}.txt", now.format("%Y%m%d_%H%M%S"))
}

/// Default export location: next to the pool file.
pub fn stats_path(pool_path: &Path, now: &DateTime<Local>) -> PathBuf {
    pool_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(stats_file_name(now))
}

/// Plain-text statistics report.
pub fn render_stats(
    pool: &Pool,
    pool_path: &Path,
    include: ExportInclude,
    now: &DateTime<Local>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "MAC Address Pool Statistics");
    let _ = writeln!(out, "==========================");
    let _ = writeln!(out);
    let _ = writeln!(out, "Export date: {}", now.format(DISPLAY_TIME));
    let _ = writeln!(out, "Pool file: {}", pool_path.display());
    let _ = writeln!(out, "Created by: {}", pool.created_by);
    let _ = writeln!(out, "Last updated: {}", format_timestamp(&pool.last_updated));
    let _ = writeln!(out);

    let _ = writeln!(out, "Summary:");
    for line in summary_lines(&pool.summary()) {
        let _ = writeln!(out, "{line}");
    }
    let _ = writeln!(out);

    if let Some(prefix) = pool.vendor_prefix.as_deref() {
        let _ = writeln!(out, "Vendor prefix: {prefix}");
        let _ = writeln!(out);
    }

    if include != ExportInclude::None {
        let _ = writeln!(out, "MAC Address List:");
        let _ = writeln!(out, "----------------");
        let _ = writeln!(out);
        for (idx, entry) in pool.entries.iter().enumerate() {
            if include.matches(entry) {
                let _ = writeln!(out, "{}. {}", idx + 1, describe_entry(entry));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pool() -> Pool {
        let mut pool = Pool::new("ops@bench", None);
        pool.vendor_prefix = Some("00:1A:2B".into());
        pool.entries.push(Entry::new("00:1A:2B:00:00:01".parse().unwrap()));
        let mut used = Entry::new("00:1A:2B:00:00:02".parse().unwrap());
        used.used = true;
        used.used_at = Some(Utc::now());
        used.used_by = "bench-7 on enp3s0".into();
        pool.entries.push(used);
        let mut reserved = Entry::new("00:1A:2B:00:00:03".parse().unwrap());
        reserved.reserved = true;
        reserved.comment = "golden unit".into();
        pool.entries.push(reserved);
        pool
    }

    #[test]
    fn describes_each_state() {
        let pool = pool();
        assert_eq!(describe_entry(&pool.entries[0]), "00:1A:2B:00:00:01 - Unused");
        let used = describe_entry(&pool.entries[1]);
        assert!(used.starts_with("00:1A:2B:00:00:02 - Used at "));
        assert!(used.ends_with(" by bench-7 on enp3s0"));
        assert_eq!(
            describe_entry(&pool.entries[2]),
            "00:1A:2B:00:00:03 - Unused (Reserved) - golden unit"
        );
    }

    #[test]
    fn list_filters_and_renumbers() {
        let pool = pool();
        assert_eq!(list_lines(&pool, ListFilter::All).len(), 3);
        let used = list_lines(&pool, ListFilter::Used);
        assert_eq!(used.len(), 1);
        assert!(used[0].starts_with("1. 00:1A:2B:00:00:02"));
        assert_eq!(list_lines(&pool, ListFilter::Unused).len(), 2);
    }

    #[test]
    fn sizes_scale_by_thousands() {
        assert_eq!(format_size(999), "999 B");
        assert_eq!(format_size(1500), "1.5 kB");
        assert_eq!(format_size(2_000_000), "2.0 MB");
    }

    #[test]
    fn stats_report_respects_include_filter() {
        let pool = pool();
        let now = Local.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap();
        let path = Path::new("/srv/pools/mac_pool.enc");

        let summary_only = render_stats(&pool, path, ExportInclude::None, &now);
        assert!(summary_only.contains("Export date: 2025-02-03 04:05:06"));
        assert!(summary_only.contains("Used: 1 (33.3%)"));
        assert!(summary_only.contains("Vendor prefix: 00:1A:2B"));
        assert!(!summary_only.contains("MAC Address List"));

        let unused = render_stats(&pool, path, ExportInclude::Unused, &now);
        assert!(unused.contains("1. 00:1A:2B:00:00:01 - Unused"));
        assert!(!unused.contains("00:1A:2B:00:00:03"));

        assert_eq!(
            stats_path(path, &now),
            PathBuf::from("/srv/pools/mac_pool_stats_20250203_040506.txt")
        );
    }
}
