//! Snapshot naming, listing and retention

use crate::error::DatastoreError;
use crate::models::SnapshotFile;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

/// Host directory snapshots are written to
pub const SNAPSHOT_DIR: &str = "/opt/rke/etcd-snapshots";

/// Shell command listing `SNAPSHOT_DIR` as `name size mtime` lines
pub const LIST_SNAPSHOTS_COMMAND: &str =
    "find /opt/rke/etcd-snapshots -maxdepth 1 -type f -printf '%f %s %T@\\n' 2>/dev/null";

/// `rke_etcd_snapshot_<RFC3339>`
#[must_use]
pub fn default_snapshot_name(now: DateTime<Utc>) -> String {
    format!("rke_etcd_snapshot_{}", now.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Validate and normalize a snapshot name given for restore
///
/// # Errors
///
/// Returns `DatastoreError::InvalidRequest` for an empty name or one with a
/// path separator.
pub fn normalize_restore_name(name: &str) -> Result<String, DatastoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DatastoreError::InvalidRequest("snapshot name is required for restore".to_string()));
    }
    if trimmed.contains('/') {
        return Err(DatastoreError::InvalidRequest(format!(
            "snapshot name {trimmed} must not contain a path"
        )));
    }
    match trimmed.strip_suffix(".zip") {
        Some(stripped) => {
            warn!("Snapshot name {} ends in .zip, using {}", trimmed, stripped);
            Ok(stripped.to_string())
        }
        None => Ok(trimmed.to_string()),
    }
}

/// Host path of a snapshot
#[must_use]
pub fn snapshot_path(name: &str) -> String {
    format!("{SNAPSHOT_DIR}/{name}")
}

/// Parse `LIST_SNAPSHOTS_COMMAND` output; malformed lines are skipped
#[must_use]
pub fn parse_listing(output: &str) -> Vec<SnapshotFile> {
    let mut files: Vec<SnapshotFile> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?.to_string();
            let size = parts.next()?.parse().ok()?;
            let modified = parts.next()?.split('.').next()?.parse().ok()?;
            Some(SnapshotFile { name, size, modified })
        })
        .collect();
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_name_is_rfc3339() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(default_snapshot_name(now), "rke_etcd_snapshot_2024-05-01T12:30:00Z");
    }

    #[test]
    fn test_restore_name_strips_zip() {
        assert_eq!(normalize_restore_name("snap.zip").unwrap(), "snap");
        assert_eq!(normalize_restore_name(" snap ").unwrap(), "snap");
        assert!(normalize_restore_name("").is_err());
        assert!(normalize_restore_name("../etc/passwd").is_err());
    }

    #[test]
    fn test_listing_sorted_newest_first() {
        let output = "a 100 1700000000.123\nb 200 1700000300.0\nbroken line\nc 300 1700000100.5\n";
        let files = parse_listing(output);
        assert_eq!(files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), vec!["b", "c", "a"]);
    }
}
