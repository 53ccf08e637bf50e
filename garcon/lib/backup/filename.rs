//! The backup filename grammar.
//!
//! `backup-<sanitised-timestamp>-<type>.tar.gz`, where the sanitised
//! timestamp is ISO-8601 with `:` and `.` replaced by `-` so the name is
//! valid on every filesystem. Parsing reverses the substitution; names that
//! do not match the grammar are ignored by listings.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::BackupKind;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static FILENAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^backup-(\d{4}-\d{2}-\d{2}T\d{2})-(\d{2})-(\d{2})-(\d{3}Z)-(manual|auto|pre-update|pre-restore)\.tar\.gz$",
    )
    .expect("backup filename pattern is valid")
});

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Formats a timestamp as ISO-8601 with millisecond precision in UTC.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Replaces `:` and `.` in an ISO-8601 timestamp with `-`.
pub fn sanitize_timestamp(timestamp: &str) -> String {
    timestamp.replace([':', '.'], "-")
}

/// Builds a backup filename for a timestamp and kind.
pub fn backup_filename(timestamp: &DateTime<Utc>, kind: BackupKind) -> String {
    format!(
        "backup-{}-{}.tar.gz",
        sanitize_timestamp(&format_timestamp(timestamp)),
        kind.as_str()
    )
}

/// Parses a backup filename back into its timestamp and kind. Returns `None`
/// for names outside the grammar.
pub fn parse_backup_filename(filename: &str) -> Option<(DateTime<Utc>, BackupKind)> {
    let captures = FILENAME_PATTERN.captures(filename)?;

    // Reconstruct `group1:group2:group3.group4` to undo the substitution.
    let timestamp = format!(
        "{}:{}:{}.{}",
        &captures[1], &captures[2], &captures[3], &captures[4]
    );

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .ok()?
        .with_timezone(&Utc);
    let kind = captures[5].parse().ok()?;

    Some((timestamp, kind))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_round_trip() {
        let timestamp: DateTime<Utc> = "2026-03-14T09:26:53.589Z".parse().unwrap();

        assert_eq!(
            sanitize_timestamp(&format_timestamp(&timestamp)),
            "2026-03-14T09-26-53-589Z"
        );

        let filename = backup_filename(&timestamp, BackupKind::Manual);
        assert_eq!(filename, "backup-2026-03-14T09-26-53-589Z-manual.tar.gz");

        let (parsed, kind) = parse_backup_filename(&filename).unwrap();
        assert_eq!(parsed, timestamp);
        assert_eq!(kind, BackupKind::Manual);
    }

    #[test]
    fn test_all_kinds_round_trip() {
        let timestamp: DateTime<Utc> = "2026-01-02T03:04:05.006Z".parse().unwrap();

        for kind in [
            BackupKind::Manual,
            BackupKind::Auto,
            BackupKind::PreUpdate,
            BackupKind::PreRestore,
        ] {
            let filename = backup_filename(&timestamp, kind);
            let (parsed, parsed_kind) = parse_backup_filename(&filename).unwrap();
            assert_eq!(parsed, timestamp);
            assert_eq!(parsed_kind, kind);
        }
    }

    #[test]
    fn test_rejects_names_outside_the_grammar() {
        assert!(parse_backup_filename("backup-2026-03-14T09-26-53-589Z-manual.tar").is_none());
        assert!(parse_backup_filename("backup-2026-03-14-manual.tar.gz").is_none());
        assert!(parse_backup_filename("snapshot.tar.gz").is_none());
        assert!(
            parse_backup_filename("backup-2026-03-14T09-26-53-589Z-weekly.tar.gz").is_none()
        );
        // Operator-placed files with extra prefixes are ignored too.
        assert!(
            parse_backup_filename("old-backup-2026-03-14T09-26-53-589Z-manual.tar.gz").is_none()
        );
    }
}
