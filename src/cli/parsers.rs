//! Shared CLI argument parsers.

use std::time::Duration;
use vmdisk::DiskKind;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Disk kind selected by the `--vhd` flag.
pub fn disk_kind(vhd: bool) -> DiskKind {
    if vhd {
        DiskKind::Virtual
    } else {
        DiskKind::PassThrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_disk_kind() {
        assert_eq!(disk_kind(true), DiskKind::Virtual);
        assert_eq!(disk_kind(false), DiskKind::PassThrough);
    }
}
