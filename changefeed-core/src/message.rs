//! Value types shared by every sink: the hybrid logical timestamp carried
//! on each row and the table descriptor rows are emitted for.

use std::fmt;
use std::time::Duration;

use chrono::{TimeZone, Utc};

/// Hybrid logical timestamp: wall-clock nanoseconds plus a logical
/// tie-breaker tick. Ordering is wall first, logical second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub wall_ns: i64,
    pub logical: i32,
}

impl Timestamp {
    pub const fn new(wall_ns: i64, logical: i32) -> Self {
        Self { wall_ns, logical }
    }

    /// Wall-clock start of the bucket containing this timestamp. The
    /// logical component is discarded: two rows on the same wall
    /// nanosecond share a bucket regardless of logical ticks.
    pub fn bucket_start(&self, bucket_size: Duration) -> i64 {
        let size = bucket_size.as_nanos() as i64;
        self.wall_ns - self.wall_ns.rem_euclid(size)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.wall_ns, self.logical)
    }
}

/// Format a bucket instant as `YYYYMMDDHHMMSS` plus nine zero-padded
/// nanosecond digits. Lexicographic order of formatted instants matches
/// time order, which the object-store file layout depends on.
pub fn format_bucket(wall_ns: i64) -> String {
    let dt = Utc.timestamp_nanos(wall_ns);
    format!("{}{:09}", dt.format("%Y%m%d%H%M%S"), dt.timestamp_subsec_nanos())
}

/// A watched table: the topic name its rows are published under plus the
/// schema version their payloads were encoded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub schema_version: u64,
}

impl Table {
    pub fn new(name: impl Into<String>, schema_version: u64) -> Self {
        Self {
            name: name.into(),
            schema_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(10, 1);
        let c = Timestamp::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, Timestamp::new(10, 0));
    }

    #[test]
    fn test_bucket_boundary() {
        let bucket = Duration::from_secs(1);
        let before = Timestamp::new(999_999_999, 0);
        let after = Timestamp::new(1_000_000_000, 0);
        assert_eq!(before.bucket_start(bucket), 0);
        assert_eq!(after.bucket_start(bucket), 1_000_000_000);
    }

    #[test]
    fn test_bucket_ignores_logical() {
        let bucket = Duration::from_secs(1);
        let a = Timestamp::new(1_500_000_000, 0);
        let b = Timestamp::new(1_500_000_000, 7);
        assert_eq!(a.bucket_start(bucket), b.bucket_start(bucket));
    }

    #[test]
    fn test_format_bucket() {
        assert_eq!(format_bucket(0), "19700101000000000000000");
        assert_eq!(format_bucket(1_999_999_999), "19700101000001999999999");
        assert_eq!(format_bucket(2_000_000_000), "19700101000002000000000");
    }

    #[test]
    fn test_format_bucket_lexicographic() {
        let mut names: Vec<String> = [2_000_000_000i64, 0, 1_999_999_999, 1_000_000_000]
            .iter()
            .map(|ns| format_bucket(*ns))
            .collect();
        let sorted_by_time = vec![
            format_bucket(0),
            format_bucket(1_000_000_000),
            format_bucket(1_999_999_999),
            format_bucket(2_000_000_000),
        ];
        names.sort();
        assert_eq!(names, sorted_by_time);
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(Timestamp::new(1_500_000_000, 3).to_string(), "1500000000.0000000003");
    }
}
