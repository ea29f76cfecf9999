//! Small shared utilities for the embermq broker core: timestamp helpers,
//! human-readable duration parsing and the [`Counter`] used for broker-wide
//! statistics.

#![deny(unsafe_code)]

use std::time::Duration;

mod counter;

pub use counter::Counter;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

#[inline]
pub fn timestamp_secs() -> Timestamp {
    chrono::Local::now().timestamp()
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Local::now().timestamp_millis()
}

#[inline]
pub fn format_timestamp(t: Timestamp) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_opt(t, 0) {
            t.format("%Y-%m-%d %H:%M:%S").to_string()
        } else {
            "".into()
        }
    }
}

/// Parses duration strings such as "30s", "5m", "1h30m" or "1500ms" into a
/// [`Duration`]. Unknown units contribute zero.
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60_000,
                'h' => v * 3_600_000,
                'd' => v * 86_400_000,
                'w' => v * 604_800_000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration("30s"), Duration::from_secs(30));
        assert_eq!(to_duration("1h30m15s"), Duration::from_secs(5415));
        assert_eq!(to_duration("1500ms"), Duration::from_millis(1500));
        assert_eq!(to_duration("2d"), Duration::from_secs(172_800));
        assert_eq!(to_duration(""), Duration::from_secs(0));
    }

    #[test]
    fn test_timestamps() {
        let s = timestamp_secs();
        let ms = timestamp_millis();
        assert!(s > 0);
        assert!(ms / 1000 >= s - 1);
        assert!(!format_timestamp(s).is_empty());
        assert_eq!(format_timestamp(0), "");
    }
}
