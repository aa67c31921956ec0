use chrono::Duration;

/// Formats a duration the way it is reported after a stretch, e.g. `1h 5m 3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::format_duration;

    #[test]
    fn formats_largest_unit_first() {
        assert_eq!(format_duration(Duration::zero()), "0s");
        assert_eq!(format_duration(Duration::milliseconds(1500)), "1s");
        assert_eq!(format_duration(Duration::seconds(125)), "2m 5s");
        assert_eq!(format_duration(Duration::seconds(3600 + 5 * 60 + 3)), "1h 5m 3s");
        assert_eq!(format_duration(Duration::hours(27)), "27h 0m 0s");
    }
}
