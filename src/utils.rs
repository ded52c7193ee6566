use chrono::{DateTime, Timelike, Utc};

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Drop sub-second precision; samples are keyed at second resolution.
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rounds_to_places() {
        assert_eq!(round_to(150.333_333, 1), 150.3);
        assert_eq!(round_to(0.875, 2), 0.88);
        assert_eq!(round_to(0.000_416_66, 4), 0.0004);
    }

    #[test]
    fn truncates_subsecond() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap() + chrono::Duration::milliseconds(750);
        assert_eq!(truncate_to_second(ts), Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap());
    }
}
