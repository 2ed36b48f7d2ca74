/// Wall-clock abstraction so the resolvers can be driven by tests.
use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convert fractional seconds into a chrono duration. Negative, non-finite
/// and out-of-range values have no duration.
pub fn seconds(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let millis = (secs * 1000.0).round();
    if millis >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis as i64)
}

/// A configured number of seconds, named after its setting for error reports.
pub fn period(setting: &'static str, secs: f64) -> Result<Duration, InvalidPeriod> {
    seconds(secs).ok_or(InvalidPeriod { setting, secs })
}

/// A setting that is not a usable non-negative number of seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidPeriod {
    pub setting: &'static str,
    pub secs: f64,
}

impl std::fmt::Display for InvalidPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid {}: {} (expected a non-negative number of seconds)",
            self.setting, self.secs
        )
    }
}

impl std::error::Error for InvalidPeriod {}

/// Timestamp formatted as fractional Unix seconds, the way the agent logs them.
pub fn unix_ts(at: DateTime<Utc>) -> String {
    format!("{:.3}", at.timestamp_millis() as f64 / 1000.0)
}

#[cfg(test)]
pub use manual::ManualClock;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_keeps_millisecond_precision() {
        assert_eq!(seconds(1.5), Some(Duration::milliseconds(1500)));
        assert_eq!(seconds(0.0), Some(Duration::zero()));
    }

    #[test]
    fn test_seconds_rejects_unusable_values() {
        assert_eq!(seconds(-1.0), None);
        assert_eq!(seconds(-1e300), None);
        assert_eq!(seconds(1e300), None);
        assert_eq!(seconds(f64::INFINITY), None);
        assert_eq!(seconds(f64::NAN), None);
    }

    #[test]
    fn test_period_names_setting() {
        assert_eq!(period("worker.reboot_wait_secs", 60.0), Ok(Duration::seconds(60)));
        let err = period("worker.reboot_wait_secs", f64::INFINITY).unwrap_err();
        assert_eq!(err.setting, "worker.reboot_wait_secs");
        assert!(err.to_string().starts_with("invalid worker.reboot_wait_secs: inf"));
    }

    #[test]
    fn test_unix_ts_format() {
        let at = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        assert_eq!(unix_ts(at), "1700000000.250");
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::at_unix(100);
        let other = clock.clone();
        clock.advance(2.5);
        assert_eq!(other.now().timestamp_millis(), 102_500);
        other.set_unix(0);
        assert_eq!(clock.now().timestamp(), 0);
    }
}
