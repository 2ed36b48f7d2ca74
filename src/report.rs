/// Warning/error reporting: always logged locally, forwarded to the capture
/// sink unless an alert with the same prefix went out recently.
use crate::capture::{error_chain, CaptureLevel, CaptureSink};
use crate::clock::{period, seconds, InvalidPeriod};
use crate::config::WatchdogConfig;
use crate::throttle::ReportThrottle;
use chrono::{DateTime, Duration, Utc};

pub struct Reporter {
    throttle: ReportThrottle,
    sink: Box<dyn CaptureSink>,
    warning_period: Duration,
    error_period: Duration,
}

impl Reporter {
    pub fn new(sink: Box<dyn CaptureSink>) -> Self {
        let defaults = WatchdogConfig::default();
        Self {
            throttle: ReportThrottle::new(),
            sink,
            warning_period: seconds(defaults.warning_report_period_secs)
                .unwrap_or_else(Duration::zero),
            error_period: seconds(defaults.error_report_period_secs).unwrap_or_else(Duration::zero),
        }
    }

    /// Pick up report periods from freshly loaded settings. On error the
    /// previous periods stay in effect.
    pub fn configure(&mut self, config: &WatchdogConfig) -> Result<(), InvalidPeriod> {
        let warning_period = period(
            "watchdog.warning_report_period_secs",
            config.warning_report_period_secs,
        )?;
        let error_period = period(
            "watchdog.error_report_period_secs",
            config.error_report_period_secs,
        )?;
        self.warning_period = warning_period;
        self.error_period = error_period;
        Ok(())
    }

    pub fn warning(&mut self, message: &str, now: DateTime<Utc>) {
        tracing::warn!("{message}");
        if !self.throttle.throttle(message, self.warning_period, now) {
            self.sink.capture_message(message, CaptureLevel::Warning);
        }
    }

    pub fn error(&mut self, message: &str, now: DateTime<Utc>) {
        tracing::error!("{message}");
        if !self.throttle.throttle(message, self.error_period, now) {
            self.sink.capture_message(message, CaptureLevel::Error);
        }
    }

    /// Log an unexpected failure with its full cause chain and capture it.
    /// Exceptions are never throttled.
    pub fn exception(&self, context: &str, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(error = %error_chain(error), "{context}");
        self.sink.capture_exception(error);
    }
}
