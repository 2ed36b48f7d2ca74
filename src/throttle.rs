/// Alert debouncing keyed by message prefix.
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Number of leading characters that identify "the same" alert.
pub const MESSAGE_KEY_LEN: usize = 10;

/// Upper bound on remembered keys; the oldest inserted key is evicted first.
pub const MAX_THROTTLE_ENTRIES: usize = 1024;

#[derive(Debug, Default)]
pub struct ReportThrottle {
    last_reported: HashMap<String, DateTime<Utc>>,
    order: VecDeque<String>,
}

impl ReportThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `message` should be suppressed because an alert
    /// with the same prefix went out less than `period` ago. Otherwise the
    /// emission is recorded and `false` is returned.
    pub fn throttle(&mut self, message: &str, period: Duration, now: DateTime<Utc>) -> bool {
        let key: String = message.chars().take(MESSAGE_KEY_LEN).collect();

        if let Some(last) = self.last_reported.get(&key) {
            if now < *last + period {
                tracing::debug!(msg = message, "message has been throttled");
                return true;
            }
        }

        if self.last_reported.insert(key.clone(), now).is_none() {
            self.order.push_back(key);
            if self.order.len() > MAX_THROTTLE_ENTRIES {
                if let Some(oldest) = self.order.pop_front() {
                    self.last_reported.remove(&oldest);
                }
            }
        }
        false
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.last_reported.len()
    }
}
