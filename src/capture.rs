/// External error capture: where warnings and errors go besides the local log.
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureLevel {
    Warning,
    Error,
}

pub trait CaptureSink: Send + Sync {
    fn capture_message(&self, message: &str, level: CaptureLevel);
    fn capture_exception(&self, error: &(dyn std::error::Error + 'static));
}

/// Records captures as structured log events under the `capture` target.
pub struct LogSink;

impl CaptureSink for LogSink {
    fn capture_message(&self, message: &str, level: CaptureLevel) {
        tracing::info!(target: "capture", ?level, text = message, "captured message");
    }

    fn capture_exception(&self, error: &(dyn std::error::Error + 'static)) {
        tracing::info!(target: "capture", error = %error_chain(error), "captured exception");
    }
}

#[derive(Debug, Serialize)]
struct CapturePayload<'a> {
    kind: &'static str,
    level: CaptureLevel,
    message: &'a str,
    host: &'a str,
}

/// Fire-and-forget JSON POST to a collector endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    host: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            client,
            url: url.into(),
            host,
        })
    }

    fn send(&self, kind: &'static str, level: CaptureLevel, message: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime, dropping capture");
            return;
        };
        let payload = CapturePayload {
            kind,
            level,
            message,
            host: &self.host,
        };
        let request = self.client.post(&self.url).json(&payload);
        handle.spawn(async move {
            if let Err(e) = request.send().await.and_then(|r| r.error_for_status()) {
                tracing::debug!(error = %e, "capture webhook failed");
            }
        });
    }
}

impl CaptureSink for WebhookSink {
    fn capture_message(&self, message: &str, level: CaptureLevel) {
        self.send("message", level, message);
    }

    fn capture_exception(&self, error: &(dyn std::error::Error + 'static)) {
        self.send("exception", CaptureLevel::Error, &error_chain(error));
    }
}

/// Render an error with all of its sources: `outer: inner: root`.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        // Many Display impls already embed their source
        if !rendered.contains(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
pub use recording::RecordingSink;

#[cfg(test)]
mod recording {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that remembers everything it was given. Clones share storage.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub messages: Arc<Mutex<Vec<(String, CaptureLevel)>>>,
        pub exceptions: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        pub fn messages(&self) -> Vec<(String, CaptureLevel)> {
            self.messages.lock().unwrap().clone()
        }

        pub fn exceptions(&self) -> Vec<String> {
            self.exceptions.lock().unwrap().clone()
        }

        pub fn messages_containing(&self, needle: &str) -> usize {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m.contains(needle))
                .count()
        }
    }

    impl CaptureSink for RecordingSink {
        fn capture_message(&self, message: &str, level: CaptureLevel) {
            self.messages.lock().unwrap().push((message.to_string(), level));
        }

        fn capture_exception(&self, error: &(dyn std::error::Error + 'static)) {
            self.exceptions.lock().unwrap().push(error_chain(error));
        }
    }
}
