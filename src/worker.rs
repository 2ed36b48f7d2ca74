/// Client for the worker's self-reporting status endpoint.
use crate::sample::WorkerStatus;
use async_trait::async_trait;

#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn get_status(&self) -> Result<WorkerStatus, WorkerError>;
}

/// Errors from querying the worker.
#[derive(Debug)]
pub enum WorkerError {
    /// Worker unreachable: connection refused, reset, or timed out.
    Connection { source: reqwest::Error },
    /// Worker answered with a non-success status code.
    Http { status: u16, body: String },
    /// Worker answered 2xx with a body that is not a valid status document.
    Payload { source: serde_json::Error },
    /// Request failed before reaching the worker (bad URL, TLS setup, ...).
    Request { source: reqwest::Error },
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Connection { source } => write!(f, "worker unreachable: {source}"),
            WorkerError::Http { status, body } if body.is_empty() => {
                write!(f, "worker returned HTTP{status}")
            }
            WorkerError::Http { status, body } => write!(f, "worker returned HTTP{status}: {body}"),
            WorkerError::Payload { source } => write!(f, "malformed worker status: {source}"),
            WorkerError::Request { source } => write!(f, "worker status request failed: {source}"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Connection { source } => Some(source),
            WorkerError::Http { .. } => None,
            WorkerError::Payload { source } => Some(source),
            WorkerError::Request { source } => Some(source),
        }
    }
}

/// Longest body excerpt carried in an HTTP error.
const MAX_ERROR_BODY: usize = 200;

pub struct HttpWorkerClient {
    client: reqwest::Client,
    url: String,
}

impl HttpWorkerClient {
    pub fn new(url: impl Into<String>, timeout_secs: f64) -> Result<Self, reqwest::Error> {
        let timeout = std::time::Duration::try_from_secs_f64(timeout_secs)
            .unwrap_or(std::time::Duration::from_secs(10));
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn get_status(&self) -> Result<WorkerStatus, WorkerError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_send_error)?;
        if !status.is_success() {
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(WorkerError::Http {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        serde_json::from_str(&body).map_err(|e| WorkerError::Payload { source: e })
    }
}

fn classify_send_error(e: reqwest::Error) -> WorkerError {
    if e.is_builder() {
        WorkerError::Request { source: e }
    } else {
        WorkerError::Connection { source: e }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response on a random local port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/status")
    }

    #[tokio::test]
    async fn test_get_status_ok() {
        let url = serve_once(
            "200 OK",
            r#"{"loops": {"a": {"loop_type": "periodic", "period": 5, "counter": 1}}, "collected_counter": 4}"#,
        )
        .await;
        let client = HttpWorkerClient::new(url, 5.0).unwrap();
        let status = client.get_status().await.unwrap();
        assert_eq!(status.loops["a"].counter, Some(1));
        assert_eq!(status.collected_counter, Some(4));
    }

    #[tokio::test]
    async fn test_http_error_carries_status_code() {
        let url = serve_once("503 Service Unavailable", "overloaded").await;
        let client = HttpWorkerClient::new(url, 5.0).unwrap();
        let err = client.get_status().await.unwrap_err();
        match &err {
            WorkerError::Http { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected Http, got {other:?}"),
        }
        assert_eq!(err.to_string(), "worker returned HTTP503: overloaded");
    }

    #[tokio::test]
    async fn test_malformed_body_is_payload_error() {
        let url = serve_once("200 OK", "not json").await;
        let client = HttpWorkerClient::new(url, 5.0).unwrap();
        let err = client.get_status().await.unwrap_err();
        assert!(matches!(err, WorkerError::Payload { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpWorkerClient::new(format!("http://{addr}/status"), 5.0).unwrap();
        let err = client.get_status().await.unwrap_err();
        assert!(matches!(err, WorkerError::Connection { .. }), "got {err:?}");
    }
}
