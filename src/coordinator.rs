/// Client for the remote coordinator that knows whether the agent is online.
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// `Ok(None)` means the coordinator answered but could not tell.
    async fn is_agent_online(&self) -> Result<Option<bool>, CoordinatorError>;
}

#[derive(Debug)]
pub enum CoordinatorError {
    Transport { source: reqwest::Error },
    Http { status: u16 },
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Transport { source } => {
                write!(f, "coordinator request failed: {source}")
            }
            CoordinatorError::Http { status } => write!(f, "coordinator returned HTTP{status}"),
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Transport { source } => Some(source),
            CoordinatorError::Http { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OnlineResponse {
    #[serde(default)]
    online: Option<bool>,
}

pub struct HttpCoordinator {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpCoordinator {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout_secs: f64,
    ) -> Result<Self, reqwest::Error> {
        let timeout = std::time::Duration::try_from_secs_f64(timeout_secs)
            .unwrap_or(std::time::Duration::from_secs(10));
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn is_agent_online(&self) -> Result<Option<bool>, CoordinatorError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport { source: e })?;
        if !response.status().is_success() {
            return Err(CoordinatorError::Http {
                status: response.status().as_u16(),
            });
        }

        match response.json::<OnlineResponse>().await {
            Ok(body) => Ok(body.online),
            Err(e) => {
                tracing::debug!(error = %e, "unexpected coordinator response");
                Ok(None)
            }
        }
    }
}
