use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use common::resource::ResourceState;

use crate::config::AgentSettings;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent reports that the deployment or instance no longer exists.
    #[error("agent target not found: {0}")]
    NotFound(String),
    #[error("agent request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("agent returned {status}: {body}")]
    Response { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOperationState {
    Processing,
    Succeeded,
    Failed,
    Aborted,
}

impl AgentOperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentOperationState::Processing)
    }

    pub fn into_resource_state(self) -> ResourceState {
        match self {
            AgentOperationState::Processing => ResourceState::Processing,
            AgentOperationState::Succeeded => ResourceState::Succeeded,
            AgentOperationState::Failed => ResourceState::Failed,
            AgentOperationState::Aborted => ResourceState::Aborted,
        }
    }
}

/// Result contract of the agent's last-operation query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLastOperation {
    pub state: AgentOperationState,
    #[serde(default)]
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn get_last_operation(&self, agent_ip: &str)
    -> Result<AgentLastOperation, AgentError>;

    async fn abort(&self, agent_ip: &str) -> Result<(), AgentError>;

    async fn get_logs(&self, agent_ip: &str) -> Result<Vec<JsonValue>, AgentError>;
}

pub struct HttpAgentClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpAgentClient {
    pub fn new(settings: &AgentSettings) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(HttpAgentClient {
            client,
            port: settings.port,
        })
    }

    fn url(&self, agent_ip: &str, path: &str) -> String {
        format!("http://{agent_ip}:{}/v1/{path}", self.port)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::NotFound(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Response {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn get_last_operation(
        &self,
        agent_ip: &str,
    ) -> Result<AgentLastOperation, AgentError> {
        let response = self
            .client
            .get(self.url(agent_ip, "backup/operation"))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn abort(&self, agent_ip: &str) -> Result<(), AgentError> {
        let response = self
            .client
            .delete(self.url(agent_ip, "backup"))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_logs(&self, agent_ip: &str) -> Result<Vec<JsonValue>, AgentError> {
        let response = self
            .client
            .get(self.url(agent_ip, "backup/logs"))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}
