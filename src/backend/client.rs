//! HTTP client for the AI interpretation backends.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::instance::BackendTarget;
use crate::error::BackendError;

/// The structured prompt sent for one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingPrompt {
    pub task_id: String,
    pub question: String,
    pub cards: String,
}

/// Transport to an interpretation backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Ask `target` for an interpretation of `prompt`.
    async fn interpret(&self, target: &BackendTarget, prompt: &ReadingPrompt) -> Result<String, BackendError>;

    /// Lightweight liveness probe.
    async fn probe(&self, target: &BackendTarget) -> Result<(), BackendError>;
}

#[derive(Debug, Serialize)]
struct WorkflowInputs<'a> {
    question: &'a str,
    cards: &'a str,
}

#[derive(Debug, Serialize)]
struct WorkflowRequest<'a> {
    inputs: WorkflowInputs<'a>,
    response_mode: &'static str,
    user: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowResponse {
    #[serde(default)]
    data: WorkflowData,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowData {
    #[serde(default)]
    answer: Option<String>,
}

/// Workflow-API client over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    client: Client,
}

impl HttpBackendClient {
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// The interpretation is `data.answer` when the backend provides one,
/// otherwise the raw response body.
fn extract_interpretation(body: &str) -> Result<String, BackendError> {
    let answer = serde_json::from_str::<WorkflowResponse>(body)
        .ok()
        .and_then(|resp| resp.data.answer)
        .filter(|answer| !answer.trim().is_empty());

    let interpretation = answer.unwrap_or_else(|| body.to_string());
    if interpretation.trim().is_empty() {
        return Err(BackendError::EmptyResponse);
    }
    Ok(interpretation)
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn interpret(&self, target: &BackendTarget, prompt: &ReadingPrompt) -> Result<String, BackendError> {
        let request = WorkflowRequest {
            inputs: WorkflowInputs {
                question: &prompt.question,
                cards: &prompt.cards,
            },
            response_mode: "blocking",
            user: &prompt.task_id,
        };

        let response = self
            .client
            .post(format!("{}/workflows/run", target.url))
            .bearer_auth(target.api_key.expose())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        extract_interpretation(&body)
    }

    async fn probe(&self, target: &BackendTarget) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/health", target.url))
            .bearer_auth(target.api_key.expose())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}
