use async_trait::async_trait;
use conveyor_core::{Agent, AgentOutcome, ConveyorError, ConveyorResult, Phase};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct PhaseRequest<'a> {
    phase: String,
    payload: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PhaseResponse {
    status: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
}

/// An [`Agent`] reached over HTTP.
///
/// Each call POSTs `{phase, payload}` to the configured endpoint and expects
/// `{"status": "completed" | "rejected", "data"?, "reason"?}` back. The
/// caller-supplied timeout bounds the whole request; expiry surfaces as an
/// agent error, which the engine treats as a retryable phase failure.
pub struct HttpAgent {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgent {
    /// Create an agent targeting `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Create an agent with a shared reqwest client.
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    async fn execute(
        &self,
        phase: Phase,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> ConveyorResult<AgentOutcome> {
        let request = PhaseRequest {
            phase: phase.to_string(),
            payload,
        };

        debug!(endpoint = %self.endpoint, phase = %phase, "Dispatching phase to agent");

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConveyorError::Agent(format!("agent call timed out after {timeout:?}"))
                } else {
                    ConveyorError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConveyorError::Http(format!(
                "agent returned {status}: {body}"
            )));
        }

        let parsed: PhaseResponse = response
            .json()
            .await
            .map_err(|e| ConveyorError::Agent(format!("invalid agent response: {e}")))?;

        match parsed.status.as_str() {
            "completed" => Ok(AgentOutcome::Completed { data: parsed.data }),
            "rejected" => Ok(AgentOutcome::Rejected {
                reason: parsed
                    .reason
                    .unwrap_or_else(|| "rejected without reason".to_string()),
            }),
            other => Err(ConveyorError::Agent(format!(
                "unknown agent status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_completed_with_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(body_partial_json(
                serde_json::json!({"phase": "test_generation"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "completed",
                "data": {"tests": 12}
            })))
            .mount(&server)
            .await;

        let agent = HttpAgent::new(format!("{}/run", server.uri()));
        let outcome = agent
            .execute(
                Phase::TestGeneration,
                &serde_json::json!({"repo": "api"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        match outcome {
            AgentOutcome::Completed { data } => {
                assert_eq!(data.unwrap()["tests"], 12);
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "rejected",
                "reason": "security review failed"
            })))
            .mount(&server)
            .await;

        let agent = HttpAgent::new(server.uri());
        let outcome = agent
            .execute(
                Phase::GuardianReview,
                &serde_json::Value::Null,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AgentOutcome::Rejected {
                reason: "security review failed".into()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let agent = HttpAgent::new(server.uri());
        let err = agent
            .execute(
                Phase::Validation,
                &serde_json::Value::Null,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        match err {
            ConveyorError::Http(msg) => assert!(msg.contains("503")),
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_agent_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "completed"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let agent = HttpAgent::new(server.uri());
        let err = agent
            .execute(
                Phase::Validation,
                &serde_json::Value::Null,
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        match err {
            ConveyorError::Agent(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected Agent timeout error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_status_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "maybe"})),
            )
            .mount(&server)
            .await;

        let agent = HttpAgent::new(server.uri());
        let err = agent
            .execute(
                Phase::Validation,
                &serde_json::Value::Null,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("maybe"));
    }
}
