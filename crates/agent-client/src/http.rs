//! HTTP surface of the agent server
//!
//! Thin reqwest client behind the [`AgentApi`] trait so the core can be
//! driven by fakes in tests. All calls are directory-scoped; the server
//! multiplexes every directory behind one endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use paddock_protocol::PromptPart;

use crate::events::{EventEnvelope, SessionInfo, SseAccumulator};
use crate::AgentServerError;

/// Directory-scoped view of the agent server's API.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn create_session(&self, directory: &str) -> Result<SessionInfo, AgentServerError>;

    async fn session_info(
        &self,
        directory: &str,
        session_id: &str,
    ) -> Result<SessionInfo, AgentServerError>;

    async fn send_prompt(
        &self,
        directory: &str,
        session_id: &str,
        parts: &[PromptPart],
    ) -> Result<(), AgentServerError>;

    async fn abort(&self, directory: &str, session_id: &str) -> Result<(), AgentServerError>;

    /// Open the directory's event stream. The pump stops when `cancel` fires;
    /// any other termination closes the subscription's channel.
    async fn subscribe(
        &self,
        directory: &str,
        cancel: CancellationToken,
    ) -> Result<EventSubscription, AgentServerError>;
}

/// A live directory-scoped event stream.
pub struct EventSubscription {
    rx: mpsc::Receiver<EventEnvelope>,
}

impl EventSubscription {
    /// Next envelope, or `None` once the stream is done.
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Build a subscription directly from a channel. Test seam.
    pub fn from_receiver(rx: mpsc::Receiver<EventEnvelope>) -> Self {
        Self { rx }
    }
}

/// reqwest-backed implementation of [`AgentApi`].
pub struct HttpAgentClient {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpAgentClient {
    /// The client carries no global timeout; `request_timeout` is applied
    /// per call so the streaming `/event` request stays open indefinitely.
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, AgentServerError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url,
            client,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn create_session(&self, directory: &str) -> Result<SessionInfo, AgentServerError> {
        let response = self
            .client
            .post(self.url("/session"))
            .query(&[("directory", directory)])
            .json(&json!({}))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    async fn session_info(
        &self,
        directory: &str,
        session_id: &str,
    ) -> Result<SessionInfo, AgentServerError> {
        let response = self
            .client
            .get(self.url(&format!("/session/{session_id}")))
            .query(&[("directory", directory)])
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    async fn send_prompt(
        &self,
        directory: &str,
        session_id: &str,
        parts: &[PromptPart],
    ) -> Result<(), AgentServerError> {
        let response = self
            .client
            .post(self.url(&format!("/session/{session_id}/message")))
            .query(&[("directory", directory)])
            .json(&json!({ "parts": parts }))
            .timeout(self.request_timeout)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn abort(&self, directory: &str, session_id: &str) -> Result<(), AgentServerError> {
        let response = self
            .client
            .post(self.url(&format!("/session/{session_id}/abort")))
            .query(&[("directory", directory)])
            .timeout(self.request_timeout)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        directory: &str,
        cancel: CancellationToken,
    ) -> Result<EventSubscription, AgentServerError> {
        let response = self
            .client
            .get(self.url("/event"))
            .query(&[("directory", directory)])
            .send()
            .await?;
        let response = check(response).await?;

        let (tx, rx) = mpsc::channel(256);
        let directory = directory.to_string();
        tokio::spawn(async move {
            pump_events(response, tx, cancel, directory).await;
        });
        Ok(EventSubscription { rx })
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentServerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentServerError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn pump_events(
    response: reqwest::Response,
    tx: mpsc::Sender<EventEnvelope>,
    cancel: CancellationToken,
    directory: String,
) {
    let mut accumulator = SseAccumulator::new();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => {
                debug!(
                    component = "agent_client",
                    event = "events.cancelled",
                    directory = %directory,
                    "Event stream cancelled"
                );
                return;
            }
            chunk = stream.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(
                    component = "agent_client",
                    event = "events.transport_error",
                    directory = %directory,
                    error = %e,
                    "Event stream transport error"
                );
                return;
            }
            None => {
                debug!(
                    component = "agent_client",
                    event = "events.ended",
                    directory = %directory,
                    "Event stream ended"
                );
                return;
            }
        };

        let text = String::from_utf8_lossy(&chunk);
        for payload in accumulator.push(&text) {
            let envelope = match EventEnvelope::parse(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        component = "agent_client",
                        event = "events.parse_error",
                        directory = %directory,
                        error = %e,
                        "Skipping unparseable event"
                    );
                    continue;
                }
            };
            if tx.send(envelope).await.is_err() {
                // Receiver gone; the subscription was dropped.
                return;
            }
        }
    }
}
