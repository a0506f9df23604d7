//! One-shot adapter over the LLM transport.
//!
//! An [`Agent`] owns no conversation state — the runner threads history in
//! from the [`Echo`](crate::lars::echo::Echo) and the agent's job is a single
//! round-trip: build the chat request, call the transport (retrying transient
//! failures with exponential backoff), and hand back the assistant text, any
//! native tool calls, and the usage/cost the provider reported.

use crate::lars::transport::{
    ChatMessage, ChatParams, ChatRequest, ChatResponse, ChatTransport, ToolSpec,
};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Transport retry budget for a single turn.
const MAX_TRANSPORT_ATTEMPTS: usize = 3;
/// Base backoff; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// LLM transport failure that survived its retries.
#[derive(Debug, Clone)]
pub struct AgentError {
    pub attempts: usize,
    pub message: String,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LLM transport failed after {} attempts: {}",
            self.attempts, self.message
        )
    }
}

impl Error for AgentError {}

/// One completed LLM round-trip.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub content: String,
    pub tool_calls: Vec<crate::lars::transport::ToolCall>,
    pub usage: crate::lars::transport::Usage,
}

impl From<ChatResponse> for AgentTurn {
    fn from(response: ChatResponse) -> Self {
        Self {
            content: response.content,
            tool_calls: response.tool_calls,
            usage: response.usage,
        }
    }
}

/// A model binding over a shared transport.
pub struct Agent {
    transport: Arc<dyn ChatTransport>,
    model: String,
    params: ChatParams,
}

impl Agent {
    /// Bind a transport to a model. An empty model string falls back to the
    /// transport's default.
    pub fn new(transport: Arc<dyn ChatTransport>, model: impl Into<String>) -> Self {
        let model = model.into();
        let model = if model.is_empty() {
            transport.default_model().to_string()
        } else {
            model
        };
        Self {
            transport,
            model,
            params: ChatParams::default(),
        }
    }

    pub fn with_params(mut self, params: ChatParams) -> Self {
        self.params = params;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one round-trip. Transient transport failures are retried with
    /// exponential backoff; exhaustion surfaces as [`AgentError`].
    pub async fn turn(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSpec>,
    ) -> Result<AgentTurn, AgentError> {
        let mut last_error = String::new();
        for attempt in 0..MAX_TRANSPORT_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFF_BASE * (1 << (attempt - 1)) as u32;
                log::warn!(
                    "transport attempt {} for model {} failed ({}); retrying in {:?}",
                    attempt,
                    self.model,
                    last_error,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            let request = ChatRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                params: self.params.clone(),
            };
            match self.transport.chat(request).await {
                Ok(response) => return Ok(response.into()),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(AgentError {
            attempts: MAX_TRANSPORT_ATTEMPTS,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lars::transport::{ChatResponse, Role, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyTransport {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatTransport for FlakyTransport {
        async fn chat(
            &self,
            _request: ChatRequest,
        ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err("connection reset".into());
            }
            Ok(ChatResponse {
                content: "ok".to_string(),
                tool_calls: Vec::new(),
                usage: Usage::default(),
            })
        }

        fn default_model(&self) -> &str {
            "mock/flaky"
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let agent = Agent::new(
            Arc::new(FlakyTransport {
                failures_before_success: 2,
                calls: AtomicUsize::new(0),
            }),
            "",
        );
        let turn = agent
            .turn(vec![ChatMessage::text(Role::User, "hi")], Vec::new())
            .await
            .unwrap();
        assert_eq!(turn.content, "ok");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_agent_error() {
        let agent = Agent::new(
            Arc::new(FlakyTransport {
                failures_before_success: 99,
                calls: AtomicUsize::new(0),
            }),
            "mock/flaky",
        );
        let err = agent
            .turn(vec![ChatMessage::text(Role::User, "hi")], Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, MAX_TRANSPORT_ATTEMPTS);
        assert!(err.message.contains("connection reset"));
    }

    #[tokio::test]
    async fn empty_model_falls_back_to_transport_default() {
        let agent = Agent::new(
            Arc::new(FlakyTransport {
                failures_before_success: 0,
                calls: AtomicUsize::new(0),
            }),
            "",
        );
        assert_eq!(agent.model(), "mock/flaky");
    }
}
