pub mod openai;
pub mod tools;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::RunError;

/// Which model backend a task is pinned to. Stamped onto the task at
/// creation so it survives restarts and config changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Gemini,
    Grok,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Grok => "grok",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "gemini" => Some(Provider::Gemini),
            "grok" => Some(Provider::Grok),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque pointer to backend-side conversation state. Only the backend
/// that minted a handle knows how to resume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// None starts a fresh conversation; Some resumes an existing one.
    pub session: Option<SessionHandle>,
    pub prompt: String,
    pub system_prompt: String,
    /// Names of the tools this request may invoke. Empty means the
    /// model gets no tools at all.
    pub tool_permissions: Vec<String>,
}

/// Raw progress events from a backend while a request executes.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Thinking,
    ToolStarted { tool: String, args_summary: String },
    ToolFinished { tool: String, ok: bool },
    TextDelta { text: String },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cost_estimate: Option<f64>,
    },
    /// Always the last event of a successful request. The returned
    /// handle is the session to resume next time.
    Completed {
        final_text: String,
        session: SessionHandle,
    },
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Execute one request, pushing progress through `tx`. On
    /// cancellation the backend must stop promptly and return a
    /// cancelled error; partial output is discarded.
    async fn run(
        &self,
        req: BackendRequest,
        tx: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RunError>;
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.push(backend);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ModelBackend>, RunError> {
        self.backends
            .iter()
            .find(|b| b.provider() == provider)
            .cloned()
            .ok_or_else(|| {
                RunError::unavailable(format!("no backend registered for {}", provider))
            })
    }
}
