use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::tools;
use super::{BackendEvent, BackendRequest, ModelBackend, Provider, SessionHandle};
use crate::core::error::RunError;

/// Transcript messages kept per session on top of stateless
/// chat-completions endpoints.
const TRANSCRIPT_KEEP: usize = 100;

/// Upper bound on execute-and-continue rounds within one request.
const MAX_TOOL_ROUNDS: usize = 25;

#[derive(Serialize, Deserialize, Clone)]
struct StoredMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl StoredMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// One tool invocation assembled from streamed fragments.
#[derive(Debug, Default, Clone, PartialEq)]
struct ToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Rebuilds tool calls from `tool_calls` deltas, which arrive keyed by
/// index: id and name once, arguments as string fragments.
#[derive(Default)]
struct ToolCallBuilder {
    calls: BTreeMap<u64, ToolCall>,
}

impl ToolCallBuilder {
    fn apply(&mut self, delta: &Value) {
        let Some(list) = delta.get("tool_calls").and_then(|v| v.as_array()) else {
            return;
        };
        for fragment in list {
            let idx = fragment.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let call = self.calls.entry(idx).or_default();
            if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                call.id = id.to_string();
            }
            if let Some(function) = fragment.get("function") {
                if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                    call.name = name.to_string();
                }
                if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                    call.arguments.push_str(args);
                }
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls.into_values().collect()
    }
}

/// Streaming client for any OpenAI-compatible chat-completions API.
/// Sessions are adapter-owned: the endpoint is stateless, so the
/// transcript behind each `SessionHandle` lives under `sessions/`.
/// Tool calls are executed here and fed back until the model answers
/// in plain text.
pub struct OpenAiCompatBackend {
    provider: Provider,
    base_url: String,
    api_key: String,
    model: String,
    sessions_dir: PathBuf,
    client: Client,
}

impl OpenAiCompatBackend {
    pub fn new(
        provider: Provider,
        base_url: String,
        api_key: String,
        model: String,
        sessions_dir: PathBuf,
    ) -> Self {
        Self {
            provider,
            base_url,
            api_key,
            model,
            sessions_dir,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn openai(api_key: String, model: String, sessions_dir: PathBuf) -> Self {
        Self::new(
            Provider::OpenAi,
            "https://api.openai.com/v1".to_string(),
            api_key,
            model,
            sessions_dir,
        )
    }

    pub fn gemini(api_key: String, model: String, sessions_dir: PathBuf) -> Self {
        Self::new(
            Provider::Gemini,
            "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key,
            model,
            sessions_dir,
        )
    }

    pub fn grok(api_key: String, model: String, sessions_dir: PathBuf) -> Self {
        Self::new(
            Provider::Grok,
            "https://api.x.ai/v1".to_string(),
            api_key,
            model,
            sessions_dir,
        )
    }

    fn session_path(&self, handle: &SessionHandle) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", handle.as_str()))
    }

    async fn load_transcript(&self, session: &Option<SessionHandle>) -> Vec<StoredMessage> {
        let Some(handle) = session else {
            return Vec::new();
        };
        match tokio::fs::read_to_string(self.session_path(handle)).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(session = handle.as_str(), error = %e, "unreadable transcript, starting fresh");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    async fn persist_transcript(
        &self,
        handle: &SessionHandle,
        mut transcript: Vec<StoredMessage>,
    ) -> Result<(), RunError> {
        // Keep the system message plus the most recent exchanges.
        if transcript.len() > TRANSCRIPT_KEEP + 1 {
            let tail = transcript.split_off(transcript.len() - TRANSCRIPT_KEEP);
            transcript.truncate(1);
            transcript.extend(tail);
        }
        tokio::fs::create_dir_all(&self.sessions_dir)
            .await
            .map_err(|e| RunError::unavailable(format!("session dir: {}", e)))?;
        let raw = serde_json::to_string(&transcript)
            .map_err(|e| RunError::unavailable(format!("transcript encode: {}", e)))?;
        tokio::fs::write(self.session_path(handle), raw)
            .await
            .map_err(|e| RunError::unavailable(format!("transcript write: {}", e)))?;
        Ok(())
    }

    /// One streaming chat-completions call. Returns the assistant text
    /// and any tool calls the model requested.
    async fn stream_once(
        &self,
        messages: &[StoredMessage],
        tool_schemas: &[Value],
        tx: &mpsc::Sender<BackendEvent>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ToolCall>), RunError> {
        let mut payload = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tool_schemas.is_empty() {
            payload["tools"] = Value::Array(tool_schemas.to_vec());
        }

        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| RunError::unavailable(format!("{} request failed: {}", self.provider, e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => RunError::refused(format!("{}: {}", status, truncate(&body, 200))),
                _ => RunError::unavailable(format!("{}: {}", status, truncate(&body, 200))),
            });
        }

        let stream = res.bytes_stream();
        let mut reader =
            tokio_util::io::StreamReader::new(stream.map(|r| r.map_err(std::io::Error::other)));
        let mut buf_reader = tokio::io::BufReader::new(&mut reader);
        let mut line_buf = String::new();

        let mut text = String::new();
        let mut calls = ToolCallBuilder::default();
        let mut thinking_sent = false;

        loop {
            line_buf.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(provider = %self.provider, "stream cancelled mid-flight");
                    return Err(RunError::cancelled());
                }
                read = buf_reader.read_line(&mut line_buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = line_buf.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break;
                    }
                    let Ok(json) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };

                    if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
                        let input = usage
                            .get("prompt_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0);
                        let output = usage
                            .get("completion_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0);
                        let _ = tx
                            .send(BackendEvent::Usage {
                                input_tokens: input,
                                output_tokens: output,
                                cost_estimate: None,
                            })
                            .await;
                    }

                    let Some(delta) = json
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("delta"))
                    else {
                        continue;
                    };

                    let reasoning = delta
                        .get("reasoning_content")
                        .or_else(|| delta.get("reasoning"))
                        .and_then(|v| v.as_str());
                    if reasoning.is_some() && !thinking_sent {
                        thinking_sent = true;
                        let _ = tx.send(BackendEvent::Thinking).await;
                    }

                    calls.apply(delta);

                    if let Some(piece) = delta.get("content").and_then(|v| v.as_str())
                        && !piece.is_empty()
                    {
                        text.push_str(piece);
                        let _ = tx
                            .send(BackendEvent::TextDelta {
                                text: piece.to_string(),
                            })
                            .await;
                    }
                }
                Err(e) => {
                    return Err(RunError::unavailable(format!("stream read failed: {}", e)));
                }
            }
        }

        Ok((text, calls.finish()))
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn run(
        &self,
        req: BackendRequest,
        tx: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RunError> {
        let mut transcript = self.load_transcript(&req.session).await;

        // The system prompt is rebuilt every run (skills and context
        // change between runs), so refresh slot zero instead of
        // trusting whatever was persisted.
        if transcript.first().map(|m| m.role.as_str()) == Some("system") {
            transcript[0].content = Some(req.system_prompt.clone());
        } else {
            transcript.insert(0, StoredMessage::plain("system", &req.system_prompt));
        }
        transcript.push(StoredMessage::plain("user", &req.prompt));

        let tool_schemas = tools::schemas(&req.tool_permissions);

        let mut rounds = 0;
        let final_text = loop {
            let (text, calls) = self
                .stream_once(&transcript, &tool_schemas, &tx, &cancel)
                .await?;

            if calls.is_empty() {
                break text;
            }

            rounds += 1;
            if rounds >= MAX_TOOL_ROUNDS {
                warn!(provider = %self.provider, rounds, "tool round limit reached");
                break format!("{}\n\n(stopped after {} tool rounds)", text, MAX_TOOL_ROUNDS);
            }

            transcript.push(StoredMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: Some(Value::Array(
                    calls
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "id": c.id,
                                "type": "function",
                                "function": { "name": c.name, "arguments": c.arguments },
                            })
                        })
                        .collect(),
                )),
                tool_call_id: None,
            });

            for call in calls {
                let _ = tx
                    .send(BackendEvent::ToolStarted {
                        tool: call.name.clone(),
                        args_summary: truncate(call.arguments.trim(), 60),
                    })
                    .await;

                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                let (output, ok) = tokio::select! {
                    _ = cancel.cancelled() => return Err(RunError::cancelled()),
                    result = tools::execute(&self.client, &call.name, &args) => result,
                };

                let _ = tx
                    .send(BackendEvent::ToolFinished {
                        tool: call.name.clone(),
                        ok,
                    })
                    .await;
                transcript.push(StoredMessage {
                    role: "tool".to_string(),
                    content: Some(output),
                    tool_calls: None,
                    tool_call_id: Some(call.id),
                });
            }
        };

        transcript.push(StoredMessage::plain("assistant", &final_text));
        let handle = req
            .session
            .clone()
            .unwrap_or_else(|| SessionHandle(Uuid::new_v4().to_string()));
        self.persist_transcript(&handle, transcript).await?;

        let _ = tx
            .send(BackendEvent::Completed {
                final_text,
                session: handle,
            })
            .await;
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}
