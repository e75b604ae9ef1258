//! Test doubles for providers and tools.
//!
//! [`MockProvider`] is a scripted [`ModelProvider`]: pushed replies and
//! errors are consumed in order, and every request seen is recorded for
//! assertions. It backs the integration tests in this crate and is
//! exported for embedding callers' test suites.

use crate::errors::EngineError;
use crate::provider::{
    ChunkCallback, ModelProvider, ModelReply, ModelRequest, TokenUsage, Tool, ToolCall, ToolSpec,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Usage attached to replies that don't specify their own.
const DEFAULT_USAGE: TokenUsage = TokenUsage {
    input_tokens: 100,
    output_tokens: 50,
};

/// Streamed chunk size, in bytes, when a caller asks for streaming.
const CHUNK_BYTES: usize = 8;

enum Scripted {
    Reply(ModelReply),
    Error(String),
}

/// A scripted model provider.
///
/// Replies are consumed front to back; when the script runs dry every
/// further call gets a fixed default reply, so tests only script what
/// they assert on.
#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ModelRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("scripted", &self.script.lock().len())
            .field("requests", &self.requests.lock().len())
            .finish()
    }
}

impl MockProvider {
    /// Creates a provider with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call sleep for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Queues a plain text reply with default usage.
    pub fn push_text(&self, content: impl Into<String>) {
        self.push_reply(ModelReply {
            content: content.into(),
            usage: DEFAULT_USAGE,
            tool_calls: Vec::new(),
        });
    }

    /// Queues a full reply.
    pub fn push_reply(&self, reply: ModelReply) {
        self.script.lock().push_back(Scripted::Reply(reply));
    }

    /// Queues a reply that requests one tool call.
    pub fn push_tool_call(&self, tool: impl Into<String>, arguments: serde_json::Value) {
        let tool = tool.into();
        self.push_reply(ModelReply {
            content: String::new(),
            usage: DEFAULT_USAGE,
            tool_calls: vec![ToolCall {
                id: format!("call-{tool}"),
                name: tool,
                arguments,
            }],
        });
    }

    /// Queues an error; the message text drives retry classification.
    pub fn push_error(&self, message: impl Into<String>) {
        self.script.lock().push_back(Scripted::Error(message.into()));
    }

    /// Every request seen so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn invoke(
        &self,
        request: ModelRequest,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<ModelReply, EngineError> {
        self.requests.lock().push(request);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().pop_front();
        let reply = match next {
            Some(Scripted::Reply(reply)) => reply,
            Some(Scripted::Error(message)) => return Err(EngineError::Model(message)),
            None => ModelReply {
                content: "mock reply".to_string(),
                usage: DEFAULT_USAGE,
                tool_calls: Vec::new(),
            },
        };

        if let Some(on_chunk) = on_chunk {
            if reply.tool_calls.is_empty() {
                for chunk in chunks(&reply.content) {
                    on_chunk(chunk);
                }
            }
        }
        Ok(reply)
    }
}

/// Splits text into small chunks on char boundaries.
fn chunks(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut len = 0;
    for (i, c) in text.char_indices() {
        len += c.len_utf8();
        if len >= CHUNK_BYTES {
            out.push(&text[start..i + c.len_utf8()]);
            start = i + c.len_utf8();
            len = 0;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// A tool that returns its arguments unchanged.
#[derive(Debug, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "echo".to_string(),
            description: "Returns its arguments unchanged".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "additionalProperties": true
            }),
        }
    }

    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, EngineError> {
        Ok(arguments)
    }
}

/// A tool that always fails, for exercising tool-error paths.
#[derive(Debug)]
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    /// Creates a failing tool.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: "Always fails".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    async fn call(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, EngineError> {
        Err(EngineError::Tool {
            name: self.name.clone(),
            reason: self.message.clone(),
        })
    }
}
