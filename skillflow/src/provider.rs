//! Injected collaborator interfaces: model providers and tools.
//!
//! The engine never talks to a concrete provider or data source; it is
//! handed a [`ModelProvider`] and a [`ToolRegistry`] at construction
//! time so multiple concurrent runs (e.g. in a server process) cannot
//! interfere through process-wide state.

use crate::errors::EngineError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A chat message in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role ("user", "assistant", "system", "tool").
    pub role: String,
    /// The message content.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Creates a tool-result message.
    #[must_use]
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new("tool", content)
    }
}

/// Token accounting for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the request.
    pub input_tokens: u32,
    /// Tokens produced in the response.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Total tokens in and out.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Sums two usages, saturating.
    #[must_use]
    pub fn add(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// The tool name.
    pub name: String,
    /// Parsed call arguments.
    pub arguments: serde_json::Value,
}

/// Advertised shape of a callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// The tool name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// JSON schema of the accepted arguments.
    pub parameters: serde_json::Value,
}

/// The settled result of one model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelReply {
    /// Final text content.
    pub content: String,
    /// Token accounting.
    pub usage: TokenUsage,
    /// Tool invocations the model requested, if any.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// One request to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// The model id to invoke.
    pub model: String,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Output token cap.
    pub max_tokens: Option<u32>,
    /// Tools offered to the model for this call.
    pub tools: Vec<ToolSpec>,
}

/// Callback invoked with each streamed text chunk as it arrives.
pub type ChunkCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// An opaque "invoke model" capability.
///
/// Implementations adapt one concrete provider; the engine treats the
/// error message text as classification metadata (see
/// [`crate::retry::classify`]).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Invokes the model, reporting streamed text through `on_chunk`
    /// when the caller supplies one.
    async fn invoke(
        &self,
        request: ModelRequest,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<ModelReply, EngineError>;
}

/// A callable tool exposed to task agents.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool name.
    fn name(&self) -> &str;

    /// The advertised spec handed to the model.
    fn spec(&self) -> ToolSpec;

    /// Executes the tool.
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, EngineError>;
}

/// Registry of tools organised into named groups.
///
/// Workflows reference groups, not individual tools; a group is
/// available when at least one of its member tools is registered.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    groups: DashMap<String, Vec<String>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its own name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Declares a named group of tool names.
    pub fn register_group(
        &self,
        group: impl Into<String>,
        members: impl IntoIterator<Item = impl Into<String>>,
    ) {
        self.groups
            .insert(group.into(), members.into_iter().map(Into::into).collect());
    }

    /// Returns true when `name` resolves to at least one registered
    /// tool, either as a group or as a direct tool name.
    #[must_use]
    pub fn is_available(&self, name: &str) -> bool {
        if let Some(members) = self.groups.get(name) {
            return members.iter().any(|m| self.tools.contains_key(m));
        }
        self.tools.contains_key(name)
    }

    /// Resolves group references to the callable tools they contain.
    ///
    /// Unknown groups and unregistered members are silently dropped;
    /// availability is checked separately up front.
    #[must_use]
    pub fn resolve(&self, groups: &[String]) -> HashMap<String, Arc<dyn Tool>> {
        let mut resolved = HashMap::new();
        for group in groups {
            if let Some(members) = self.groups.get(group) {
                for member in members.iter() {
                    if let Some(tool) = self.tools.get(member) {
                        resolved.insert(member.clone(), tool.clone());
                    }
                }
            } else if let Some(tool) = self.tools.get(group) {
                resolved.insert(group.clone(), tool.clone());
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DummyTool(&'static str);

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.0.to_string(),
                description: String::new(),
                parameters: serde_json::json!({}),
            }
        }

        async fn call(
            &self,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, EngineError> {
            Ok(arguments)
        }
    }

    #[test]
    fn test_group_availability() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool("quote")));
        registry.register_group("market_data", ["quote", "ohlcv"]);
        registry.register_group("filings", ["edgar"]);

        assert!(registry.is_available("market_data"));
        assert!(!registry.is_available("filings"));
        assert!(registry.is_available("quote"));
        assert!(!registry.is_available("nonexistent"));
    }

    #[test]
    fn test_resolve_collects_registered_members() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool("quote")));
        registry.register(Arc::new(DummyTool("news_search")));
        registry.register_group("market_data", ["quote", "ohlcv"]);

        let resolved = registry.resolve(&["market_data".to_string(), "news_search".to_string()]);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains_key("quote"));
        assert!(resolved.contains_key("news_search"));
    }

    #[test]
    fn test_token_usage_add() {
        let a = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        };
        let b = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        assert_eq!(a.add(b).total(), 165);
    }
}
