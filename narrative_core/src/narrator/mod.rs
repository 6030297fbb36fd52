//! Narrator model interface.
//!
//! A narrator answers a conversation with either narration (delivered as a
//! stream of text chunks) or an ordered list of tool calls.

mod openai;

pub use openai::*;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the narrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, echoed back with the result.
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// One message of the running conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,

    /// Tool calls made by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// For tool messages, the call this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(ChatRole::Assistant, "")
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }
}

/// Stream of narration chunks. An `Err` item ends the narration.
pub type NarrationStream = BoxStream<'static, Result<String, ModelError>>;

/// What the narrator answered.
pub enum NarratorReply {
    Narration(NarrationStream),
    ToolCalls(Vec<ToolCall>),
}

impl NarratorReply {
    /// Narration that is already complete.
    pub fn text(text: impl Into<String>) -> Self {
        NarratorReply::Narration(Box::pin(stream::once(futures::future::ready(Ok(
            text.into(),
        )))))
    }

    /// Narration split into the given chunks.
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<Result<String, ModelError>> =
            chunks.into_iter().map(|c| Ok(c.into())).collect();
        NarratorReply::Narration(Box::pin(stream::iter(items)))
    }
}

impl std::fmt::Debug for NarratorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NarratorReply::Narration(_) => f.write_str("Narration(..)"),
            NarratorReply::ToolCalls(calls) => f.debug_tuple("ToolCalls").field(calls).finish(),
        }
    }
}

/// The narrator model client.
#[async_trait]
pub trait NarratorClient: Send + Sync {
    /// Send the conversation and the available tool descriptions.
    async fn converse(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<NarratorReply, ModelError>;
}
