//! Conversational agent abstraction.
//!
//! The [`AgentClient`] trait decouples phase execution from the actual agent
//! backend and its wire protocol. Calls block until the agent answers. Tests
//! use scripted clients that return predetermined responses.

use anyhow::Result;

use crate::core::types::{AgentResponse, ConversationId, Message, ToolChoice, ToolSpec};

/// Client for a stateful conversation with the coding agent.
///
/// Implementations own any timeout or retry policy for their transport; the
/// engine treats every error as a failure of the current phase.
pub trait AgentClient {
    /// Open a new conversation with a system prompt and tool allow-list.
    fn create_conversation(&self, system_prompt: &str, tools: &[ToolSpec])
    -> Result<ConversationId>;

    /// Replace the tool allow-list of an existing conversation.
    fn update_tools(&self, conversation: &ConversationId, tools: &[ToolSpec]) -> Result<()>;

    /// Send a prompt or tool results and wait for the agent's next turn.
    fn send_message(
        &self,
        conversation: &ConversationId,
        message: Message,
        tool_choice: &ToolChoice,
    ) -> Result<AgentResponse>;
}
