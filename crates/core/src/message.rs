//! Task messages - the append-only transcript of a task

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of the message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Type tag attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain conversational text
    Text,
    /// One rendered agent tool call
    ToolCall,
    /// The plan captured in plan mode
    Plan,
    /// Final result reported by the agent
    Result,
    /// Machine-readable pull request URL
    PrLink,
    /// Non-fatal problem the user should know about
    Warning,
    /// Failure reason
    Error,
}

/// A single transcript entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    pub created_at: DateTime<Utc>,
}

impl TaskMessage {
    fn new(task_id: Uuid, role: MessageRole, content: String, message_type: Option<MessageType>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            role,
            content,
            message_type,
            created_at: Utc::now(),
        }
    }

    /// Create a user message (the prompt)
    pub fn user(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(task_id, MessageRole::User, content.into(), None)
    }

    /// Create an untagged assistant message
    pub fn assistant(task_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(task_id, MessageRole::Assistant, content.into(), None)
    }

    /// Create a tagged assistant message
    pub fn tagged(task_id: Uuid, message_type: MessageType, content: impl Into<String>) -> Self {
        Self::new(task_id, MessageRole::Assistant, content.into(), Some(message_type))
    }

    pub fn is_type(&self, message_type: MessageType) -> bool {
        self.message_type == Some(message_type)
    }
}
