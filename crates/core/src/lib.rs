//! Core library for Agentbox
//!
//! This crate contains the records the orchestrator works against:
//! - Tasks and their status state machine
//! - Task messages (the append-only transcript)
//! - Environments, credentials and usage records
//! - The persistence interface and a file-backed implementation

pub mod credentials;
pub mod environment;
pub mod error;
pub mod message;
pub mod store;
pub mod task;
pub mod usage;

pub use credentials::{Credentials, GithubIdentity};
pub use environment::{Environment, McpServer, ProviderKind, SubAgent};
pub use error::Error;
pub use message::{MessageRole, MessageType, TaskMessage};
pub use store::{FileStore, TaskStore};
pub use task::{Task, TaskStatus, TaskUpdate};
pub use usage::UsageRecord;

pub type Result<T> = std::result::Result<T, Error>;
