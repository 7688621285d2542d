//! Shared domain types for the Deskhand backend: configuration, the
//! workspace-wide error type, chat/tool wire types, and small utilities
//! (retry with backoff, input sanitization) used by every other crate.

pub mod chat;
pub mod config;
pub mod error;
pub mod retry;

pub use chat::{sanitize_text, ChatMessage, Role, ToolCall, ToolDefinition};
pub use config::Config;
pub use error::{Error, Result};
