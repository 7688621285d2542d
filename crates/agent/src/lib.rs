//! Agent loop: drives the LLM through interleaved
//! "reason → call one tool → observe → continue" turns, streaming
//! events to the caller and enforcing that at most one tool is invoked
//! per assistant message.

pub mod events;
pub mod sse;
pub mod stepper;

pub use events::{AgentEvent, DoneMetadata, DoneStatus, LogLevel, ToolStatus};
pub use stepper::{AgentLoop, AgentTurnResult};
