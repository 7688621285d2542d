//! Streaming client for the local LLM runtime: chat completions with
//! thinking traces and tool calling, embeddings, and model lifecycle
//! (existence check + optional auto-pull). Also hosts the batched
//! embedder used by the ingestion pipeline.

pub mod embedder;
pub mod ollama;

use std::pin::Pin;

/// A boxed async stream, used for streaming LLM responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

pub use embedder::{Embedder, EmbeddingBackend};
pub use ollama::{ChatClient, LlmError, OllamaClient, StreamChunk};
