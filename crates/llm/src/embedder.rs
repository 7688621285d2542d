//! Batched embedding generation.
//!
//! Texts are partitioned into batches and embedded concurrently, with a
//! semaphore bounding in-flight requests so the model runtime is not
//! overwhelmed. Input order is preserved.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::ollama::{LlmError, OllamaClient};

const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Backend that turns one text into one vector. The Ollama client is
/// the production implementation; tests substitute their own.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

#[async_trait]
impl EmbeddingBackend for OllamaClientBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.client.embed(text, &self.model).await
    }
}

/// Adapter binding an [`OllamaClient`] to a fixed embedding model.
pub struct OllamaClientBackend {
    client: Arc<OllamaClient>,
    model: String,
}

impl OllamaClientBackend {
    pub fn new(client: Arc<OllamaClient>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

/// Batched embedder over any [`EmbeddingBackend`].
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    semaphore: Arc<Semaphore>,
}

impl Embedder {
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            batch_size: DEFAULT_BATCH_SIZE,
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
        }
    }

    /// Production construction: embeddings via the LLM runtime client.
    pub fn for_ollama(client: Arc<OllamaClient>, embed_model: &str) -> Self {
        Self::new(Arc::new(OllamaClientBackend::new(client, embed_model)))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embed one text.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut embeddings = self.embed_texts(&[text.to_string()]).await?;
        Ok(embeddings.pop().unwrap_or_default())
    }

    /// Embed many texts, preserving input order. Empty input returns
    /// empty output. An empty embedding from the backend is logged but
    /// not an error; the caller sees an empty vector at that position.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let futures = batch.iter().map(|text| {
                let backend = Arc::clone(&self.backend);
                let semaphore = Arc::clone(&self.semaphore);
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| LlmError::Transport("embedder closed".into()))?;
                    let embedding = backend.embed(text).await?;
                    if embedding.is_empty() {
                        tracing::warn!(
                            text_preview = %text.chars().take(100).collect::<String>(),
                            "backend returned an empty embedding"
                        );
                    }
                    Ok::<_, LlmError>(embedding)
                }
            });

            let batch_results = futures_util::future::join_all(futures).await;
            for result in batch_results {
                all.push(result?);
            }
        }

        Ok(all)
    }

    pub async fn close(&self) {
        self.semaphore.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps each text to a vector derived from its length, with a small
    /// random-ish delay so completion order differs from input order.
    struct LengthBackend {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl LengthBackend {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for LengthBackend {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            // Shorter texts finish later, scrambling completion order.
            let delay = 10u64.saturating_sub(text.len() as u64);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32])
        }
    }

    #[tokio::test]
    async fn empty_input_returns_empty_output() {
        let embedder = Embedder::new(Arc::new(LengthBackend::new()));
        let result = embedder.embed_texts(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn preserves_input_order() {
        let embedder = Embedder::new(Arc::new(LengthBackend::new()));
        let texts: Vec<String> = vec!["a".into(), "bbbb".into(), "cc".into(), "ddddddd".into()];
        let result = embedder.embed_texts(&texts).await.unwrap();
        let lengths: Vec<f32> = result.iter().map(|v| v[0]).collect();
        assert_eq!(lengths, vec![1.0, 4.0, 2.0, 7.0]);
    }

    #[tokio::test]
    async fn batches_are_sequential() {
        let backend = Arc::new(LengthBackend::new());
        let embedder = Embedder::new(Arc::clone(&backend) as Arc<dyn EmbeddingBackend>)
            .with_batch_size(2);
        let texts: Vec<String> = (0..6).map(|i| "x".repeat(i + 1)).collect();
        embedder.embed_texts(&texts).await.unwrap();
        // With batch size 2, no more than 2 requests are ever in flight.
        assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn embed_text_returns_single_vector() {
        let embedder = Embedder::new(Arc::new(LengthBackend::new()));
        let vector = embedder.embed_text("hello").await.unwrap();
        assert_eq!(vector, vec![5.0]);
    }

    struct EmptyBackend;

    #[async_trait]
    impl EmbeddingBackend for EmptyBackend {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn empty_embedding_is_not_an_error() {
        let embedder = Embedder::new(Arc::new(EmptyBackend));
        let result = embedder.embed_texts(&["x".into()]).await.unwrap();
        assert_eq!(result, vec![Vec::<f32>::new()]);
    }
}
