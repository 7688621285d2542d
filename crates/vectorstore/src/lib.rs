//! Vector store adapter (Qdrant REST API).
//!
//! Encapsulates collection lifecycle, point upserts, and ACL-filtered
//! search. This adapter is the trust boundary for per-user isolation:
//! when a caller supplies a `user_id`, it is always applied as a
//! server-side filter, never left advisory.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use dh_domain::retry::{retry_with_backoff, RetryPolicy};

/// Errors raised by the vector store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vector store HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("vector store transport error: {0}")]
    Transport(String),

    #[error("vector store protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Http { status, .. } => *status >= 500,
            StoreError::Protocol(_) => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

impl From<StoreError> for dh_domain::Error {
    fn from(e: StoreError) -> Self {
        dh_domain::Error::Http(e.to_string())
    }
}

/// A point destined for the store: id, vector, and the chunk payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A chunk to upsert; the id is synthesized when absent.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// A single search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// QdrantStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thin client over the Qdrant REST API.
pub struct QdrantStore {
    base_url: String,
    embedding_dim: usize,
    default_collection: String,
    client: reqwest::Client,
    /// Collections already verified to exist. Best-effort cache; a
    /// recreated store is re-checked on the next ensure call path.
    ensured: Mutex<HashSet<String>>,
    policy: RetryPolicy,
}

impl QdrantStore {
    pub fn new(
        base_url: &str,
        embedding_dim: usize,
        default_collection: &str,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            embedding_dim,
            default_collection: default_collection.to_string(),
            client,
            ensured: Mutex::new(HashSet::new()),
            policy: RetryPolicy::default(),
        })
    }

    pub fn default_collection(&self) -> &str {
        &self.default_collection
    }

    fn collection<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.unwrap_or(&self.default_collection)
    }

    /// Create the collection if it does not exist, with the configured
    /// vector size and cosine distance.
    pub async fn ensure_collection(&self, name: Option<&str>) -> Result<(), StoreError> {
        let name = self.collection(name);
        if self.ensured.lock().contains(name) {
            return Ok(());
        }

        let existing = self.list_collections().await?;
        if !existing.iter().any(|c| c == name) {
            tracing::info!(collection = name, dim = self.embedding_dim, "creating collection");
            let body = serde_json::json!({
                "vectors": { "size": self.embedding_dim, "distance": "Cosine" }
            });
            let response = self
                .client
                .put(format!("{}/collections/{}", self.base_url, name))
                .json(&body)
                .send()
                .await?;
            Self::check(response).await?;
        }

        self.ensured.lock().insert(name.to_string());
        Ok(())
    }

    /// Upsert chunk records, synthesizing ids where absent.
    /// Returns the number of points written.
    pub async fn upsert_chunks(
        &self,
        chunks: Vec<ChunkRecord>,
        collection: Option<&str>,
    ) -> Result<usize, StoreError> {
        let points: Vec<Point> = chunks.into_iter().map(chunk_to_point).collect();
        self.upsert_points(&points, collection).await
    }

    /// Upsert pre-built points in a single call.
    pub async fn upsert_points(
        &self,
        points: &[Point],
        collection: Option<&str>,
    ) -> Result<usize, StoreError> {
        if points.is_empty() {
            return Ok(0);
        }
        self.ensure_collection(collection).await?;
        let name = self.collection(collection);

        let body = serde_json::json!({ "points": points });
        let url = format!("{}/collections/{}/points?wait=true", self.base_url, name);

        retry_with_backoff(
            self.policy,
            "vectorstore upsert",
            || async {
                let response = self.client.put(&url).json(&body).send().await?;
                Self::check(response).await
            },
            StoreError::is_retryable,
        )
        .await?;

        tracing::info!(count = points.len(), collection = name, "upserted points");
        Ok(points.len())
    }

    /// Semantic search with a conjunctive payload filter: every supplied
    /// tag must match, and a supplied `user_id` is always enforced.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        collection: Option<&str>,
        tags: &[String],
        user_id: Option<i64>,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let name = self.collection(collection);

        let mut body = serde_json::json!({
            "vector": query_embedding,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = build_filter(tags, user_id) {
            body["filter"] = filter;
        }

        let url = format!("{}/collections/{}/points/search", self.base_url, name);
        let value = retry_with_backoff(
            self.policy,
            "vectorstore search",
            || async {
                let response = self.client.post(&url).json(&body).send().await?;
                Self::check(response).await
            },
            StoreError::is_retryable,
        )
        .await?;

        let results = parse_search_response(&value)?;
        tracing::info!(hits = results.len(), collection = name, "search complete");
        Ok(results)
    }

    /// Names of all collections in the store.
    pub async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let response = self
            .client
            .get(format!("{}/collections", self.base_url))
            .send()
            .await?;
        let value = Self::check(response).await?;

        let names = value["result"]["collections"]
            .as_array()
            .map(|collections| {
                collections
                    .iter()
                    .filter_map(|c| c["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    pub async fn close(&self) {}

    async fn check(response: reqwest::Response) -> Result<Value, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pure request/response shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn chunk_to_point(chunk: ChunkRecord) -> Point {
    let id = chunk
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    // Payload is the text plus every metadata field, flattened.
    let mut payload = serde_json::Map::new();
    payload.insert("text".to_string(), Value::String(chunk.text));
    if let Value::Object(metadata) = chunk.metadata {
        for (key, value) in metadata {
            payload.insert(key, value);
        }
    }

    Point {
        id,
        vector: chunk.embedding,
        payload: Value::Object(payload),
    }
}

/// Build the conjunctive `must` filter from tags and user id.
fn build_filter(tags: &[String], user_id: Option<i64>) -> Option<Value> {
    let mut must: Vec<Value> = tags
        .iter()
        .map(|tag| serde_json::json!({ "key": "tags", "match": { "value": tag } }))
        .collect();
    if let Some(user_id) = user_id {
        must.push(serde_json::json!({ "key": "user_id", "match": { "value": user_id } }));
    }
    if must.is_empty() {
        None
    } else {
        Some(serde_json::json!({ "must": must }))
    }
}

fn parse_search_response(value: &Value) -> Result<Vec<SearchResult>, StoreError> {
    let hits = value["result"]
        .as_array()
        .ok_or_else(|| StoreError::Protocol("search response missing result array".into()))?;

    Ok(hits
        .iter()
        .map(|hit| {
            let payload = hit.get("payload").cloned().unwrap_or(Value::Null);
            let text = payload
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let metadata = match payload {
                Value::Object(mut map) => {
                    map.remove("text");
                    Value::Object(map)
                }
                other => other,
            };
            SearchResult {
                id: match &hit["id"] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                text,
                score: hit["score"].as_f64().unwrap_or(0.0) as f32,
                metadata,
            }
        })
        .collect())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_to_point_synthesizes_id() {
        let point = chunk_to_point(ChunkRecord {
            id: None,
            text: "hello".into(),
            embedding: vec![0.1, 0.2],
            metadata: serde_json::json!({"mime": "text/plain"}),
        });
        assert!(!point.id.is_empty());
        assert_eq!(point.payload["text"], "hello");
        assert_eq!(point.payload["mime"], "text/plain");
    }

    #[test]
    fn chunk_to_point_keeps_explicit_id() {
        let point = chunk_to_point(ChunkRecord {
            id: Some("abc".into()),
            text: "t".into(),
            embedding: vec![],
            metadata: serde_json::json!({}),
        });
        assert_eq!(point.id, "abc");
    }

    #[test]
    fn filter_requires_every_tag() {
        let filter = build_filter(&["a".into(), "b".into()], None).unwrap();
        let must = filter["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["key"], "tags");
        assert_eq!(must[0]["match"]["value"], "a");
        assert_eq!(must[1]["match"]["value"], "b");
    }

    #[test]
    fn filter_enforces_user_id() {
        let filter = build_filter(&[], Some(42)).unwrap();
        let must = filter["must"].as_array().unwrap();
        assert_eq!(must.len(), 1);
        assert_eq!(must[0]["key"], "user_id");
        assert_eq!(must[0]["match"]["value"], 42);
    }

    #[test]
    fn no_filter_without_tags_or_user() {
        assert!(build_filter(&[], None).is_none());
    }

    #[test]
    fn parses_search_response() {
        let value = serde_json::json!({
            "result": [
                {
                    "id": "p1",
                    "score": 0.93,
                    "payload": { "text": "chunk text", "mime": "text/plain", "chunk_id": 1 }
                },
                { "id": 7, "score": 0.5, "payload": { "text": "other" } }
            ]
        });
        let results = parse_search_response(&value).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "p1");
        assert_eq!(results[0].text, "chunk text");
        assert!((results[0].score - 0.93).abs() < 1e-6);
        // text is lifted out of the metadata
        assert!(results[0].metadata.get("text").is_none());
        assert_eq!(results[0].metadata["mime"], "text/plain");
        assert_eq!(results[1].id, "7");
    }

    #[test]
    fn malformed_search_response_is_protocol_error() {
        let err = parse_search_response(&serde_json::json!({"status": "ok"})).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }
}
