//! Data model for the ingestion pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where an ingested item came from; determines the parser family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Web,
    Audio,
    Video,
    Image,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Web => "web",
            SourceKind::Audio => "audio",
            SourceKind::Video => "video",
            SourceKind::Image => "image",
        }
    }

    /// Classify by MIME; `from_web` overrides document-like inputs.
    pub fn determine(mime: Option<&str>, from_web: bool) -> Self {
        let mime = mime.unwrap_or_default().to_ascii_lowercase();
        if mime.starts_with("audio/") {
            SourceKind::Audio
        } else if mime.starts_with("video/") {
            SourceKind::Video
        } else if mime.starts_with("image/") {
            SourceKind::Image
        } else if from_web {
            SourceKind::Web
        } else {
            SourceKind::File
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical chunk of document text destined for embedding.
#[derive(Debug, Clone)]
pub struct DocChunk {
    /// Stable unique id.
    pub id: String,
    /// Monotone position within the document.
    pub chunk_id: u32,
    pub text: String,
    pub uri: Option<String>,
    pub mime: Option<String>,
    pub source: SourceKind,
    pub metadata: Map<String, Value>,
    pub embedding: Option<Vec<f32>>,
}

impl DocChunk {
    pub fn new(
        chunk_id: u32,
        text: impl Into<String>,
        uri: Option<&str>,
        mime: Option<&str>,
        source: SourceKind,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            chunk_id,
            text: text.into(),
            uri: uri.map(str::to_string),
            mime: mime.map(str::to_string),
            source,
            metadata,
            embedding: None,
        }
    }
}

/// A file or fetched resource queued for ingestion.
#[derive(Debug, Clone)]
pub struct IngestionItem {
    pub path: PathBuf,
    pub uri: Option<String>,
    pub mime: Option<String>,
    pub bytes_size: u64,
}

/// Per-file entry in the ingestion report.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    pub uri: Option<String>,
    pub mime: Option<String>,
    pub chunks: usize,
    pub size_bytes: u64,
}

/// One failure recorded during a run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionError {
    pub target: String,
    pub error: String,
}

/// Summary of an ingestion run.
#[derive(Debug, Clone, Serialize, Default)]
pub struct IngestionReport {
    pub total_files: usize,
    pub total_chunks: usize,
    pub files: Vec<FileReport>,
    pub errors: Vec<IngestionError>,
}

/// Errors raised while parsing, embedding, or upserting.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse: {0}")]
    Parse(String),

    #[error("engine: {0}")]
    Engine(String),

    #[error("fetch: {0}")]
    Fetch(String),

    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("embedding: {0}")]
    Embedding(String),

    #[error("vector store: {0}")]
    Store(String),
}
