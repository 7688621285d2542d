//! Ingestion orchestration: enumerate → parse → chunk → embed → upsert,
//! with bounded concurrency and a deterministic report.
//!
//! Per-item work may overlap, but results are re-sorted by item index
//! before the (single) upsert call so reports and point batches preserve
//! input order regardless of completion order.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use dh_domain::config::IngestConfig;
use dh_vectorstore::Point;

use crate::builder::ChunkBuilder;
use crate::metadata::{collect_artifacts, prune_metadata, MAX_METADATA_BYTES};
use crate::models::{
    DocChunk, FileReport, IngestError, IngestionError, IngestionItem, IngestionReport, SourceKind,
};
use crate::parsers::{document, ocr, tabular, DocItem, PageFetcher, ParserSet};

/// Hard ceiling on per-run concurrency regardless of configuration.
const MAX_CONCURRENCY: usize = 18;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborator contracts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Embedding surface the pipeline drives (production: the batched
/// embedder over the LLM runtime).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError>;
}

#[async_trait]
impl EmbeddingProvider for dh_llm::Embedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        dh_llm::Embedder::embed_texts(self, texts)
            .await
            .map_err(|e| IngestError::Embedding(e.to_string()))
    }
}

/// Vector-store surface the pipeline drives.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, name: Option<&str>) -> Result<(), IngestError>;
    async fn upsert_points(
        &self,
        points: &[Point],
        collection: Option<&str>,
    ) -> Result<usize, IngestError>;
}

#[async_trait]
impl VectorIndex for dh_vectorstore::QdrantStore {
    async fn ensure_collection(&self, name: Option<&str>) -> Result<(), IngestError> {
        dh_vectorstore::QdrantStore::ensure_collection(self, name)
            .await
            .map_err(|e| IngestError::Store(e.to_string()))
    }

    async fn upsert_points(
        &self,
        points: &[Point],
        collection: Option<&str>,
    ) -> Result<usize, IngestError> {
        dh_vectorstore::QdrantStore::upsert_points(self, points, collection)
            .await
            .map_err(|e| IngestError::Store(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
}

/// Run summary handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_files: usize,
    pub total_chunks: usize,
    pub errors: Vec<IngestionError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
}

/// Per-file record handed to the persistence collaborator; `path_hash`
/// is the stable key a document row is upserted under.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub path_hash: String,
    pub uri: Option<String>,
    pub path: String,
    pub mime: Option<String>,
    pub bytes: u64,
    pub source: SourceKind,
    pub tags: Vec<String>,
    pub collection: Option<String>,
    pub chunks: usize,
    pub artifact_summary: Value,
}

/// Persistence collaborator contract. The core persists nothing itself.
#[async_trait]
pub trait IngestionRecorder: Send + Sync {
    async fn record_run(&self, summary: &RunSummary, files: &[FileRecord]);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub recursive: bool,
    pub from_web: bool,
    pub tags: Vec<String>,
    pub user_id: Option<i64>,
    pub collection: Option<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            from_web: false,
            tags: Vec::new(),
            user_id: None,
            collection: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct IngestionPipeline {
    config: IngestConfig,
    parsers: Arc<ParserSet>,
    fetcher: Arc<dyn PageFetcher>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    recorder: Option<Arc<dyn IngestionRecorder>>,
    active_ingestions: AtomicUsize,
}

/// Outcome of one item's processing, collected in completion order.
struct ItemOutcome {
    index: usize,
    item: IngestionItem,
    points: Vec<Point>,
    chunk_count: usize,
    path_hash: String,
    source: SourceKind,
    artifact_summary: Value,
    error: Option<String>,
}

impl IngestionPipeline {
    pub fn new(
        config: IngestConfig,
        parsers: Arc<ParserSet>,
        fetcher: Arc<dyn PageFetcher>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        recorder: Option<Arc<dyn IngestionRecorder>>,
    ) -> Self {
        Self {
            config,
            parsers,
            fetcher,
            embedder,
            index,
            recorder,
            active_ingestions: AtomicUsize::new(0),
        }
    }

    /// Ingest a local path or a URL.
    ///
    /// A local file becomes one item; a directory its children (full
    /// walk when `recursive`); a URL is fetched and materialized into a
    /// run-scoped temp directory. Enumeration failure aborts the run;
    /// per-item failures are recorded and the run continues.
    pub async fn ingest_path(&self, target: &str, options: IngestOptions) -> IngestionReport {
        let started_at = Utc::now();
        self.active_ingestions.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard { pipeline: self };

        if let Err(e) = self
            .index
            .ensure_collection(options.collection.as_deref())
            .await
        {
            tracing::error!(target, error = %e, "collection setup failed");
            return self
                .finish_run(
                    started_at,
                    IngestionReport {
                        errors: vec![IngestionError {
                            target: target.to_string(),
                            error: e.to_string(),
                        }],
                        ..Default::default()
                    },
                    Vec::new(),
                )
                .await;
        }

        // `_web_dir` keeps the materialized fetch alive for the whole run;
        // the directory is removed when it drops.
        let (items, _web_dir) = if options.from_web {
            match self.fetch_web_resources(target).await {
                Ok((items, dir)) => (items, Some(dir)),
                Err(e) => {
                    tracing::error!(target, error = %e, "web enumeration failed");
                    return self
                        .finish_run(
                            started_at,
                            IngestionReport {
                                errors: vec![IngestionError {
                                    target: target.to_string(),
                                    error: e.to_string(),
                                }],
                                ..Default::default()
                            },
                            Vec::new(),
                        )
                        .await;
                }
            }
        } else {
            match enumerate_local(Path::new(target), options.recursive) {
                Ok(items) => (items, None),
                Err(e) => {
                    tracing::error!(target, error = %e, "enumeration failed");
                    return self
                        .finish_run(
                            started_at,
                            IngestionReport {
                                errors: vec![IngestionError {
                                    target: target.to_string(),
                                    error: e.to_string(),
                                }],
                                ..Default::default()
                            },
                            Vec::new(),
                        )
                        .await;
                }
            }
        };

        if items.is_empty() {
            return self
                .finish_run(started_at, IngestionReport::default(), Vec::new())
                .await;
        }

        // Semaphore-bounded fan-out; results arrive in completion order.
        let concurrency = self.effective_concurrency();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        tracing::info!(items = items.len(), concurrency, "ingestion fan-out starting");

        let mut in_flight: FuturesUnordered<_> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let semaphore = Arc::clone(&semaphore);
                let options = &options;
                async move {
                    let _permit = semaphore.acquire().await;
                    self.process_item_outcome(index, item, options).await
                }
            })
            .collect();

        let mut outcomes = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            outcomes.push(outcome);
        }
        drop(in_flight);
        // Deterministic output: re-sort by input order.
        outcomes.sort_by_key(|outcome| outcome.index);

        let mut report = IngestionReport::default();
        let mut points_batch: Vec<Point> = Vec::new();
        let mut file_records: Vec<FileRecord> = Vec::new();

        for outcome in outcomes {
            if let Some(error) = outcome.error {
                report.errors.push(IngestionError {
                    target: outcome.item.path.display().to_string(),
                    error,
                });
                continue;
            }

            points_batch.extend(outcome.points);
            report.total_chunks += outcome.chunk_count;
            report.files.push(FileReport {
                path: outcome.item.path.display().to_string(),
                uri: outcome.item.uri.clone(),
                mime: outcome.item.mime.clone(),
                chunks: outcome.chunk_count,
                size_bytes: outcome.item.bytes_size,
            });
            file_records.push(FileRecord {
                path_hash: outcome.path_hash,
                uri: outcome.item.uri.clone(),
                path: outcome.item.path.display().to_string(),
                mime: outcome.item.mime.clone(),
                bytes: outcome.item.bytes_size,
                source: outcome.source,
                tags: options.tags.clone(),
                collection: options.collection.clone(),
                chunks: outcome.chunk_count,
                artifact_summary: outcome.artifact_summary,
            });
        }
        report.total_files = report.files.len();

        if !points_batch.is_empty() {
            if let Err(e) = self
                .index
                .upsert_points(&points_batch, options.collection.as_deref())
                .await
            {
                tracing::error!(error = %e, "point upsert failed");
                report.errors.push(IngestionError {
                    target: target.to_string(),
                    error: e.to_string(),
                });
            }
        }

        self.finish_run(started_at, report, file_records).await
    }

    /// Record the run with the persistence collaborator and return the
    /// report.
    async fn finish_run(
        &self,
        started_at: DateTime<Utc>,
        report: IngestionReport,
        files: Vec<FileRecord>,
    ) -> IngestionReport {
        let status = if report.errors.is_empty() {
            RunStatus::Success
        } else if report.files.is_empty() {
            RunStatus::Error
        } else {
            RunStatus::Partial
        };

        if let Some(recorder) = &self.recorder {
            let summary = RunSummary {
                total_files: report.total_files,
                total_chunks: report.total_chunks,
                errors: report.errors.clone(),
                started_at,
                finished_at: Utc::now(),
                status,
            };
            recorder.record_run(&summary, &files).await;
        }

        tracing::info!(
            files = report.total_files,
            chunks = report.total_chunks,
            errors = report.errors.len(),
            status = ?status,
            "ingestion run finished"
        );
        report
    }

    async fn process_item_outcome(
        &self,
        index: usize,
        item: IngestionItem,
        options: &IngestOptions,
    ) -> ItemOutcome {
        let source = SourceKind::determine(item.mime.as_deref(), options.from_web);
        let path_hash = path_hash(&item);

        match self.process_item(&item, source, &path_hash, options).await {
            Ok((points, chunk_count, artifact_summary)) => ItemOutcome {
                index,
                item,
                points,
                chunk_count,
                path_hash,
                source,
                artifact_summary,
                error: None,
            },
            Err(e) => {
                tracing::error!(path = %item.path.display(), error = %e, "item processing failed");
                ItemOutcome {
                    index,
                    item,
                    points: Vec::new(),
                    chunk_count: 0,
                    path_hash,
                    source,
                    artifact_summary: Value::Null,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Parse, chunk, embed, and shape one item into vector-store points.
    async fn process_item(
        &self,
        item: &IngestionItem,
        source: SourceKind,
        path_hash: &str,
        options: &IngestOptions,
    ) -> Result<(Vec<Point>, usize, Value), IngestError> {
        let raw_chunks = self.parse_item(item, source).await?;
        let artifact_summary = collect_artifacts(&raw_chunks);

        let builder = ChunkBuilder::new(self.config.chunk_size, self.config.chunk_overlap);
        let mut prepared =
            builder.prepare(raw_chunks, item, source, path_hash, options.user_id);
        if prepared.is_empty() {
            return Ok((Vec::new(), 0, artifact_summary));
        }

        // Every chunk carries the document-level artifact counts.
        if let Some(counts) = artifact_summary.get("counts") {
            for chunk in &mut prepared {
                chunk
                    .metadata
                    .insert("artifact_summary".to_string(), counts.clone());
            }
        }

        let texts: Vec<String> = prepared.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self.embedder.embed_texts(&texts).await?;
        if vectors.len() != prepared.len() {
            return Err(IngestError::Embedding(format!(
                "embedding count mismatch: {} texts, {} vectors",
                prepared.len(),
                vectors.len()
            )));
        }

        let created_at = Utc::now().to_rfc3339();
        let chunk_count = prepared.len();
        let mut points = Vec::with_capacity(chunk_count);

        for (mut chunk, vector) in prepared.into_iter().zip(vectors) {
            // Union of run-supplied tags and any tags the chunk carries.
            let mut tags: std::collections::BTreeSet<String> =
                options.tags.iter().cloned().collect();
            if let Some(Value::Array(chunk_tags)) = chunk.metadata.remove("tags") {
                tags.extend(
                    chunk_tags
                        .into_iter()
                        .filter_map(|tag| tag.as_str().map(str::to_string)),
                );
            }

            let pruned = prune_metadata(&chunk.metadata, MAX_METADATA_BYTES);

            let mut payload = serde_json::Map::new();
            payload.insert("id".into(), Value::String(chunk.id.clone()));
            payload.insert("chunk_id".into(), (chunk.chunk_id as u64).into());
            payload.insert("source".into(), Value::String(chunk.source.to_string()));
            payload.insert(
                "uri".into(),
                chunk
                    .uri
                    .take()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            payload.insert(
                "mime".into(),
                chunk
                    .mime
                    .take()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            payload.insert("path_hash".into(), Value::String(path_hash.to_string()));
            payload.insert("created_at".into(), Value::String(created_at.clone()));
            payload.insert("text".into(), Value::String(chunk.text.clone()));
            payload.insert("metadata".into(), Value::Object(pruned));
            if !tags.is_empty() {
                payload.insert(
                    "tags".into(),
                    Value::Array(tags.into_iter().map(Value::String).collect()),
                );
            }

            points.push(Point {
                id: chunk.id,
                vector,
                payload: Value::Object(payload),
            });
        }

        Ok((points, chunk_count, artifact_summary))
    }

    /// Dispatch to the parser family for this source kind, with the
    /// fallback ladder for documents.
    async fn parse_item(
        &self,
        item: &IngestionItem,
        source: SourceKind,
    ) -> Result<Vec<DocChunk>, IngestError> {
        let uri = item.uri.as_deref();
        let mime = item.mime.as_deref();

        match source {
            SourceKind::Audio | SourceKind::Video => {
                let Some(transcriber) = &self.parsers.transcriber else {
                    return Err(IngestError::Engine(
                        "transcription engine is not configured".into(),
                    ));
                };
                transcriber
                    .transcribe_media(&item.path, uri, mime, source)
                    .await
            }
            SourceKind::Image => {
                ocr::extract(self.parsers.ocr.as_ref(), &item.path, uri, mime, source).await
            }
            SourceKind::File | SourceKind::Web => {
                let mut chunks = match self.parsers.document.extract(&item.path, mime).await {
                    Ok(items) => items_to_chunks(items, uri, mime, source),
                    Err(e) => {
                        tracing::warn!(path = %item.path.display(), error = %e, "structured extraction failed");
                        Vec::new()
                    }
                };

                // OCR only for scanned PDFs (no textual output above).
                if ocr::should_run_ocr(mime, &chunks) {
                    match ocr::extract(self.parsers.ocr.as_ref(), &item.path, uri, mime, source)
                        .await
                    {
                        Ok(ocr_chunks) => chunks.extend(ocr_chunks),
                        Err(e) => {
                            tracing::warn!(path = %item.path.display(), error = %e, "OCR fallback failed");
                        }
                    }
                }

                if chunks.is_empty() {
                    let fallback = if tabular::looks_tabular(&item.path, mime) {
                        tabular::extract(&item.path, mime).await?
                    } else {
                        document::fallback_decode(&item.path).await?
                    };
                    chunks = items_to_chunks(fallback, uri, mime, source);
                }

                Ok(chunks)
            }
        }
    }

    // ── Enumeration ────────────────────────────────────────────────

    /// Fetch a URL and materialize pages + embedded assets as local
    /// items under a run-scoped temp directory.
    async fn fetch_web_resources(
        &self,
        url: &str,
    ) -> Result<(Vec<IngestionItem>, tempfile::TempDir), IngestError> {
        let result = self.fetcher.fetch(url).await?;
        let dir = tempfile::Builder::new().prefix("ingest-web-").tempdir()?;

        let mut items = Vec::new();
        for (idx, page) in result.pages.iter().enumerate() {
            if page.html.is_empty() {
                continue;
            }
            let target = dir.path().join(format!("page-{idx}.html"));
            tokio::fs::write(&target, &page.html).await?;
            let bytes_size = page.html.len() as u64;
            items.push(IngestionItem {
                path: target,
                uri: Some(page.url.clone()),
                mime: Some("text/html".to_string()),
                bytes_size,
            });
        }

        for (idx, asset) in result.assets.iter().enumerate() {
            let filename = asset_filename(&asset.url, asset.mime.as_deref(), idx);
            let target = dir.path().join(filename);
            tokio::fs::write(&target, &asset.bytes).await?;
            items.push(IngestionItem {
                path: target,
                uri: Some(asset.url.clone()),
                mime: asset.mime.clone(),
                bytes_size: asset.bytes.len() as u64,
            });
        }

        Ok((items, dir))
    }

    fn effective_concurrency(&self) -> usize {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.config
            .max_concurrency
            .max(1)
            .min(cpu_count)
            .min(MAX_CONCURRENCY)
    }
}

/// Decrements the active-run counter; the last run out releases
/// media-engine resources.
struct ActiveGuard<'a> {
    pipeline: &'a IngestionPipeline,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let previous = self
            .pipeline
            .active_ingestions
            .fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.pipeline.parsers.release_resources();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn items_to_chunks(
    items: Vec<DocItem>,
    uri: Option<&str>,
    mime: Option<&str>,
    source: SourceKind,
) -> Vec<DocChunk> {
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            DocChunk::new(idx as u32 + 1, item.text, uri, mime, source, item.metadata)
        })
        .collect()
}

/// Stable document key: SHA-256 of the URI (preferred) or path.
pub fn path_hash(item: &IngestionItem) -> String {
    let basis = item
        .uri
        .clone()
        .unwrap_or_else(|| item.path.display().to_string());
    hex::encode(Sha256::digest(basis.as_bytes()))
}

/// Enumerate local items: a file, a directory's children, or a full
/// walk. Entries are sorted so report order is stable.
fn enumerate_local(path: &Path, recursive: bool) -> Result<Vec<IngestionItem>, IngestError> {
    if !path.exists() {
        return Err(IngestError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such path: {}", path.display()),
        )));
    }

    if path.is_file() {
        return Ok(vec![make_item(path)?]);
    }

    let mut files: Vec<std::path::PathBuf> = if recursive {
        walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_file() => Some(entry.into_path()),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    None
                }
            })
            .collect()
    } else {
        std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect()
    };
    files.sort();

    let mut items = Vec::with_capacity(files.len());
    for file in files {
        match make_item(&file) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "skipping unreadable file");
            }
        }
    }
    Ok(items)
}

fn make_item(path: &Path) -> Result<IngestionItem, IngestError> {
    let metadata = std::fs::metadata(path)?;
    let mime = mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string());
    let uri = url::Url::from_file_path(path)
        .map(|u| u.to_string())
        .ok();
    Ok(IngestionItem {
        path: path.to_path_buf(),
        uri,
        mime,
        bytes_size: metadata.len(),
    })
}

fn asset_filename(url: &str, mime: Option<&str>, idx: usize) -> String {
    let from_url = url::Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|segments| segments.last().map(str::to_string))
            .filter(|name| !name.is_empty() && name.len() < 128)
    });
    if let Some(name) = from_url {
        // Prefix with the index so two assets with the same basename
        // cannot clobber each other.
        return format!("asset-{idx}-{name}");
    }

    let extension = mime
        .and_then(|m| mime_guess::get_mime_extensions_str(m))
        .and_then(|exts| exts.first())
        .copied()
        .unwrap_or("bin");
    format!("asset-{idx}.{extension}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::{
        BuiltinDocumentModel, FetchedAsset, FetchedPage, OcrEngine, WebFetchResult,
    };
    use parking_lot::Mutex;

    struct MockOcr;

    #[async_trait]
    impl OcrEngine for MockOcr {
        async fn image_to_text(&self, _png: &[u8], _config: &str) -> Result<String, IngestError> {
            Ok("text read from image".into())
        }
    }

    /// Embeds by text length; fails on texts containing "FAIL".
    struct MockEmbedder;

    #[async_trait]
    impl EmbeddingProvider for MockEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
            if texts.iter().any(|t| t.contains("FAIL")) {
                return Err(IngestError::Embedding("backend rejected text".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[derive(Default)]
    struct MockIndex {
        upserts: Mutex<Vec<Vec<Point>>>,
        collections: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl VectorIndex for MockIndex {
        async fn ensure_collection(&self, name: Option<&str>) -> Result<(), IngestError> {
            self.collections.lock().push(name.map(str::to_string));
            Ok(())
        }

        async fn upsert_points(
            &self,
            points: &[Point],
            _collection: Option<&str>,
        ) -> Result<usize, IngestError> {
            self.upserts.lock().push(points.to_vec());
            Ok(points.len())
        }
    }

    #[derive(Default)]
    struct MockRecorder {
        runs: Mutex<Vec<(RunSummary, Vec<FileRecord>)>>,
    }

    #[async_trait]
    impl IngestionRecorder for MockRecorder {
        async fn record_run(&self, summary: &RunSummary, files: &[FileRecord]) {
            self.runs.lock().push((summary.clone(), files.to_vec()));
        }
    }

    struct MockFetcher;

    #[async_trait]
    impl PageFetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> Result<WebFetchResult, IngestError> {
            let mut png = Vec::new();
            image::DynamicImage::new_rgb8(4, 4)
                .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
                .unwrap();
            Ok(WebFetchResult {
                pages: vec![FetchedPage {
                    url: url.to_string(),
                    html: "<html><body><p>page body text</p></body></html>".into(),
                }],
                assets: vec![FetchedAsset {
                    url: format!("{url}/files/chart.png"),
                    bytes: png,
                    mime: Some("image/png".into()),
                }],
            })
        }
    }

    struct Harness {
        pipeline: IngestionPipeline,
        index: Arc<MockIndex>,
        recorder: Arc<MockRecorder>,
    }

    fn harness() -> Harness {
        let index = Arc::new(MockIndex::default());
        let recorder = Arc::new(MockRecorder::default());
        let parsers = Arc::new(ParserSet {
            document: Arc::new(BuiltinDocumentModel),
            ocr: Arc::new(MockOcr),
            transcriber: None,
        });
        let pipeline = IngestionPipeline::new(
            IngestConfig {
                max_concurrency: 3,
                chunk_size: 100,
                chunk_overlap: 10,
                ..Default::default()
            },
            parsers,
            Arc::new(MockFetcher),
            Arc::new(MockEmbedder),
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            Some(Arc::clone(&recorder) as Arc<dyn IngestionRecorder>),
        );
        Harness {
            pipeline,
            index,
            recorder,
        }
    }

    #[tokio::test]
    async fn directory_report_preserves_input_order() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [
            ("a.txt", "alpha document body"),
            ("b.csv", "col1,col2\n1,2"),
            ("c.md", "# Heading\n\ngamma text"),
        ] {
            std::fs::write(dir.path().join(name), content).unwrap();
        }

        let report = h
            .pipeline
            .ingest_path(dir.path().to_str().unwrap(), IngestOptions::default())
            .await;

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.total_files, 3);
        let names: Vec<String> = report
            .files
            .iter()
            .map(|f| Path::new(&f.path).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.csv", "c.md"]);
        assert_eq!(
            report.total_chunks,
            report.files.iter().map(|f| f.chunks).sum::<usize>()
        );

        // One single upsert call for the whole batch.
        let upserts = h.index.upserts.lock();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].len(), report.total_chunks);
    }

    #[tokio::test]
    async fn per_item_failure_marks_run_partial() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.txt"), "fine content").unwrap();
        std::fs::write(dir.path().join("poison.txt"), "this will FAIL embedding").unwrap();

        let report = h
            .pipeline
            .ingest_path(dir.path().to_str().unwrap(), IngestOptions::default())
            .await;

        assert_eq!(report.total_files, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].target.contains("poison.txt"));

        let runs = h.recorder.runs.lock();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0.status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn enumeration_failure_aborts_run() {
        let h = harness();
        let report = h
            .pipeline
            .ingest_path("/definitely/not/a/path", IngestOptions::default())
            .await;

        assert_eq!(report.total_files, 0);
        assert_eq!(report.errors.len(), 1);
        let runs = h.recorder.runs.lock();
        assert_eq!(runs[0].0.status, RunStatus::Error);
        // Nothing was upserted.
        assert!(h.index.upserts.lock().is_empty());
    }

    #[tokio::test]
    async fn payload_carries_identity_tags_and_user() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.txt"), "tagged content body").unwrap();

        let report = h
            .pipeline
            .ingest_path(
                dir.path().to_str().unwrap(),
                IngestOptions {
                    tags: vec!["finance".into(), "2026".into()],
                    user_id: Some(42),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(report.total_chunks, 1);

        let upserts = h.index.upserts.lock();
        let payload = &upserts[0][0].payload;
        assert_eq!(payload["source"], "file");
        assert_eq!(payload["chunk_id"], 1);
        assert!(payload["uri"].as_str().unwrap().starts_with("file://"));
        assert!(payload["path_hash"].as_str().unwrap().len() == 64);
        assert!(payload["created_at"].as_str().is_some());
        assert_eq!(payload["metadata"]["user_id"], 42);
        let tags: Vec<&str> = payload["tags"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t.as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["2026", "finance"]);
    }

    #[tokio::test]
    async fn web_ingest_materializes_pages_and_assets() {
        let h = harness();
        let report = h
            .pipeline
            .ingest_path(
                "https://example.com",
                IngestOptions {
                    from_web: true,
                    ..Default::default()
                },
            )
            .await;

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.total_files, 2);
        assert_eq!(report.files[0].uri.as_deref(), Some("https://example.com"));
        assert_eq!(report.files[0].mime.as_deref(), Some("text/html"));
        assert_eq!(
            report.files[1].uri.as_deref(),
            Some("https://example.com/files/chart.png")
        );

        let upserts = h.index.upserts.lock();
        let sources: Vec<&str> = upserts[0]
            .iter()
            .map(|p| p.payload["source"].as_str().unwrap())
            .collect();
        assert!(sources.contains(&"web"));
        assert!(sources.contains(&"image"));
    }

    #[tokio::test]
    async fn empty_directory_is_a_successful_noop() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let report = h
            .pipeline
            .ingest_path(dir.path().to_str().unwrap(), IngestOptions::default())
            .await;
        assert_eq!(report.total_files, 0);
        assert!(report.errors.is_empty());
        assert_eq!(h.recorder.runs.lock()[0].0.status, RunStatus::Success);
    }

    #[test]
    fn path_hash_prefers_uri() {
        let with_uri = IngestionItem {
            path: "/tmp/x".into(),
            uri: Some("https://example.com/doc".into()),
            mime: None,
            bytes_size: 0,
        };
        let hash = path_hash(&with_uri);
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            hex::encode(Sha256::digest("https://example.com/doc".as_bytes()))
        );

        let without_uri = IngestionItem {
            path: "/tmp/x".into(),
            uri: None,
            mime: None,
            bytes_size: 0,
        };
        assert_eq!(
            path_hash(&without_uri),
            hex::encode(Sha256::digest("/tmp/x".as_bytes()))
        );
    }

    #[test]
    fn asset_filenames_are_unique_and_named() {
        assert_eq!(
            asset_filename("https://e.com/files/chart.png", Some("image/png"), 0),
            "asset-0-chart.png"
        );
        let fallback = asset_filename("not a url", Some("image/png"), 3);
        assert!(fallback.starts_with("asset-3."));
    }
}
