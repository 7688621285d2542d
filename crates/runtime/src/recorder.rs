//! Default persistence-collaborator hooks.
//!
//! The core persists nothing itself; these implementations log what a
//! real persistence layer would store, so a deployment without one
//! still leaves an audit trail.

use async_trait::async_trait;

use dh_ingest::pipeline::{FileRecord, RunSummary};
use dh_ingest::IngestionRecorder;

/// Recorder that mirrors run summaries into the structured log.
pub struct TracingRecorder;

#[async_trait]
impl IngestionRecorder for TracingRecorder {
    async fn record_run(&self, summary: &RunSummary, files: &[FileRecord]) {
        tracing::info!(
            total_files = summary.total_files,
            total_chunks = summary.total_chunks,
            errors = summary.errors.len(),
            status = ?summary.status,
            started_at = %summary.started_at,
            finished_at = %summary.finished_at,
            "ingestion run recorded"
        );
        for file in files {
            tracing::info!(
                path_hash = %file.path_hash,
                uri = file.uri.as_deref().unwrap_or(""),
                mime = file.mime.as_deref().unwrap_or(""),
                source = %file.source,
                chunks = file.chunks,
                bytes = file.bytes,
                "document recorded"
            );
        }
    }
}
