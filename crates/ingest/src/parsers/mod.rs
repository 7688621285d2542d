//! Per-format extractors.
//!
//! Selection is keyed off MIME type: audio/video transcribe, images go
//! through OCR, everything else through the structured document model
//! with OCR and tabular fallbacks. Engines (speech, OCR) sit behind
//! traits so deployments can swap implementations and tests can run
//! without external binaries.

pub mod document;
pub mod media;
pub mod ocr;
pub mod tabular;
pub mod web;

use std::sync::Arc;

pub use document::{BuiltinDocumentModel, DocItem, DocumentModel};
pub use media::{SpeechSegment, SpeechToText, Transcriber, Transcription, WhisperEndpoint};
pub use ocr::{should_run_ocr, OcrEngine, TesseractCli};
pub use web::{FetchedAsset, FetchedPage, HttpFetcher, PageFetcher, WebFetchResult};

/// The engines one pipeline instance parses with. Owned by the server
/// startup path and released explicitly when the last ingestion ends.
pub struct ParserSet {
    pub document: Arc<dyn DocumentModel>,
    pub ocr: Arc<dyn OcrEngine>,
    pub transcriber: Option<Arc<Transcriber>>,
}

impl ParserSet {
    /// Free engine-held resources (loaded models, scratch buffers).
    pub fn release_resources(&self) {
        if let Some(transcriber) = &self.transcriber {
            transcriber.release();
        }
        tracing::debug!("parser engine resources released");
    }
}
