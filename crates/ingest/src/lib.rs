//! Document ingestion: parsing heterogeneous inputs into token-bounded
//! chunks with structural metadata, embedding them, and upserting the
//! result into the vector store with per-user access tags.

pub mod builder;
pub mod chunker;
pub mod metadata;
pub mod models;
pub mod parsers;
pub mod pipeline;

pub use models::{DocChunk, IngestError, IngestionItem, IngestionReport, SourceKind};
pub use pipeline::{IngestOptions, IngestionPipeline, IngestionRecorder, RunStatus};
