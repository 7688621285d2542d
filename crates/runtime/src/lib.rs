//! Server runtime: builds and owns the explicit lifecycle objects
//! (LLM client, registry, engines, pipeline) the HTTP edge works
//! against, and provides default persistence-collaborator hooks.

pub mod context;
pub mod recorder;

pub use context::AppContext;
pub use recorder::TracingRecorder;
