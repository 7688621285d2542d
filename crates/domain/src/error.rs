/// Shared error type used across all Deskhand crates.
///
/// Component crates define their own richer error enums (transport, RPC,
/// LLM, store, ingest) and convert into this at the seams where a caller
/// does not care which subsystem failed.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("config: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
