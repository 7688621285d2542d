use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vectorstore: VectorStoreConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_ollama_url")]
    pub base_url: String,
    #[serde(default = "d_chat_model")]
    pub chat_model: String,
    #[serde(default = "d_embed_model")]
    pub embed_model: String,
    /// Context window requested on chat completions.
    #[serde(default = "d_num_ctx")]
    pub num_ctx: u32,
    /// Pull missing models on first use instead of failing fast.
    #[serde(default = "d_true")]
    pub auto_pull: bool,
    #[serde(default = "d_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_ollama_url(),
            chat_model: d_chat_model(),
            embed_model: d_embed_model(),
            num_ctx: d_num_ctx(),
            auto_pull: true,
            timeout_secs: d_llm_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vector store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "d_qdrant_url")]
    pub url: String,
    #[serde(default = "d_collection")]
    pub collection: String,
    /// Must match the collection's vector size.
    #[serde(default = "d_embedding_dim")]
    pub embedding_dim: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: d_qdrant_url(),
            collection: d_collection(),
            embedding_dim: d_embedding_dim(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
    /// Seconds between tool refreshes; <= 0 disables the refresh loop.
    #[serde(default = "d_refresh_interval")]
    pub refresh_interval_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    pub server_id: String,
    pub url: String,
}

impl McpConfig {
    /// Parse the comma-separated `MCP_SERVER_URLS` form.
    ///
    /// Each entry is either `id=url` or a bare URL, in which case the id
    /// is derived from the host name.
    pub fn parse_server_urls(raw: &str) -> Vec<McpServerConfig> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                if let Some((id, server_url)) = entry.split_once('=') {
                    return Some(McpServerConfig {
                        server_id: id.trim().to_string(),
                        url: server_url.trim().to_string(),
                    });
                }
                let parsed = url::Url::parse(entry).ok()?;
                let id = parsed
                    .host_str()
                    .map(|h| h.replace('.', "_"))
                    .unwrap_or_else(|| "server".to_string());
                Some(McpServerConfig {
                    server_id: id,
                    url: entry.to_string(),
                })
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "d_max_iterations")]
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_max_iterations(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingestion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "d_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "d_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "d_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "d_upload_root")]
    pub upload_root: PathBuf,
    /// Whisper-compatible transcription endpoint; empty disables media
    /// transcription.
    #[serde(default)]
    pub whisper_endpoint: String,
    #[serde(default = "d_whisper_model")]
    pub whisper_model: String,
    #[serde(default = "d_whisper_compute")]
    pub whisper_compute_type: String,
    #[serde(default = "d_whisper_device")]
    pub whisper_device: String,
    #[serde(default)]
    pub whisper_language: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: d_concurrency(),
            chunk_size: d_chunk_size(),
            chunk_overlap: d_chunk_overlap(),
            upload_root: d_upload_root(),
            whisper_endpoint: String::new(),
            whisper_model: d_whisper_model(),
            whisper_compute_type: d_whisper_compute(),
            whisper_device: d_whisper_device(),
            whisper_language: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment loading + validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Build the configuration from environment variables.
    ///
    /// Unset variables fall back to the serde defaults; malformed numeric
    /// values are reported by [`Config::validate`] rather than panicking.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(v) = std::env::var("OLLAMA_BASE_URL") {
            config.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("CHAT_MODEL") {
            config.llm.chat_model = v;
        }
        if let Ok(v) = std::env::var("EMBED_MODEL") {
            config.llm.embed_model = v;
        }
        if let Some(v) = env_parse("CHAT_NUM_CTX") {
            config.llm.num_ctx = v;
        }
        if let Some(v) = env_parse("OLLAMA_AUTO_PULL") {
            config.llm.auto_pull = v;
        }

        if let Ok(v) = std::env::var("QDRANT_URL") {
            config.vectorstore.url = v;
        }
        if let Ok(v) = std::env::var("QDRANT_COLLECTION") {
            config.vectorstore.collection = v;
        }
        if let Some(v) = env_parse("EMBEDDING_DIM") {
            config.vectorstore.embedding_dim = v;
        }

        if let Ok(v) = std::env::var("MCP_SERVER_URLS") {
            config.mcp.servers = McpConfig::parse_server_urls(&v);
        }
        if let Some(v) = env_parse("MCP_REFRESH_INTERVAL") {
            config.mcp.refresh_interval_secs = v;
        }

        if let Some(v) = env_parse("MAX_AGENT_ITERATIONS") {
            config.agent.max_iterations = v;
        }

        if let Some(v) = env_parse("INGEST_MAX_CONCURRENCY") {
            config.ingest.max_concurrency = v;
        }
        if let Some(v) = env_parse("INGEST_CHUNK_SIZE") {
            config.ingest.chunk_size = v;
        }
        if let Some(v) = env_parse("INGEST_CHUNK_OVERLAP") {
            config.ingest.chunk_overlap = v;
        }
        if let Ok(v) = std::env::var("INGEST_UPLOAD_ROOT") {
            config.ingest.upload_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WHISPER_ENDPOINT") {
            config.ingest.whisper_endpoint = v;
        }
        if let Ok(v) = std::env::var("WHISPER_MODEL") {
            config.ingest.whisper_model = v;
        }
        if let Ok(v) = std::env::var("WHISPER_COMPUTE_TYPE") {
            config.ingest.whisper_compute_type = v;
        }
        if let Ok(v) = std::env::var("WHISPER_DEVICE") {
            config.ingest.whisper_device = v;
        }
        if let Ok(v) = std::env::var("WHISPER_LANGUAGE") {
            if !v.trim().is_empty() {
                config.ingest.whisper_language = Some(v);
            }
        }

        config
    }

    /// Validate invariants that must hold before any I/O starts.
    /// Errors are fatal; the server refuses to start on any of them.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if url::Url::parse(&self.llm.base_url).is_err() {
            issues.push(error(format!(
                "OLLAMA_BASE_URL is not a valid URL: {}",
                self.llm.base_url
            )));
        }
        if url::Url::parse(&self.vectorstore.url).is_err() {
            issues.push(error(format!(
                "QDRANT_URL is not a valid URL: {}",
                self.vectorstore.url
            )));
        }
        if self.vectorstore.embedding_dim == 0 {
            issues.push(error("EMBEDDING_DIM must be positive".to_string()));
        }
        if self.ingest.chunk_size == 0 {
            issues.push(error("INGEST_CHUNK_SIZE must be positive".to_string()));
        }
        if self.ingest.chunk_overlap >= self.ingest.chunk_size {
            issues.push(error(format!(
                "INGEST_CHUNK_OVERLAP ({}) must be smaller than INGEST_CHUNK_SIZE ({})",
                self.ingest.chunk_overlap, self.ingest.chunk_size
            )));
        }
        if self.agent.max_iterations == 0 {
            issues.push(error("MAX_AGENT_ITERATIONS must be positive".to_string()));
        }
        for server in &self.mcp.servers {
            if url::Url::parse(&server.url).is_err() {
                issues.push(error(format!(
                    "MCP server {} has an invalid URL: {}",
                    server.server_id, server.url
                )));
            }
        }
        if self.mcp.refresh_interval_secs <= 0 && !self.mcp.servers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "MCP_REFRESH_INTERVAL <= 0: periodic tool refresh is disabled".to_string(),
            });
        }

        issues
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn error(message: String) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Error,
        message,
    }
}

// ── serde defaults ─────────────────────────────────────────────────

fn d_ollama_url() -> String {
    "http://localhost:11434".into()
}
fn d_chat_model() -> String {
    "gpt-oss:20b".into()
}
fn d_embed_model() -> String {
    "embeddinggemma:300m".into()
}
fn d_num_ctx() -> u32 {
    32_768
}
fn d_llm_timeout() -> u64 {
    300
}
fn d_qdrant_url() -> String {
    "http://localhost:6333".into()
}
fn d_collection() -> String {
    "documents".into()
}
fn d_embedding_dim() -> usize {
    768
}
fn d_refresh_interval() -> i64 {
    90
}
fn d_max_iterations() -> usize {
    10
}
fn d_concurrency() -> usize {
    4
}
fn d_chunk_size() -> usize {
    500
}
fn d_chunk_overlap() -> usize {
    50
}
fn d_upload_root() -> PathBuf {
    PathBuf::from("/data/uploads")
}
fn d_whisper_model() -> String {
    "large-v3".into()
}
fn d_whisper_compute() -> String {
    "int8".into()
}
fn d_whisper_device() -> String {
    "cpu".into()
}
fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "default config must validate: {errors:?}");
    }

    #[test]
    fn parse_server_urls_with_ids() {
        let servers = McpConfig::parse_server_urls("web=http://web:9000, data=http://data:9001");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].server_id, "web");
        assert_eq!(servers[0].url, "http://web:9000");
        assert_eq!(servers[1].server_id, "data");
    }

    #[test]
    fn parse_server_urls_bare_derives_id_from_host() {
        let servers = McpConfig::parse_server_urls("http://tools.internal:9000/mcp");
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].server_id, "tools_internal");
    }

    #[test]
    fn parse_server_urls_skips_empty_entries() {
        let servers = McpConfig::parse_server_urls("web=http://web:9000,, ,");
        assert_eq!(servers.len(), 1);
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let mut config = Config::default();
        config.ingest.chunk_size = 50;
        config.ingest.chunk_overlap = 50;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("OVERLAP")));
    }

    #[test]
    fn zero_embedding_dim_is_fatal() {
        let mut config = Config::default();
        config.vectorstore.embedding_dim = 0;
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn bad_mcp_url_is_fatal() {
        let mut config = Config::default();
        config.mcp.servers = vec![McpServerConfig {
            server_id: "bad".into(),
            url: "not a url".into(),
        }];
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("bad")));
    }
}
