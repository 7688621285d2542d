//! Application context: one object owning every long-lived component,
//! built by the startup path and torn down explicitly on shutdown.

use std::sync::Arc;

use dh_agent::AgentLoop;
use dh_domain::Config;
use dh_ingest::parsers::{
    BuiltinDocumentModel, HttpFetcher, ParserSet, TesseractCli, Transcriber, WhisperEndpoint,
};
use dh_ingest::IngestionPipeline;
use dh_llm::{Embedder, OllamaClient};
use dh_mcp_client::McpRegistry;
use dh_vectorstore::QdrantStore;

use crate::recorder::TracingRecorder;

/// Every long-lived component of the backend, constructed in dependency
/// order. No process-wide singletons: whoever needs a component gets it
/// from here.
pub struct AppContext {
    pub config: Arc<Config>,
    pub llm: Arc<OllamaClient>,
    pub embedder: Arc<Embedder>,
    pub registry: Arc<McpRegistry>,
    pub store: Arc<QdrantStore>,
    pub pipeline: Arc<IngestionPipeline>,
    pub agent: Arc<AgentLoop>,
}

impl AppContext {
    /// Build and start every component: LLM client, embedder, vector
    /// store, tool registry (connect + initial discovery + periodic
    /// refresh), parser engines, ingestion pipeline, agent loop.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let llm = Arc::new(OllamaClient::new(
            &config.llm.base_url,
            &config.llm.chat_model,
            config.llm.num_ctx,
            config.llm.auto_pull,
            config.llm.timeout_secs,
        )?);
        let embedder = Arc::new(Embedder::for_ollama(
            Arc::clone(&llm),
            &config.llm.embed_model,
        ));

        let store = Arc::new(QdrantStore::new(
            &config.vectorstore.url,
            config.vectorstore.embedding_dim,
            &config.vectorstore.collection,
        )?);

        let registry = Arc::new(McpRegistry::new(config.mcp.servers.clone()));
        registry.connect_all().await;
        registry
            .start_periodic_refresh(config.mcp.refresh_interval_secs)
            .await;

        let transcriber = if config.ingest.whisper_endpoint.is_empty() {
            tracing::info!("no transcription endpoint configured, media ingestion disabled");
            None
        } else {
            let engine = WhisperEndpoint::new(
                &config.ingest.whisper_endpoint,
                &config.ingest.whisper_model,
                &config.ingest.whisper_compute_type,
                &config.ingest.whisper_device,
            )?;
            Some(Arc::new(Transcriber::new(
                Arc::new(engine),
                config.ingest.whisper_language.clone(),
            )))
        };

        let parsers = Arc::new(ParserSet {
            document: Arc::new(BuiltinDocumentModel),
            ocr: Arc::new(TesseractCli),
            transcriber,
        });

        let fetcher = Arc::new(HttpFetcher::new(None)?);
        let pipeline = Arc::new(IngestionPipeline::new(
            config.ingest.clone(),
            parsers,
            fetcher,
            Arc::clone(&embedder) as Arc<dyn dh_ingest::pipeline::EmbeddingProvider>,
            Arc::clone(&store) as Arc<dyn dh_ingest::pipeline::VectorIndex>,
            Some(Arc::new(TracingRecorder)),
        ));

        let agent = Arc::new(AgentLoop::new(
            Arc::clone(&llm) as Arc<dyn dh_llm::ChatClient>,
            Arc::clone(&registry) as Arc<dyn dh_mcp_client::ToolRouter>,
            config.agent.max_iterations,
        ));

        tracing::info!(
            servers = config.mcp.servers.len(),
            tools = registry.tool_count(),
            "application context ready"
        );

        Ok(Self {
            config,
            llm,
            embedder,
            registry,
            store,
            pipeline,
            agent,
        })
    }

    /// Tear down in reverse order: refresh loop, tool-server
    /// connections, then client pools.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        self.registry.close_all().await;
        self.embedder.close().await;
        self.llm.close().await;
        self.store.close().await;
        tracing::info!("shutdown complete");
    }
}
