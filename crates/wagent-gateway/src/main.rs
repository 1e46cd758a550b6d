use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wagent_core::config::{WagentConfig, VECTOR_SEARCH_TIMEOUT_SECS};
use wagent_core::crypto::KeySealer;
use wagent_intervention::InterventionController;
use wagent_llm::{VectorIndexClient, VectorSearch};
use wagent_merger::{ChatMerger, MergeSink};
use wagent_pipeline::context::{HttpProviderFactory, HttpWahaFactory, PipelineContext};
use wagent_pipeline::infer::InferStage;
use wagent_pipeline::queue::{run_workers, stage_queue, WorkerOptions};
use wagent_pipeline::reply::ReplyStage;
use wagent_pipeline::retrieve::RetrieveStage;
use wagent_store::agents::AgentStore;
use wagent_store::audit::AuditStore;
use wagent_store::buffers::BufferStore;
use wagent_store::chunks::ChunkStore;
use wagent_store::conversations::ConversationStore;
use wagent_store::db;
use wagent_store::dedup::DedupStore;
use wagent_store::jobs::JobStore;
use wagent_store::messages::MessageStore;
use wagent_store::metrics::MetricsStore;
use wagent_store::sessions::SessionStore;

mod app;
mod dispatch;
mod http;

/// Stage queue capacity; enqueue failures bounce back to the producer's
/// retry policy rather than buffering without limit.
const QUEUE_CAPACITY: usize = 256;
/// Cadence of the stale-job supersede sweep.
const STALE_SWEEP_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wagent=info,wagent_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit WAGENT_CONFIG env > ~/.wagent/wagent.toml
    let config_path = std::env::var("WAGENT_CONFIG").ok();
    let config = WagentConfig::load(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("config load failed: {e}"))?;
    if config.encryption_key.is_empty() {
        anyhow::bail!("WAGENT_ENCRYPTION_KEY must be set (at least 32 characters)");
    }
    let sealer = KeySealer::new(&config.encryption_key)
        .map_err(|e| anyhow::anyhow!("encryption key rejected: {e}"))?;

    // Storage: one connection per manager on the same file.
    let db_path = config.database.path.clone();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let open = |path: &str| -> anyhow::Result<rusqlite::Connection> {
        db::open(path).map_err(|e| anyhow::anyhow!("database open failed: {e}"))
    };

    let sessions = Arc::new(SessionStore::new(open(&db_path)?));
    let conversations = Arc::new(ConversationStore::new(open(&db_path)?));
    let messages = Arc::new(MessageStore::new(open(&db_path)?));
    let jobs = Arc::new(JobStore::new(open(&db_path)?));
    let agents = Arc::new(AgentStore::new(open(&db_path)?));
    let chunks = Arc::new(ChunkStore::new(open(&db_path)?));
    let audit = Arc::new(AuditStore::new(open(&db_path)?));
    let dedup = Arc::new(DedupStore::new(open(&db_path)?));
    let buffers = Arc::new(BufferStore::new(open(&db_path)?));
    let metrics = Arc::new(MetricsStore::new(open(&db_path)?));

    let intervention = Arc::new(InterventionController::new(
        Arc::clone(&sessions),
        Arc::clone(&conversations),
        audit,
    ));

    let cancel = CancellationToken::new();

    // Typed stage queues.
    let (retrieve_queue, retrieve_rx) = stage_queue("q_retrieve", QUEUE_CAPACITY);
    let (infer_queue, infer_rx) = stage_queue("q_infer", QUEUE_CAPACITY);
    let (reply_queue, reply_rx) = stage_queue("q_reply", QUEUE_CAPACITY);

    let vector = Arc::new(VectorIndexClient::new(
        config.vector.base_url.clone(),
        config.vector.api_key.clone(),
        std::time::Duration::from_secs(VECTOR_SEARCH_TIMEOUT_SECS),
    ));

    let pipeline = Arc::new(PipelineContext {
        config: config.clone(),
        sealer,
        sessions,
        conversations,
        messages,
        jobs: Arc::clone(&jobs),
        agents,
        chunks,
        intervention,
        vector: vector as Arc<dyn VectorSearch>,
        providers: Arc::new(HttpProviderFactory),
        waha: Arc::new(HttpWahaFactory),
        infer_queue: infer_queue.clone(),
        reply_queue: reply_queue.clone(),
        cancel: cancel.clone(),
    });

    // Jobs stuck in `processing` from a previous crash block nothing,
    // but supersede them so redeliveries can proceed cleanly.
    match jobs.supersede_stale(config.pipeline.stale_job_secs) {
        Ok(n) if n > 0 => warn!(count = n, "stale jobs superseded at startup"),
        Err(e) => warn!(error = %e, "stale-job sweep failed at startup"),
        _ => {}
    }
    spawn_stale_sweeper(Arc::clone(&jobs), config.pipeline.stale_job_secs, cancel.clone());

    // Stage workers.
    let options = WorkerOptions {
        concurrency: config.pipeline.workers_per_stage,
        max_attempts: config.pipeline.max_attempts,
    };
    run_workers(
        retrieve_queue.clone(),
        retrieve_rx,
        Arc::new(RetrieveStage::new(Arc::clone(&pipeline))),
        Arc::clone(&metrics),
        options.clone(),
        cancel.clone(),
    );
    run_workers(
        infer_queue,
        infer_rx,
        Arc::new(InferStage::new(Arc::clone(&pipeline))),
        Arc::clone(&metrics),
        options.clone(),
        cancel.clone(),
    );
    run_workers(
        reply_queue,
        reply_rx,
        Arc::new(ReplyStage::new(Arc::clone(&pipeline))),
        Arc::clone(&metrics),
        options,
        cancel.clone(),
    );

    // Per-chat merge actors, fed by the dispatcher, flushing into the
    // retrieve queue. Buffers from a previous run are re-armed now.
    let merger = Arc::new(ChatMerger::new(
        config.merge.window_ms,
        buffers,
        Arc::new(retrieve_queue.clone()) as Arc<dyn MergeSink>,
        cancel.clone(),
    ));
    match merger.rehydrate() {
        Ok(n) if n > 0 => info!(count = n, "merge buffers rehydrated"),
        Err(e) => warn!(error = %e, "merge buffer rehydration failed"),
        _ => {}
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState {
        config,
        pipeline,
        merger,
        dedup,
        retrieve_queue,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("wagent gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    Ok(())
}

/// Periodically supersede `processing` jobs that outlived the staleness
/// threshold (crashed or wedged workers).
fn spawn_stale_sweeper(jobs: Arc<JobStore>, stale_secs: i64, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(STALE_SWEEP_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = jobs.supersede_stale(stale_secs) {
                        warn!(error = %e, "stale-job sweep failed");
                    }
                }
            }
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining");
    cancel.cancel();
}
