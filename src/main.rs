use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use edge_inference_node::config::{Config, TwinMode};
use edge_inference_node::config_store::ConfigStore;
use edge_inference_node::config_sync::ConfigSyncLoop;
use edge_inference_node::http::{self, HttpState};
use edge_inference_node::metrics;
use edge_inference_node::model_manager::{HttpFetcher, ModelManager};
use edge_inference_node::onnx_engine::OnnxEngine;
use edge_inference_node::ports::{PatchSource, TwinPublisher, Uploader};
use edge_inference_node::scoring::ScoringCoordinator;
use edge_inference_node::state::SharedState;
use edge_inference_node::throttle::UploadThrottler;
use edge_inference_node::twin_transport::{LocalTwin, LogPublisher, MqttTwin};
use edge_inference_node::upload::BlobUploader;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // ONNX Runtime logs every graph optimization pass at info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info").add_directive("ort=warn".parse().unwrap())
            }),
        )
        .init();

    tracing::info!("Starting edge inference node...");

    let config = Config::load()?;
    tracing::info!(
        device = %config.device_id,
        module = %config.module_id,
        twin_mode = ?config.twin_config.mode,
        "Configuration loaded"
    );

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    let shared = Arc::new(SharedState::new(config.initial_configuration()));

    let load_timeout = Duration::from_secs(config.model_config.load_timeout_secs);
    let fetcher = HttpFetcher::new(load_timeout, config.model_config.max_bytes)?;
    let models = Arc::new(ModelManager::new(
        Arc::new(OnnxEngine::new(config.onnx_engine_config())),
        Arc::new(fetcher),
        config.model_config.work_dir.clone(),
        load_timeout,
    ));
    let store = Arc::new(ConfigStore::new(shared.clone(), models));

    let uploader: Option<Arc<dyn Uploader>> = match &config.upload_config {
        Some(upload) => {
            tracing::info!(endpoint = %upload.endpoint, container = %upload.container, "Blob upload enabled");
            let blob = BlobUploader::new(
                upload.endpoint.clone(),
                upload.container.clone(),
                upload.sas_token.clone(),
                Duration::from_secs(upload.timeout_secs),
            )?;
            if let Err(e) = blob.ensure_container().await {
                tracing::warn!(error = %e, "Could not create blob container, uploads may fail");
            }
            Some(Arc::new(blob))
        }
        None => {
            tracing::info!("⚠️  Blob upload disabled (BLOB_ENDPOINT/BLOB_CONTAINER_NAME not set)");
            None
        }
    };
    let throttler = Arc::new(UploadThrottler::new(uploader, config.device_id.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (publisher, sync_handle) = match config.twin_config.mode {
        TwinMode::Mqtt => {
            let (client, stream) = MqttTwin::connect(config.mqtt_twin_config());
            let publisher: Arc<dyn TwinPublisher> = client;
            let handle = start_sync(stream, store.clone(), publisher.clone(), shutdown_rx).await?;
            (publisher, handle)
        }
        TwinMode::Local => {
            let publisher: Arc<dyn TwinPublisher> = Arc::new(LogPublisher);
            let twin = LocalTwin::new(config.twin_config.local_path.clone());
            let handle = start_sync(twin, store.clone(), publisher.clone(), shutdown_rx).await?;
            (publisher, handle)
        }
    };

    let scoring = Arc::new(ScoringCoordinator::new(shared, throttler, Some(publisher)));
    let app = http::router(HttpState { scoring }, config.max_image_bytes);

    let addr: SocketAddr = format!("{}:{}", config.api_host, config.api_port).parse()?;
    let server = http::serve(addr, app, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    });

    tokio::select! {
        result = server => {
            let _ = shutdown_tx.send(true);
            result?;
        }
        result = sync_handle => {
            match result {
                Ok(Ok(())) => tracing::info!("Config sync loop exited"),
                Ok(Err(e)) => {
                    tracing::error!("❌ Config sync failed: {}", e);
                    return Err(e.into());
                }
                Err(e) => return Err(anyhow::anyhow!("Config sync task panicked: {}", e)),
            }
        }
    }

    tracing::info!("Edge inference node stopped");
    Ok(())
}

/// Run the initial sync, then hand the source to the background loop.
async fn start_sync<S: PatchSource + 'static>(
    source: S,
    store: Arc<ConfigStore>,
    publisher: Arc<dyn TwinPublisher>,
    shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<Result<(), edge_inference_node::TransportError>>> {
    let mut sync = ConfigSyncLoop::new(source, store, publisher);
    sync.initial_sync().await?;
    Ok(sync.spawn(shutdown))
}
