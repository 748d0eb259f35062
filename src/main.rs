//! Horoscope streaming server with dynamic request batching
//!
//! (c) Softlandia 2025

use horoscoper::api::{self, AppState};
use horoscoper::core::batcher::BatchingEngine;
use horoscoper::core::horoscope::{HoroscopeIndex, HoroscopeModel};
use horoscoper::core::publisher::ResultPublisher;
use horoscoper::core::traits::Broker;
use horoscoper::core::worker::InferenceWorker;
use horoscoper::infrastructure::memory_broker::MemoryBroker;
use horoscoper::infrastructure::redis_broker::RedisBroker;
use horoscoper::settings::Settings;

use anyhow::Context;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(web_server_task(settings))
}

async fn web_server_task(settings: Settings) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = match &settings.redis_url {
        Some(redis_url) => {
            info!("Publishing results through redis at {redis_url}");
            Arc::new(RedisBroker::connect(redis_url).await?)
        }
        None => {
            info!("Publishing results in-process");
            Arc::new(MemoryBroker::new())
        }
    };

    let index = HoroscopeIndex::load_from_csv(&settings.horoscope_csv_file)?;
    let model = HoroscopeModel::new(index).with_response_time(
        Duration::from_millis(settings.horoscope_min_response_ms),
        Duration::from_millis(settings.horoscope_max_response_ms),
    );

    let worker = Arc::new(InferenceWorker::new(
        Arc::new(model),
        ResultPublisher::new(broker.clone()),
        settings.infer_workers,
    ));
    let engine = Arc::new(BatchingEngine::new(settings.batcher_config(), worker.clone()));
    engine.start().await;

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        engine.clone(),
        broker,
        settings.infer_job_ttl(),
        settings.max_prompt_length,
        shutdown.clone(),
    )?;

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Shutting down...");
    engine.stop().await;
    worker.shutdown().await;
    info!("Shut down");

    Ok(())
}

/// Resolves on ctrl-c, after cancelling `shutdown` so open deliveries end.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    shutdown.cancel();
}
