use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use overdrop_api::build_app;
use overdrop_clients::{InventoryClient, WorkflowsClient};
use overdrop_config::Config;
use overdrop_domain::Tenant;
use overdrop_engine::{Engine, EngineConfig, EngineError, UploadReaper};
use overdrop_objstore::StoreResolver;
use overdrop_store::{InMemoryStore, MetadataStore, RedbStore};
use tokio::sync::watch;
use tracing::{info, warn};

fn build_engine(config: &Config, ephemeral: bool) -> Result<Arc<Engine>> {
    let store: Arc<dyn MetadataStore> = match (&config.store_path, ephemeral) {
        (Some(path), false) => {
            info!("opening store at {}", path.display());
            Arc::new(RedbStore::open(path).context("opening metadata store")?)
        }
        _ => {
            warn!("running on the in-memory store; state is lost on exit");
            Arc::new(InMemoryStore::new())
        }
    };
    Ok(Arc::new(Engine::new(
        store,
        StoreResolver::new(config.storage.clone()),
        InventoryClient::new(config.inventory_url.clone()),
        WorkflowsClient::new(config.workflows_url.clone()),
        EngineConfig {
            max_attempts: config.max_attempts,
            ..Default::default()
        },
    )))
}

fn reaper(engine: Arc<Engine>, config: &Config, interval: Duration) -> UploadReaper {
    UploadReaper::new(
        engine,
        interval,
        config.reaper_jitter,
        overdrop_config::INPROGRESS_IDLE,
    )
}

/// A received termination signal cancels all request contexts and stops the
/// background loops before exit.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub async fn serve(config: Config, ephemeral: bool) -> Result<()> {
    let engine = build_engine(&config, ephemeral)?;
    let app = build_app(engine.clone(), Arc::new(config.auth_token.clone()));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let background = reaper(engine, &config, config.reaper_interval);
    let reaper_handle = tokio::spawn(async move {
        match background.run(cancel_rx).await {
            Err(EngineError::Cancelled) => info!("upload reaper stopped"),
            Err(e) => warn!(error = %e, "upload reaper exited"),
            Ok(()) => {}
        }
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("listening on {}", config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cancel_tx.send(true).ok();
    reaper_handle.await.ok();
    info!("shutdown complete");
    Ok(())
}

/// Single-shot reaper pass for batch jobs.
pub async fn sweep(config: Config) -> Result<()> {
    let engine = build_engine(&config, false)?;
    let single_shot = reaper(engine, &config, Duration::ZERO);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    single_shot.run(cancel_rx).await?;
    info!("sweep complete");
    Ok(())
}

pub async fn check(config: Config) -> Result<()> {
    let engine = build_engine(&config, false)?;
    engine.healthy(&Tenant::single()).await?;
    println!("ok");
    Ok(())
}
