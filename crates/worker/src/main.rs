mod builtin;

use std::sync::Arc;

use anyhow::Context;

use taskforge_engine::{EngineConfig, InMemoryTaskStore, PostgresTaskStore, TaskManager, TaskStore};

use crate::builtin::{DelayExecutor, EchoExecutor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let store = open_store().await?;

    let manager = TaskManager::builder(config)
        .register_executor("echo", EchoExecutor)
        .register_executor("delay", DelayExecutor)
        .build(store)?;

    let report = manager.start().await.context("recovery failed")?;
    tracing::info!(?report, config = ?manager.config(), "worker ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    manager.stop().await;
    Ok(())
}

async fn open_store() -> anyhow::Result<Arc<dyn TaskStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PostgresTaskStore::connect(&url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            tracing::info!("using postgres task store");
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; tasks will not survive a restart");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
    }
}
