pub mod api;
pub mod auth;
pub mod config;
pub mod console;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod state;
pub mod storage;

use crate::api::{LLMApiProvider, OpenAICompatibleProvider};
use crate::auth::{CachedIdentity, IdentityProvider, StaticIdentity};
use anyhow::Context;
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use storage::StorageManager;

pub fn run() -> anyhow::Result<()> {
    env_logger::init();

    let config = AppConfig::from_env()?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        let storage_manager = StorageManager::open(&config.db_path).await?;
        let api_provider: Arc<dyn LLMApiProvider> =
            Arc::new(OpenAICompatibleProvider::with_options(config.generation));
        let auth = Arc::new(CachedIdentity::new(StaticIdentity::new(config.user_id.clone())));
        let mut auth_events = auth.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = auth_events.recv().await {
                log::info!("Auth state changed: {:?}", event);
            }
        });

        let identity: Arc<dyn IdentityProvider> = auth.clone();
        let app_state = AppState::new(storage_manager, api_provider, identity, config);
        console::run_console(app_state, auth).await
    })
}
