//! Process-wide shared state handed to every axum handler. Everything here
//! is cheap to clone (pool is itself a handle, the rest are `Arc`s) — axum
//! clones `State` per request.

use std::sync::Arc;

use relay_core::{ConnectionRegistry, DbPool, RelayEngine};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub registry: Arc<ConnectionRegistry>,
    pub engine: Arc<RelayEngine>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pool: DbPool, config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(RelayEngine::new(registry.clone()));
        Self {
            pool,
            registry,
            engine,
            config: Arc::new(config),
        }
    }
}
