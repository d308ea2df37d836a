//! Application state wiring the engine to its infrastructure.
//!
//! The engine is generic over its store; AppState pins it to SQLite and
//! plugs the remaining collaborators in from `config.toml`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autoflow_core::engine::Engine;
use autoflow_core::service::token::{NoTokenProvider, TokenProvider};
use autoflow_infra::config::{load_config, resolve_data_dir};
use autoflow_infra::http::callback::HttpCallbackSender;
use autoflow_infra::http::token::{HttpTokenProvider, StaticTokenProvider};
use autoflow_infra::sqlite::audit::SqliteAuditSink;
use autoflow_infra::sqlite::lock::SqliteLockService;
use autoflow_infra::sqlite::pool::DatabasePool;
use autoflow_infra::sqlite::store::SqliteStore;
use autoflow_infra::storage::local::LocalObjectStorage;
use autoflow_types::config::EngineConfig;
use secrecy::SecretString;

/// Concrete engine type pinned to the SQLite store.
pub type ConcreteEngine = Engine<SqliteStore>;

/// Shared state handed to every command.
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub store: Arc<SqliteStore>,
    pub audit: Arc<SqliteAuditSink>,
    pub pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: load config, connect to DB, build
    /// the engine.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);

        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;

        let db_pool = DatabasePool::open(&data_dir)
            .await
            .context("failed to open database")?;

        let store = Arc::new(SqliteStore::new(db_pool.clone()));
        let audit = Arc::new(SqliteAuditSink::new(db_pool.clone()));
        let timeout = Duration::from_secs(config.callback_timeout_secs);
        let callbacks = HttpCallbackSender::new(timeout).context("failed to build HTTP client")?;
        let tokens = build_token_provider(&config, timeout)?;

        let engine = Engine::builder(
            store.clone(),
            Arc::new(LocalObjectStorage::in_data_dir(&data_dir)),
        )
        .locks(Arc::new(SqliteLockService::new(db_pool.clone())))
        .audit(audit.clone())
        .callbacks(Arc::new(callbacks))
        .tokens(tokens)
        .config(config)
        .build();

        Ok(Self {
            engine: Arc::new(engine),
            store,
            audit,
            pool: db_pool,
        })
    }

    /// Drain background work (audit entries, webhooks, blob cleanup) and
    /// close the database.
    pub async fn close(&self) {
        self.engine.background().wait_idle().await;
        self.pool.close().await;
    }
}

/// Token service when an endpoint is configured, else the static token,
/// else none.
fn build_token_provider(
    config: &EngineConfig,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn TokenProvider>> {
    let credential = config.access_token.clone().map(SecretString::from);
    match (&config.token_endpoint, credential) {
        (Some(endpoint), credential) => {
            let provider = HttpTokenProvider::new(endpoint.clone(), credential, timeout)
                .context("failed to build token client")?;
            Ok(Arc::new(provider))
        }
        (None, Some(token)) => Ok(Arc::new(StaticTokenProvider::new(token))),
        (None, None) => Ok(Arc::new(NoTokenProvider)),
    }
}
