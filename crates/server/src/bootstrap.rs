use std::sync::Arc;

use gradplan_agent::{
    GenerationJobService, OpenAiCompatibleClient, ReasoningClient, ReasoningError,
    RuntimeInit, ServiceDependencies, ServiceError, ServiceSettings, WorkerPool,
};
use gradplan_core::config::{AppConfig, ConfigError};
use gradplan_core::generation_engine::GenerationEngine;
use gradplan_db::repositories::{SqlCatalogRepository, SqlConversationRepository, SqlJobRepository};
use gradplan_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<GenerationJobService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("reasoning client setup failed: {0}")]
    Reasoning(#[from] ReasoningError),
    #[error("generation service setup failed: {0}")]
    Service(#[from] ServiceError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let reasoning = Arc::new(OpenAiCompatibleClient::from_config(&config.llm)?);
    info!(
        event_name = "system.bootstrap.reasoning_client",
        correlation_id = "bootstrap",
        endpoint = reasoning.endpoint(),
        model = %config.llm.model,
        "reasoning client configured"
    );

    let service = build_service(&config, db_pool.clone(), reasoning)?;
    Ok(Application { config, db_pool, service })
}

/// Wires the SQLite stores, the given reasoning client and the worker pool into one service.
pub fn build_service(
    config: &AppConfig,
    db_pool: DbPool,
    reasoning: Arc<dyn ReasoningClient>,
) -> Result<Arc<GenerationJobService>, ServiceError> {
    let service = GenerationJobService::new(
        ServiceDependencies {
            jobs: Arc::new(SqlJobRepository::new(db_pool.clone())),
            conversations: Arc::new(SqlConversationRepository::new(db_pool.clone())),
            catalog: Arc::new(SqlCatalogRepository::new(db_pool)),
            reasoning,
            runtime: Arc::new(RuntimeInit::default()),
        },
        GenerationEngine::with_config(config.worker.engine_config()),
        ServiceSettings::from_config(config),
        WorkerPool::new(config.worker.concurrency as usize),
    )?;
    Ok(Arc::new(service))
}

#[cfg(test)]
mod tests {
    use gradplan_core::config::{AppConfig, ConfigOverrides, LlmProvider, LoadOptions};

    use crate::bootstrap::bootstrap_with_config;

    #[tokio::test]
    async fn bootstrap_fails_fast_when_reasoning_client_cannot_be_built() {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.llm.provider = LlmProvider::Ollama;
        config.llm.base_url = None;

        let message = bootstrap_with_config(config)
            .await
            .err()
            .expect("ollama without a base url should fail")
            .to_string();
        assert!(message.contains("llm.base_url"));
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_verifies_tool_catalog() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("default config with an in-memory database is valid");
        let app = bootstrap_with_config(config)
            .await
            .expect("bootstrap should succeed with the default ollama settings");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN \
             ('generation_job', 'generation_job_event', 'conversation_state', 'program')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("tables should be queryable after bootstrap");
        assert_eq!(table_count, 4);

        let check = app.service.runtime().catalog_check().expect("catalog checked at startup");
        assert_eq!(check.tools.len(), 5);

        app.db_pool.close().await;
    }
}
