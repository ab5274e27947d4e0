use std::sync::Arc;

use axum::Router;
use fitout_core::audit::TracingAuditSink;
use fitout_core::config::{AppConfig, ConfigError, LoadOptions};
use fitout_core::workflow::VariationWorkflow;
use fitout_db::{connect_with_config, migrations, DbPool, SqlVariationRepository};
use thiserror::Error;
use tracing::info;

use crate::api::{self, ApiState};
use crate::health;
use crate::pdf::{PdfError, PdfGenerator, VariationDocuments};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub repository: Arc<SqlVariationRepository>,
    pub documents: VariationDocuments,
}

impl Application {
    pub fn router(&self) -> Router {
        let state = ApiState::new(self.repository.clone(), self.documents.clone());
        api::router(state).merge(health::router(self.db_pool.clone()))
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("document templates failed to load: {0}")]
    Documents(#[source] PdfError),
}

#[allow(dead_code)]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
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

    let workflow = VariationWorkflow::new(
        config.business.default_currency.clone(),
        Arc::new(TracingAuditSink),
    );
    let repository = Arc::new(SqlVariationRepository::with_workflow(db_pool.clone(), workflow));

    let generator =
        PdfGenerator::new(&config.documents.template_dir, &config.documents.page_size)
            .map_err(BootstrapError::Documents)?;
    let documents = VariationDocuments::new(generator, repository.clone());
    info!(
        event_name = "system.bootstrap.documents_ready",
        correlation_id = "bootstrap",
        template_dir = %config.documents.template_dir.display(),
        "document generator initialized"
    );

    Ok(Application { config, db_pool, repository, documents })
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use fitout_core::config::{ConfigOverrides, LoadOptions};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_a_missing_required_config_file() {
        let result = bootstrap(LoadOptions {
            config_path: Some("/nonexistent/fitout.toml".into()),
            require_file: true,
            ..overrides("sqlite::memory:")
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("fitout.toml"));
    }

    #[tokio::test]
    async fn integration_smoke_covers_schema_and_the_decision_path() {
        let app = bootstrap(overrides("sqlite::memory:"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('variation', 'variation_file', 'variation_event')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected variation tables to be available after bootstrap");
        assert_eq!(table_count, 3, "bootstrap should expose the variation tables");

        let router = app.router();
        let created = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/variation")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "project_id": "P-SMOKE",
                            "details": {
                                "title": "Glass partition",
                                "change_description": "Swap drywall for glazing",
                                "reason_description": "Daylight",
                                "change_requestor": "Tenant"
                            },
                            "costs": {
                                "additional_costs": [
                                    {"category": "Glazing", "description": "Supply", "amount": "500"}
                                ]
                            }
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(created.status(), StatusCode::CREATED);
        let body: Value = serde_json::from_slice(
            &to_bytes(created.into_body(), usize::MAX).await.expect("body"),
        )
        .expect("json");
        let id = body["variation"]["id"].as_str().expect("id").to_owned();

        for step in ["submit", "approve"] {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/variation/{id}/{step}"))
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK, "{step} should succeed");
        }

        let health = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(health.status(), StatusCode::OK);

        app.db_pool.close().await;
    }
}
