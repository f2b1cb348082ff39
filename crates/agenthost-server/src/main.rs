mod agent_clients;
mod bridge;
mod config;
mod error;
mod instance_control;
mod models;
mod provider;
mod routes;
mod store;

use crate::config::AppConfig;
use crate::instance_control::InstanceOrchestrator;
use crate::models::instance::PgInstanceStore;
use crate::provider::ProviderSet;
use crate::routes::{
    chat, create_instance, delete_instance, get_instance, health_check, instance_status,
    list_instances, purge_instances, set_default_instance, start_instance, stop_instance,
    upload_file,
};
use crate::store::{EncryptedInstanceStore, InstanceStore, MemoryInstanceStore};
use agenthost_vault::Vault;
use axum::extract::DefaultBodyLimit;
use axum::http::{StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Extension, Router};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Base64 inflates uploads by a third; leave headroom for the JSON envelope.
const MAX_BODY_BYTES: usize = routes::MAX_UPLOAD_BYTES / 3 * 4 + 64 * 1024;

#[derive(Clone)]
pub struct State {
    pub orchestrator: InstanceOrchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    let vault = Arc::new(Vault::new(config.encryption_key.as_deref())?);
    if vault.is_enabled() {
        info!("bot token encryption enabled");
    } else {
        warn!("ENCRYPTION_KEY not set; bot tokens are stored unencrypted");
    }

    let records: Arc<dyn InstanceStore> = match &config.database_url {
        Some(url) => {
            let store = PgInstanceStore::connect(url)?;
            info!("Database migrations applied");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; instance records live in memory only");
            Arc::new(MemoryInstanceStore::default())
        }
    };
    let store = Arc::new(EncryptedInstanceStore::new(records, vault));

    if config.fly.is_some() {
        info!("Fly provider configured");
    } else {
        warn!("FLY_API_TOKEN not set; fly instances cannot be provisioned");
    }
    let providers = ProviderSet::from_config(&config);

    let state = State {
        orchestrator: InstanceOrchestrator::new(store, providers, config.credentials.clone()),
    };

    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;

    let server_router = Router::new()
        .route("/health-check", get(health_check))
        .route(
            "/instances",
            post(create_instance)
                .get(list_instances)
                .delete(purge_instances),
        )
        .route("/instances/:id", get(get_instance).delete(delete_instance))
        .route("/instances/:id/status", get(instance_status))
        .route("/instances/:id/start", post(start_instance))
        .route("/instances/:id/stop", post(stop_instance))
        .route("/instances/:id/default", post(set_default_instance))
        .route("/instances/:id/chat", post(chat))
        .route("/instances/:id/files", post(upload_file))
        .fallback(fallback)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(Extension(state));

    let server = axum::Server::bind(&addr).serve(server_router.into_make_service());

    info!("Webserver running on http://{addr}");

    let graceful = server.with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    });

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }

    Ok(())
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {uri}"))
}
