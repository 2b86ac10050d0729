//! LiveDesk dispatch server entrypoint

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use livedesk_api::auth::JwtManager;
use livedesk_api::lifecycle::Lifecycle;
use livedesk_api::registry::{mirror::RegistryMirror, Registry};
use livedesk_api::routes::create_router;
use livedesk_api::store::{ConversationStore, PgStore};
use livedesk_api::{AppState, Config};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Misconfiguration (missing/default secret) refuses to start here
    let config = Arc::new(Config::from_env()?);

    let pool = livedesk_shared::db::create_pool(&config.database_url).await?;
    livedesk_shared::db::run_migrations(&pool).await?;
    tracing::info!("Database ready");

    // The mirror is observability only; running without redis is degraded,
    // not fatal
    let mirror = if config.redis_url.is_empty() {
        None
    } else {
        match RegistryMirror::connect(&config.redis_url).await {
            Ok(mirror) => {
                tracing::info!("Registry mirror connected");
                Some(mirror)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Registry mirror unavailable, continuing without it");
                None
            }
        }
    };

    let registry = Arc::new(Registry::new(config.heartbeat_ttl, mirror));
    let store: Arc<dyn ConversationStore> = Arc::new(PgStore::new(pool.clone()));
    let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&store), Arc::clone(&registry)));
    let jwt = Arc::new(JwtManager::new(&config.token_secret, config.token_ttl_hours));

    let reconcilers = livedesk_api::reconciler::spawn_all(Arc::clone(&lifecycle), &config);
    tracing::info!(count = reconcilers.len(), "Reconcilers running");

    let state = AppState {
        config: Arc::clone(&config),
        pool,
        registry,
        lifecycle,
        jwt,
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "LiveDesk dispatch server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
