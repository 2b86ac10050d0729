//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::JwtManager;
use crate::config::Config;
use crate::lifecycle::Lifecycle;
use crate::registry::Registry;

/// State shared by every route handler and the WebSocket gateway
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<Lifecycle>,
    pub jwt: Arc<JwtManager>,
}
