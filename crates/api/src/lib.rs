//! LiveDesk API Library
//!
//! This crate contains the live-chat dispatch core: the connection
//! registry, assignment engine, conversation store, lifecycle manager,
//! WebSocket gateway and the periodic reconcilers.

pub mod assignment;
pub mod auth;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod reconciler;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use lifecycle::Lifecycle;
pub use registry::Registry;
pub use state::AppState;
