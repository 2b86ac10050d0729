//! WebSocket session gateway
//!
//! One bidirectional JSON-frame connection per principal:
//! - **Connection**: a live session with its outbound channel
//! - **Events**: type-safe inbound/outbound frame definitions
//! - **Handler**: Axum WebSocket route handler; authenticates agents by
//!   bearer token, admits customers by opaque id, demultiplexes inbound
//!   frames to the lifecycle manager

pub mod connection;
pub mod events;
pub mod handler;

pub use connection::SessionHandle;
pub use handler::ws_handler;
