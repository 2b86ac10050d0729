//! WebSocket connection handles
//!
//! A `SessionHandle` is the registry-visible face of one live connection:
//! a session id plus the outbound channel drained by that connection's
//! writer task.

use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::ServerFrame;

/// Handle to an active WebSocket session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Channel to send frames to this connection
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl SessionHandle {
    /// Create a new handle with a fresh session id
    pub fn new(sender: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            sender,
        }
    }

    /// Send a frame to this session. Best-effort: returns false when the
    /// connection's writer task is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Transport liveness probe: the writer task still holds its receiver
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
