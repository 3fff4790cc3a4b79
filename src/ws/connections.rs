//! Outbound channels of connected players

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::game::UserId;

use super::protocol::ServerMsg;

/// Frame buffer per player; frames arrive at the tick rate
const FRAME_CAPACITY: usize = 256;

/// Identifies one socket of a user
pub type ConnectionId = u64;

/// Sending half of one socket. Frames are bounded and may be dropped,
/// everything else goes through the unbounded control channel.
struct Outlet {
    id: ConnectionId,
    frames: mpsc::Sender<ServerMsg>,
    control: mpsc::UnboundedSender<ServerMsg>,
}

/// Receiving half of one socket, drained by its writer task
pub struct Outbound {
    id: ConnectionId,
    frames: mpsc::Receiver<ServerMsg>,
    control: mpsc::UnboundedReceiver<ServerMsg>,
}

impl Outbound {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next message to write. Queued frames go first so a round's frames
    /// precede its `finished`. `None` once both channels are closed.
    pub async fn recv(&mut self) -> Option<ServerMsg> {
        tokio::select! {
            biased;
            Some(msg) = self.frames.recv() => Some(msg),
            msg = self.control.recv() => match msg {
                Some(msg) => Some(msg),
                None => self.frames.recv().await,
            },
        }
    }
}

/// Tracks which users hold an open socket and routes messages to them
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Outlet>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket for `user_id`, replacing any previous one
    pub fn register(&self, user_id: UserId) -> Outbound {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let outlet = Outlet {
            id,
            frames: frames_tx,
            control: control_tx,
        };
        if self.connections.insert(user_id, outlet).is_some() {
            info!(user_id = %user_id, connection_id = id, "Replaced existing connection");
        }
        Outbound {
            id,
            frames: frames_rx,
            control: control_rx,
        }
    }

    /// Drop the user's channels if `connection_id` is still their current
    /// socket. Returns false for a socket that was already replaced.
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(&user_id, |_, outlet| outlet.id == connection_id)
            .is_some();
        if removed {
            info!(user_id = %user_id, connection_id, "Connection unregistered");
        } else {
            debug!(user_id = %user_id, connection_id, "Connection already replaced");
        }
        removed
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.connections
            .get(&user_id)
            .map_or(false, |outlet| !outlet.control.is_closed())
    }

    /// Queue a message without blocking. Returns whether it was accepted.
    pub fn send(&self, user_id: UserId, msg: ServerMsg) -> bool {
        let Some(outlet) = self.connections.get(&user_id) else {
            debug!(user_id = %user_id, "No connection to send to");
            return false;
        };

        if !matches!(msg, ServerMsg::Frame { .. }) {
            return match outlet.control.send(msg) {
                Ok(()) => true,
                Err(_) => {
                    debug!(user_id = %user_id, "Outbound channel closed");
                    false
                }
            };
        }

        match outlet.frames.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %user_id, "Frame queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id = %user_id, "Outbound channel closed");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
