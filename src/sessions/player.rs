//! Per-session state of one player

use crate::game::UserId;

/// Readiness and completion flags of a player inside one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerState {
    pub user_id: UserId,
    pub username: String,
    ready: bool,
    finished: bool,
}

impl PlayerState {
    pub fn new(user_id: UserId, username: String) -> Self {
        Self {
            user_id,
            username,
            ready: false,
            finished: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_finished(&mut self) {
        self.finished = true;
    }
}
