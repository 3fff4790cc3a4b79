//! Game session: board, fixed player set, lifecycle state and move buffer

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::game::{BoardId, MoveFrame, SessionId, UserId};

/// Lifecycle of a session. Only forward, one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameState {
    /// Players are planning and submitting moves
    Moving,
    /// Every player submitted, waiting for a world runner
    Ready,
    /// A world runner is simulating the round
    Simulation,
    /// The round ended
    Finished,
}

impl GameState {
    pub fn next(self) -> Option<GameState> {
        match self {
            GameState::Moving => Some(GameState::Ready),
            GameState::Ready => Some(GameState::Simulation),
            GameState::Simulation => Some(GameState::Finished),
            GameState::Finished => None,
        }
    }
}

/// Result of [`GameSession::advance_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced { from: GameState, to: GameState },
    /// Already in the requested state
    Unchanged,
    /// The requested state is not the next one
    Rejected { current: GameState },
}

/// One match on one board
#[derive(Debug)]
pub struct GameSession {
    id: SessionId,
    board_id: BoardId,
    players: Vec<UserId>,
    state: Mutex<GameState>,
    moves: DashMap<UserId, Vec<MoveFrame>>,
}

impl GameSession {
    pub fn new(board_id: BoardId, players: Vec<UserId>) -> Self {
        Self {
            id: SessionId::new(),
            board_id,
            players,
            state: Mutex::new(GameState::Moving),
            moves: DashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn players(&self) -> &[UserId] {
        &self.players
    }

    pub fn state(&self) -> GameState {
        *self.state.lock()
    }

    /// Move to `target` if it is the state right after the current one.
    /// Check and update happen under one lock, so each step is taken once.
    pub fn advance_to(&self, target: GameState) -> Transition {
        let mut state = self.state.lock();
        let current = *state;
        if current == target {
            Transition::Unchanged
        } else if current.next() == Some(target) {
            *state = target;
            Transition::Advanced {
                from: current,
                to: target,
            }
        } else {
            Transition::Rejected { current }
        }
    }

    /// Store the player's latest submitted moves
    pub fn put_moves(&self, user_id: UserId, moves: Vec<MoveFrame>) {
        self.moves.insert(user_id, moves);
    }

    pub fn moves_for(&self, user_id: UserId) -> Option<Vec<MoveFrame>> {
        self.moves.get(&user_id).map(|m| m.clone())
    }

    /// Every submitted move, in player order
    pub fn all_moves(&self) -> Vec<MoveFrame> {
        self.players
            .iter()
            .filter_map(|p| self.moves_for(*p))
            .flatten()
            .collect()
    }
}
