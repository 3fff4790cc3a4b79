//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};

use crate::game::{BodyFrame, BodyId, BoardId, MoveFrame, RunOutcome, SessionId, UserId};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Ask to be paired on a board
    JoinGame { board_id: BoardId },

    /// Planned body placements for the coming round
    Moving { snap: Vec<MoveFrame> },

    /// Acknowledge the end of a finished round
    Finish,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome { user_id: UserId, server_time: u64 },

    /// Waiting for an opponent on a board
    Queued { board_id: BoardId },

    /// A session was formed, players may submit moves
    GameStarted {
        session_id: SessionId,
        board_id: BoardId,
        players: Vec<PlayerInfo>,
    },

    /// Every player is ready and the world is running
    SimulationStarted { session_id: SessionId },

    /// Body poses recorded at one tick
    Frame {
        session_id: SessionId,
        tick: u64,
        bodies: Vec<BodySnapshot>,
    },

    /// The round is over
    Finished {
        session_id: SessionId,
        result: ResultCode,
    },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Player info announced when a session starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub user_id: UserId,
    pub username: String,
}

/// One body's pose inside a frame message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodySnapshot {
    pub body_id: BodyId,
    #[serde(flatten)]
    pub frame: BodyFrame,
}

/// Numeric result carried by the finish notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResultCode {
    /// Terminal contact ended the round
    Completed = 1,
    /// The simulation hit its overall timeout
    TimedOut = 2,
    /// The session was torn down or finished externally
    Aborted = 3,
}

impl From<ResultCode> for u8 {
    fn from(code: ResultCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ResultCode::Completed),
            2 => Ok(ResultCode::TimedOut),
            3 => Ok(ResultCode::Aborted),
            other => Err(format!("unknown result code {other}")),
        }
    }
}

impl From<RunOutcome> for ResultCode {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::TerminalContact { .. } => ResultCode::Completed,
            RunOutcome::TimedOut { .. } => ResultCode::TimedOut,
            RunOutcome::Discarded { .. } => ResultCode::Aborted,
        }
    }
}
