//! Game sessions, per-player state and the session registry

pub mod player;
pub mod service;
pub mod session;

pub use service::{GameSessionService, Preparation};
pub use session::GameState;
