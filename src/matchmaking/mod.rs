//! Matchmaking: waiting players and pairing

pub mod queue;
pub mod service;

pub use service::{Matchmaker, PairingOutcome};
