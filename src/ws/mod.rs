//! WebSocket transport: protocol, connection registry and socket handler

pub mod connections;
pub mod handler;
pub mod protocol;
