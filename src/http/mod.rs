//! HTTP surface: health, boards, user registration and the WebSocket route

pub mod routes;

pub use routes::build_router;
