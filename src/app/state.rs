//! Application state shared across routes

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::game::WorldRunnerService;
use crate::matchmaking::Matchmaker;
use crate::sessions::GameSessionService;
use crate::store::{BoardCatalog, BoardStore, StoreError, UserStore};
use crate::ws::connections::ConnectionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: Arc<UserStore>,
    pub boards: Arc<BoardStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub runners: Arc<WorldRunnerService>,
    pub sessions: Arc<GameSessionService>,
    pub matchmaking: Arc<Matchmaker>,
}

impl AppState {
    /// Build every service and load the configured store files
    pub fn new(config: Config) -> Result<Self, StoreError> {
        let config = Arc::new(config);

        let users = Arc::new(UserStore::new());
        if let Some(path) = &config.users_path {
            users.load_json(path)?;
        }
        let boards = Arc::new(BoardStore::new());
        if let Some(path) = &config.boards_path {
            boards.load_json(path)?;
        }
        info!(
            users = users.len(),
            boards = boards.list().len(),
            "Stores ready"
        );

        Ok(Self::with_stores(config, users, boards))
    }

    pub fn with_stores(config: Arc<Config>, users: Arc<UserStore>, boards: Arc<BoardStore>) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let runners = Arc::new(WorldRunnerService::new());

        let sessions = Arc::new(GameSessionService::new(
            users.clone(),
            boards.clone(),
            connections.clone(),
            runners.clone(),
            config.simulation.clone(),
        ));
        let matchmaking = Arc::new(Matchmaker::new(
            sessions.clone(),
            users.clone(),
            boards.clone(),
            connections.clone(),
        ));

        Self {
            config,
            users,
            boards,
            connections,
            runners,
            sessions,
            matchmaking,
        }
    }
}
