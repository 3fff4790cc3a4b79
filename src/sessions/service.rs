//! Session registry: who plays where, readiness, lifecycle and teardown

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::config::SimulationSettings;
use crate::game::{
    BodyFrame, BodyId, BoardId, FrameSink, MoveFrame, SessionId, UserId, WorldError, WorldRunner,
    WorldRunnerService,
};
use crate::store::{BoardCatalog, UserDirectory};
use crate::ws::connections::ConnectionRegistry;
use crate::ws::protocol::{BodySnapshot, PlayerInfo, ResultCode, ServerMsg};

use super::player::PlayerState;
use super::session::{GameSession, GameState, Transition};

/// A user's place in a session. Session and player state live in one entry
/// so neither can exist without the other.
#[derive(Clone)]
struct Seat {
    session: Arc<GameSession>,
    player: PlayerState,
}

/// Result of [`GameSessionService::prepare_simulation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preparation {
    /// Not in a session, or the session is already simulating
    Rejected,
    /// Moves recorded, the session is not (newly) ready
    Waiting,
    /// This submission made the whole team ready
    TeamReady(SessionId),
}

/// Owns every game session and player state
pub struct GameSessionService {
    seats: DashMap<UserId, Seat>,
    sessions: DashMap<SessionId, Arc<GameSession>>,
    users: Arc<dyn UserDirectory>,
    boards: Arc<dyn BoardCatalog>,
    connections: Arc<ConnectionRegistry>,
    runners: Arc<WorldRunnerService>,
    settings: SimulationSettings,
}

impl GameSessionService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        boards: Arc<dyn BoardCatalog>,
        connections: Arc<ConnectionRegistry>,
        runners: Arc<WorldRunnerService>,
        settings: SimulationSettings,
    ) -> Self {
        Self {
            seats: DashMap::new(),
            sessions: DashMap::new(),
            users,
            boards,
            connections,
            runners,
            settings,
        }
    }

    pub fn is_playing(&self, user_id: UserId) -> bool {
        self.seats.contains_key(&user_id)
    }

    pub fn session_for(&self, user_id: UserId) -> Option<Arc<GameSession>> {
        self.seats.get(&user_id).map(|seat| seat.session.clone())
    }

    pub fn session(&self, session_id: SessionId) -> Option<Arc<GameSession>> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    pub fn player(&self, user_id: UserId) -> Option<PlayerState> {
        self.seats.get(&user_id).map(|seat| seat.player.clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn seated_players(&self) -> usize {
        self.seats.len()
    }

    /// Whether a session has moved on from planning, or no longer exists
    pub fn is_simulation_started_for(&self, user_id: UserId) -> bool {
        self.session_for(user_id)
            .map_or(true, |s| s.state() >= GameState::Simulation)
    }

    /// Create a session in `MOVING` and seat every player.
    ///
    /// If any player already holds a seat, the seats taken so far are
    /// released and no session is created.
    pub fn start_game(&self, board_id: BoardId, players: &[UserId]) -> Option<SessionId> {
        if players.is_empty() {
            warn!(board_id = %board_id, "Refusing to start a game without players");
            return None;
        }

        let session = Arc::new(GameSession::new(board_id, players.to_vec()));
        let mut seated = Vec::with_capacity(players.len());
        for &user_id in players {
            let username = self
                .users
                .find(user_id)
                .map(|p| p.username)
                .unwrap_or_else(|| user_id.to_string());

            // The entry guard holds a shard lock until the match ends.
            let taken = match self.seats.entry(user_id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(Seat {
                        session: session.clone(),
                        player: PlayerState::new(user_id, username),
                    });
                    true
                }
            };
            if !taken {
                warn!(user_id = %user_id, "Player is already in a game, abandoning session");
                for user in seated {
                    self.seats.remove(&user);
                }
                return None;
            }
            seated.push(user_id);
        }

        let session_id = session.id();
        self.sessions.insert(session_id, session.clone());
        info!(
            session_id = %session_id,
            board_id = %board_id,
            players = players.len(),
            "Game session started"
        );

        let infos: Vec<PlayerInfo> = players
            .iter()
            .filter_map(|p| self.player(*p))
            .map(|p| PlayerInfo {
                user_id: p.user_id,
                username: p.username,
            })
            .collect();
        self.broadcast(
            &session,
            ServerMsg::GameStarted {
                session_id,
                board_id,
                players: infos,
            },
        );

        Some(session_id)
    }

    /// Mark the player ready. No effect once the session left `MOVING`.
    pub fn set_ready(&self, user_id: UserId) -> bool {
        let Some(mut seat) = self.seats.get_mut(&user_id) else {
            warn!(user_id = %user_id, "Cannot set ready, player is not in a game");
            return false;
        };
        if seat.session.state() != GameState::Moving {
            debug!(user_id = %user_id, state = ?seat.session.state(), "Session is past moving");
            return false;
        }
        seat.player.set_ready();
        true
    }

    pub fn is_team_ready(&self, session: &GameSession) -> bool {
        session
            .players()
            .iter()
            .all(|p| self.seat_in(*p, session).map_or(false, |player| player.is_ready()))
    }

    pub fn set_finished(&self, user_id: UserId) -> bool {
        match self.seats.get_mut(&user_id) {
            Some(mut seat) => {
                seat.player.set_finished();
                true
            }
            None => {
                warn!(user_id = %user_id, "Cannot set finished, player is not in a game");
                false
            }
        }
    }

    /// True once every player still seated has finished. Players who already
    /// left count as finished.
    pub fn is_team_finished(&self, session: &GameSession) -> bool {
        session
            .players()
            .iter()
            .all(|p| self.seat_in(*p, session).map_or(true, |player| player.is_finished()))
    }

    /// Record the player's moves and mark them ready. Moves the session to
    /// `READY` when the whole team has submitted.
    pub fn prepare_simulation(&self, user_id: UserId, moves: Vec<MoveFrame>) -> Preparation {
        let Some(session) = self.session_for(user_id) else {
            error!(user_id = %user_id, "Should start game before simulation");
            return Preparation::Rejected;
        };
        if session.state() >= GameState::Simulation {
            error!(user_id = %user_id, session_id = %session.id(), "Already in simulation");
            return Preparation::Rejected;
        }

        session.put_moves(user_id, moves);
        self.set_ready(user_id);

        if !self.is_team_ready(&session) {
            debug!(session_id = %session.id(), "Waiting for the rest of the team");
            return Preparation::Waiting;
        }
        match session.advance_to(GameState::Ready) {
            Transition::Advanced { .. } => {
                info!(session_id = %session.id(), "Team is ready");
                Preparation::TeamReady(session.id())
            }
            other => {
                debug!(session_id = %session.id(), transition = ?other, "Session already ready");
                Preparation::Waiting
            }
        }
    }

    /// Build the session's world and hand it to a runner, taking the session
    /// from `READY` to `SIMULATION`.
    ///
    /// Returns `Ok(false)` when there is nothing to start. A world that cannot
    /// be built aborts the session and the error is returned.
    pub fn start_simulation(self: &Arc<Self>, session_id: SessionId) -> Result<bool, WorldError> {
        let Some(session) = self.session(session_id) else {
            warn!(session_id = %session_id, "Cannot start simulation for unknown session");
            return Ok(false);
        };
        if session.state() != GameState::Ready {
            warn!(session_id = %session_id, state = ?session.state(), "Session is not ready");
            return Ok(false);
        }

        let runner = match self.build_runner(&session) {
            Ok(runner) => runner,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "World construction failed");
                self.abort(&session, &e);
                return Err(e);
            }
        };

        if !matches!(
            session.advance_to(GameState::Simulation),
            Transition::Advanced { .. }
        ) {
            warn!(session_id = %session_id, "Simulation already handed to a runner");
            return Ok(false);
        }

        let registry = Arc::clone(self);
        if let Err(e) = self.runners.start(runner, move |outcome| {
            registry.complete_simulation(session_id, outcome.into());
        }) {
            error!(session_id = %session_id, error = %e, "World runner failed to start");
            self.abort(&session, &e);
            return Err(e);
        }

        self.broadcast(&session, ServerMsg::SimulationStarted { session_id });
        Ok(true)
    }

    fn build_runner(self: &Arc<Self>, session: &GameSession) -> Result<WorldRunner, WorldError> {
        let geometry = self
            .boards
            .geometry(session.board_id())
            .ok_or(WorldError::UnknownBoard(session.board_id()))?;

        let sink: Arc<dyn FrameSink> = self.clone();
        let mut runner = WorldRunner::new(session.id(), self.settings.clone()).with_sink(sink);
        runner.init_world(&geometry.bodies, &geometry.joints)?;

        let applied = runner.apply_moves(&session.all_moves());
        debug!(session_id = %session.id(), applied, "Applied submitted moves");
        Ok(runner)
    }

    /// Take a simulating session to `FINISHED` and notify its players
    pub fn complete_simulation(&self, session_id: SessionId, result: ResultCode) {
        let Some(session) = self.session(session_id) else {
            debug!(session_id = %session_id, "Session removed before its simulation ended");
            return;
        };

        match session.advance_to(GameState::Finished) {
            Transition::Advanced { .. } => {
                info!(session_id = %session_id, ?result, "Game finished");
                self.broadcast(&session, ServerMsg::Finished { session_id, result });
            }
            Transition::Unchanged => {
                debug!(session_id = %session_id, "Session already finished");
            }
            Transition::Rejected { current } => {
                warn!(session_id = %session_id, state = ?current, "Cannot finish session");
            }
        }
    }

    /// External finish request: stop the world and finish the session
    pub fn request_finish(&self, session_id: SessionId) {
        self.runners.discard(session_id);
        self.complete_simulation(session_id, ResultCode::Aborted);
    }

    /// Player acknowledges a finished round. Tears the session down once the
    /// whole team has acknowledged; returns whether it did.
    pub fn acknowledge_finish(&self, user_id: UserId) -> bool {
        let Some(session) = self.session_for(user_id) else {
            warn!(user_id = %user_id, "Cannot finish, player is not in a game");
            return false;
        };
        if session.state() != GameState::Finished {
            warn!(user_id = %user_id, state = ?session.state(), "Game is not finished yet");
            return false;
        }

        self.set_finished(user_id);
        if !self.is_team_finished(&session) {
            return false;
        }
        for player in session.players() {
            self.remove_session_for(*player);
        }
        true
    }

    /// Detach one player. The session goes away with its last player.
    pub fn remove_session_for(&self, user_id: UserId) -> bool {
        let Some((_, seat)) = self.seats.remove(&user_id) else {
            return false;
        };
        let session = seat.session;
        debug!(user_id = %user_id, session_id = %session.id(), "Player left session");

        let empty = session
            .players()
            .iter()
            .all(|p| self.seat_in(*p, &session).is_none());
        if empty {
            self.sessions.remove(&session.id());
            self.runners.discard(session.id());
            info!(session_id = %session.id(), "Session removed");
        }
        true
    }

    /// Detach every player of the user's session and drop its world
    pub fn remove_session_for_team(&self, user_id: UserId) -> bool {
        match self.session_for(user_id) {
            Some(session) => {
                self.remove_team(&session);
                true
            }
            None => false,
        }
    }

    fn remove_team(&self, session: &GameSession) {
        for user_id in session.players() {
            if self
                .seats
                .remove_if(user_id, |_, seat| seat.session.id() == session.id())
                .is_some()
            {
                debug!(user_id = %user_id, session_id = %session.id(), "Removing game session for user");
            }
        }
        self.sessions.remove(&session.id());
        self.runners.discard(session.id());
        info!(session_id = %session.id(), "Session removed for team");
    }

    fn abort(&self, session: &GameSession, reason: &WorldError) {
        self.broadcast(session, ServerMsg::error("simulation_failed", reason.to_string()));
        self.remove_team(session);
    }

    /// Player state of `user_id` if seated in `session`
    fn seat_in(&self, user_id: UserId, session: &GameSession) -> Option<PlayerState> {
        self.seats
            .get(&user_id)
            .filter(|seat| seat.session.id() == session.id())
            .map(|seat| seat.player.clone())
    }

    fn broadcast(&self, session: &GameSession, msg: ServerMsg) {
        for user_id in session.players() {
            self.connections.send(*user_id, msg.clone());
        }
    }
}

impl FrameSink for GameSessionService {
    fn publish(&self, session_id: SessionId, tick: u64, bodies: &[(BodyId, BodyFrame)]) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        let bodies: Vec<BodySnapshot> = bodies
            .iter()
            .map(|(body_id, frame)| BodySnapshot {
                body_id: *body_id,
                frame: *frame,
            })
            .collect();
        self.broadcast(
            &session,
            ServerMsg::Frame {
                session_id,
                tick,
                bodies,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glam::Vec2;

    use super::*;
    use crate::game::body::{BodyData, BodyDecl, BodyKind, BodyOptions, ShapeKind};
    use crate::game::BoardGeometry;
    use crate::store::{BoardMeta, BoardRecord, BoardStore, UserStore};

    const DROP_BOARD: BoardId = BoardId(1);
    const BROKEN_BOARD: BoardId = BoardId(2);

    struct Fixture {
        registry: Arc<GameSessionService>,
        users: Arc<UserStore>,
        connections: Arc<ConnectionRegistry>,
        runners: Arc<WorldRunnerService>,
    }

    fn circle(id: BodyId, radius: Option<f32>) -> BodyDecl {
        BodyDecl {
            id,
            body_type: BodyKind::Dynamic,
            shape: ShapeKind::Circle,
            key_body: false,
            data: BodyData {
                position: Vec2::ZERO,
                angle: 0.0,
                size: None,
                radius,
                config: None,
                options: BodyOptions::default(),
            },
        }
    }

    fn board(id: BoardId, players: u32, bodies: Vec<BodyDecl>) -> BoardRecord {
        BoardRecord {
            meta: BoardMeta {
                id,
                name: format!("board-{id}"),
                players,
                level: None,
                timer: None,
            },
            geometry: BoardGeometry {
                bodies,
                joints: Vec::new(),
            },
        }
    }

    fn fixture() -> Fixture {
        let users = Arc::new(UserStore::new());
        let boards = Arc::new(BoardStore::new());
        boards.insert(board(DROP_BOARD, 2, vec![circle(1, Some(0.5))]));
        boards.insert(board(BROKEN_BOARD, 2, vec![circle(1, None)]));
        let connections = Arc::new(ConnectionRegistry::new());
        let runners = Arc::new(WorldRunnerService::new());
        let settings = SimulationSettings {
            timeout: Duration::from_secs(30),
            ..SimulationSettings::default()
        };
        let registry = Arc::new(GameSessionService::new(
            users.clone(),
            boards,
            connections.clone(),
            runners.clone(),
            settings,
        ));
        Fixture {
            registry,
            users,
            connections,
            runners,
        }
    }

    fn pair(f: &Fixture, board_id: BoardId) -> (UserId, UserId, SessionId) {
        let u1 = f.users.register("u1").id;
        let u2 = f.users.register("u2").id;
        let session_id = f.registry.start_game(board_id, &[u1, u2]).unwrap();
        (u1, u2, session_id)
    }

    #[test]
    fn test_start_game_seats_players_in_moving_state() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, DROP_BOARD);

        let session = f.registry.session(session_id).unwrap();
        assert_eq!(session.state(), GameState::Moving);
        assert_eq!(session.players(), &[u1, u2]);
        assert_eq!(f.registry.session_for(u2).map(|s| s.id()), Some(session_id));
        assert_eq!(f.registry.player(u1).map(|p| p.username), Some("u1".to_string()));
        assert!(!f.registry.player(u1).unwrap().is_ready());
    }

    #[test]
    fn test_start_game_rolls_back_when_player_already_seated() {
        let f = fixture();
        let (u1, _, first) = pair(&f, DROP_BOARD);
        let newcomer = f.users.register("u3").id;

        assert_eq!(f.registry.start_game(DROP_BOARD, &[newcomer, u1]), None);

        assert!(!f.registry.is_playing(newcomer));
        assert_eq!(f.registry.session_for(u1).map(|s| s.id()), Some(first));
        assert_eq!(f.registry.active_sessions(), 1);
    }

    #[test]
    fn test_rollback_releases_many_seats_without_blocking() {
        let f = fixture();
        let (u1, _, first) = pair(&f, DROP_BOARD);
        let mut players: Vec<UserId> = (0..256).map(|_| UserId::new()).collect();
        players.push(u1);
        let newcomers = players[..256].to_vec();

        let (tx, rx) = std::sync::mpsc::channel();
        let registry = f.registry.clone();
        std::thread::spawn(move || {
            let _ = tx.send(registry.start_game(DROP_BOARD, &players));
        });

        let started = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("start_game did not return");
        assert_eq!(started, None);
        assert!(newcomers.iter().all(|u| !f.registry.is_playing(*u)));
        assert_eq!(f.registry.session_for(u1).map(|s| s.id()), Some(first));
        assert_eq!(f.registry.seated_players(), 2);
    }

    #[test]
    fn test_team_becomes_ready_only_after_every_player_submits() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, DROP_BOARD);
        let session = f.registry.session(session_id).unwrap();

        assert_eq!(f.registry.prepare_simulation(u1, Vec::new()), Preparation::Waiting);
        assert_eq!(session.state(), GameState::Moving);
        assert!(!f.registry.is_team_ready(&session));

        assert_eq!(
            f.registry.prepare_simulation(u2, Vec::new()),
            Preparation::TeamReady(session_id)
        );
        assert_eq!(session.state(), GameState::Ready);

        // Resubmitting while ready records moves but does not re-trigger.
        assert_eq!(f.registry.prepare_simulation(u1, Vec::new()), Preparation::Waiting);
        assert!(!f.registry.set_ready(u1));
    }

    #[test]
    fn test_prepare_simulation_without_session_is_rejected() {
        let f = fixture();
        let stranger = f.users.register("stranger").id;

        assert_eq!(f.registry.prepare_simulation(stranger, Vec::new()), Preparation::Rejected);
        assert!(f.registry.is_simulation_started_for(stranger));
    }

    #[test]
    fn test_simulation_starts_once_then_rejects_moves() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, DROP_BOARD);
        f.registry.prepare_simulation(u1, Vec::new());
        f.registry.prepare_simulation(u2, Vec::new());

        assert!(f.registry.start_simulation(session_id).unwrap());
        assert!(!f.registry.start_simulation(session_id).unwrap());

        let session = f.registry.session(session_id).unwrap();
        assert_eq!(session.state(), GameState::Simulation);
        assert!(f.runners.frames(session_id).is_some());
        assert_eq!(f.registry.prepare_simulation(u1, Vec::new()), Preparation::Rejected);

        assert!(f.registry.remove_session_for_team(u1));
        assert!(!f.runners.is_running(session_id));
    }

    #[test]
    fn test_start_simulation_requires_ready_state() {
        let f = fixture();
        let (_, _, session_id) = pair(&f, DROP_BOARD);

        assert!(!f.registry.start_simulation(session_id).unwrap());
        assert!(!f.registry.start_simulation(SessionId::new()).unwrap());
        assert_eq!(f.runners.active(), 0);
    }

    #[tokio::test]
    async fn test_broken_geometry_aborts_session() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, BROKEN_BOARD);
        let mut rx = f.connections.register(u1);
        f.registry.prepare_simulation(u1, Vec::new());
        f.registry.prepare_simulation(u2, Vec::new());

        let result = f.registry.start_simulation(session_id);

        assert!(matches!(result, Err(WorldError::MissingRadius(1))));
        assert!(!f.registry.is_playing(u1));
        assert!(!f.registry.is_playing(u2));
        assert!(f.registry.session(session_id).is_none());
        assert_eq!(f.runners.active(), 0);
        assert!(matches!(rx.recv().await, Some(ServerMsg::Error { .. })));
    }

    #[test]
    fn test_disconnect_mid_simulation_tears_down_team() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, DROP_BOARD);
        f.registry.prepare_simulation(u1, Vec::new());
        f.registry.prepare_simulation(u2, Vec::new());
        f.registry.start_simulation(session_id).unwrap();

        assert!(f.registry.remove_session_for_team(u2));

        assert!(!f.registry.is_playing(u1));
        assert!(!f.registry.is_playing(u2));
        assert!(f.registry.player(u1).is_none());
        assert!(f.registry.session(session_id).is_none());
        assert!(f.runners.frames(session_id).is_none());
        assert_eq!(f.registry.prepare_simulation(u1, Vec::new()), Preparation::Rejected);
        assert_eq!(f.registry.prepare_simulation(u2, Vec::new()), Preparation::Rejected);
        assert!(!f.registry.remove_session_for_team(u1));
    }

    #[test]
    fn test_remove_session_for_keeps_session_until_last_player_leaves() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, DROP_BOARD);

        assert!(f.registry.remove_session_for(u1));
        assert!(!f.registry.is_playing(u1));
        assert!(f.registry.session(session_id).is_some());

        assert!(f.registry.remove_session_for(u2));
        assert!(f.registry.session(session_id).is_none());
        assert!(!f.registry.remove_session_for(u2));
    }

    #[test]
    fn test_finish_acknowledgements_tear_down_after_whole_team() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, DROP_BOARD);
        let session = f.registry.session(session_id).unwrap();

        assert!(!f.registry.acknowledge_finish(u1));
        assert!(!f.registry.player(u1).unwrap().is_finished());

        session.advance_to(GameState::Ready);
        session.advance_to(GameState::Simulation);
        f.registry.complete_simulation(session_id, ResultCode::Completed);
        assert_eq!(session.state(), GameState::Finished);

        assert!(!f.registry.acknowledge_finish(u1));
        assert!(f.registry.is_playing(u1));
        assert!(!f.registry.is_team_finished(&session));

        assert!(f.registry.acknowledge_finish(u2));
        assert!(!f.registry.is_playing(u1));
        assert!(f.registry.session(session_id).is_none());
    }

    #[test]
    fn test_complete_simulation_only_from_simulation() {
        let f = fixture();
        let (_, _, session_id) = pair(&f, DROP_BOARD);
        let session = f.registry.session(session_id).unwrap();

        f.registry.complete_simulation(session_id, ResultCode::TimedOut);
        assert_eq!(session.state(), GameState::Moving);

        f.registry.complete_simulation(SessionId::new(), ResultCode::TimedOut);
    }

    #[test]
    fn test_request_finish_stops_world_and_finishes() {
        let f = fixture();
        let (u1, u2, session_id) = pair(&f, DROP_BOARD);
        f.registry.prepare_simulation(u1, Vec::new());
        f.registry.prepare_simulation(u2, Vec::new());
        f.registry.start_simulation(session_id).unwrap();

        f.registry.request_finish(session_id);

        let session = f.registry.session(session_id).unwrap();
        assert_eq!(session.state(), GameState::Finished);
        assert!(f.runners.frames(session_id).is_none());
        assert!(!f.registry.acknowledge_finish(u1));
        assert!(f.registry.acknowledge_finish(u2));
    }
}
