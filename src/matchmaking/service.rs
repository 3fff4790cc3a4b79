//! Matchmaking service - pairs waiting players and seats them in sessions

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::game::{BoardId, SessionId, UserId};
use crate::sessions::GameSessionService;
use crate::store::{BoardCatalog, UserDirectory};
use crate::ws::connections::ConnectionRegistry;

use super::queue::WaiterTable;

/// Players assumed when a board has no metadata
const FALLBACK_PLAYERS: u32 = 1;

/// Result of [`Matchmaker::attempt_pair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    /// The user is not a candidate, nothing changed
    Aborted,
    /// No opponent yet, the user's entry is in the table
    Waiting,
    /// A session was created
    Started(SessionId),
}

/// Matchmaking service
pub struct Matchmaker {
    waiters: WaiterTable,
    sessions: Arc<GameSessionService>,
    users: Arc<dyn UserDirectory>,
    boards: Arc<dyn BoardCatalog>,
    connections: Arc<ConnectionRegistry>,
}

impl Matchmaker {
    pub fn new(
        sessions: Arc<GameSessionService>,
        users: Arc<dyn UserDirectory>,
        boards: Arc<dyn BoardCatalog>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            waiters: WaiterTable::new(),
            sessions,
            users,
            boards,
            connections,
        }
    }

    /// Put the user on the board's waiting list. No-op while they play.
    pub fn enqueue(&self, user_id: UserId, board_id: BoardId) -> bool {
        if self.sessions.is_playing(user_id) {
            debug!(user_id = %user_id, "Already in a game, not queueing");
            return false;
        }
        self.waiters.insert(user_id, board_id);
        info!(
            user_id = %user_id,
            board_id = %board_id,
            queue_size = self.waiters.len(),
            "Player joined matchmaking queue"
        );
        true
    }

    /// Try to start a game for `user_id` on `board_id`. Safe to call again
    /// at any time; every step re-validates what it relies on.
    pub fn attempt_pair(&self, user_id: UserId, board_id: BoardId) -> PairingOutcome {
        if self.sessions.is_playing(user_id) {
            self.waiters.remove(user_id);
            return PairingOutcome::Aborted;
        }
        self.waiters.remove(user_id);
        if !self.check_candidate(user_id) {
            return PairingOutcome::Aborted;
        }

        let players = match self.boards.meta(board_id) {
            Some(meta) => meta.players,
            None => {
                error!(board_id = %board_id, "Board metadata not found, assuming single player");
                FALLBACK_PLAYERS
            }
        };

        if players <= 1 {
            return self.start(board_id, &[user_id]);
        }

        for waiter in self.waiters.pending_for(board_id) {
            if waiter.user_id == user_id {
                continue;
            }
            if !self.check_candidate(waiter.user_id) {
                debug!(user_id = %waiter.user_id, "Purging stale waiter");
                self.waiters.remove(waiter.user_id);
                continue;
            }
            if self.waiters.remove(waiter.user_id).is_none() {
                // Claimed by a concurrent pairing.
                continue;
            }
            info!(
                board_id = %board_id,
                first = %waiter.user_id,
                second = %user_id,
                "Paired players"
            );
            return match self.sessions.start_game(board_id, &[waiter.user_id, user_id]) {
                Some(session_id) => PairingOutcome::Started(session_id),
                None => self.requeue_after_failed_start(board_id, waiter.user_id, user_id),
            };
        }

        self.waiters.insert(user_id, board_id);
        debug!(user_id = %user_id, board_id = %board_id, "No opponent yet");
        PairingOutcome::Waiting
    }

    fn start(&self, board_id: BoardId, players: &[UserId]) -> PairingOutcome {
        match self.sessions.start_game(board_id, players) {
            Some(session_id) => PairingOutcome::Started(session_id),
            None => {
                error!(board_id = %board_id, "Could not seat paired players");
                PairingOutcome::Aborted
            }
        }
    }

    /// Either side may have been seated elsewhere between the claim and the
    /// seating. Whoever is still a candidate goes back on the list.
    fn requeue_after_failed_start(
        &self,
        board_id: BoardId,
        opponent: UserId,
        user_id: UserId,
    ) -> PairingOutcome {
        warn!(board_id = %board_id, first = %opponent, second = %user_id, "Could not seat paired players");
        if self.check_candidate(opponent) {
            self.waiters.insert(opponent, board_id);
        }
        if self.check_candidate(user_id) {
            self.waiters.insert(user_id, board_id);
            return PairingOutcome::Waiting;
        }
        PairingOutcome::Aborted
    }

    /// Drop the user's pending entry
    pub fn remove_waiter(&self, user_id: UserId) {
        if self.waiters.remove(user_id).is_some() {
            debug!(user_id = %user_id, "Removed waiter");
        }
    }

    /// Connected, not seated, and known to the user store
    pub fn check_candidate(&self, user_id: UserId) -> bool {
        if !self.connections.is_connected(user_id) {
            debug!(user_id = %user_id, "Candidate is not connected");
            return false;
        }
        if self.sessions.is_playing(user_id) {
            debug!(user_id = %user_id, "Candidate is already playing");
            return false;
        }
        if self.users.find(user_id).is_none() {
            debug!(user_id = %user_id, "Candidate is not a known user");
            return false;
        }
        true
    }

    pub fn is_waiting(&self, user_id: UserId) -> bool {
        self.waiters.contains(user_id)
    }

    pub fn queue_size(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::config::SimulationSettings;
    use crate::game::{BoardGeometry, WorldRunnerService};
    use crate::sessions::GameState;
    use crate::store::{BoardMeta, BoardRecord, BoardStore, UserProfile, UserStore};
    use crate::ws::connections::Outbound;

    const SOLO: BoardId = BoardId(1);
    const DUEL: BoardId = BoardId(2);

    struct Fixture {
        matchmaker: Matchmaker,
        sessions: Arc<GameSessionService>,
        users: Arc<UserStore>,
        boards: Arc<BoardStore>,
        connections: Arc<ConnectionRegistry>,
    }

    /// Seats `target` on the solo board the first time it is looked up,
    /// as a concurrent join would
    struct SeatedDuringLookup {
        users: Arc<UserStore>,
        sessions: Arc<GameSessionService>,
        target: UserId,
        armed: AtomicBool,
    }

    impl UserDirectory for SeatedDuringLookup {
        fn find(&self, user_id: UserId) -> Option<UserProfile> {
            if user_id == self.target && self.armed.swap(false, Ordering::SeqCst) {
                self.sessions.start_game(SOLO, &[user_id]);
            }
            self.users.find(user_id)
        }
    }

    fn board(id: BoardId, players: u32) -> BoardRecord {
        BoardRecord {
            meta: BoardMeta {
                id,
                name: format!("board-{id}"),
                players,
                level: None,
                timer: None,
            },
            geometry: BoardGeometry::default(),
        }
    }

    fn fixture() -> Fixture {
        let users = Arc::new(UserStore::new());
        let boards = Arc::new(BoardStore::new());
        boards.insert(board(SOLO, 1));
        boards.insert(board(DUEL, 2));
        let connections = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(GameSessionService::new(
            users.clone(),
            boards.clone(),
            connections.clone(),
            Arc::new(WorldRunnerService::new()),
            SimulationSettings::default(),
        ));
        let matchmaker =
            Matchmaker::new(sessions.clone(), users.clone(), boards.clone(), connections.clone());
        Fixture {
            matchmaker,
            sessions,
            users,
            boards,
            connections,
        }
    }

    /// Registered and connected user; the receiver keeps the channel open
    fn online(f: &Fixture, name: &str) -> (UserId, Outbound) {
        let id = f.users.register(name).id;
        let rx = f.connections.register(id);
        (id, rx)
    }

    #[test]
    fn test_single_player_board_starts_immediately() {
        let f = fixture();
        let (u, _rx) = online(&f, "solo");

        assert!(f.matchmaker.enqueue(u, SOLO));
        let outcome = f.matchmaker.attempt_pair(u, SOLO);

        let PairingOutcome::Started(session_id) = outcome else {
            panic!("expected a session, got {outcome:?}");
        };
        let session = f.sessions.session(session_id).unwrap();
        assert_eq!(session.players(), &[u]);
        assert_eq!(session.state(), GameState::Moving);
        assert!(!f.matchmaker.is_waiting(u));
        assert_eq!(f.matchmaker.queue_size(), 0);
    }

    #[test]
    fn test_two_player_board_pairs_second_arrival() {
        let f = fixture();
        let (u1, _rx1) = online(&f, "u1");
        let (u2, _rx2) = online(&f, "u2");

        f.matchmaker.enqueue(u1, DUEL);
        assert_eq!(f.matchmaker.attempt_pair(u1, DUEL), PairingOutcome::Waiting);
        assert!(f.matchmaker.is_waiting(u1));
        assert!(!f.sessions.is_playing(u1));

        f.matchmaker.enqueue(u2, DUEL);
        let PairingOutcome::Started(session_id) = f.matchmaker.attempt_pair(u2, DUEL) else {
            panic!("second arrival should start a session");
        };

        let session = f.sessions.session(session_id).unwrap();
        assert_eq!(session.players(), &[u1, u2]);
        assert!(!f.matchmaker.is_waiting(u1));
        assert!(!f.matchmaker.is_waiting(u2));
        assert_eq!(f.matchmaker.queue_size(), 0);
    }

    #[test]
    fn test_scan_purges_disconnected_waiters_and_takes_first_valid() {
        let f = fixture();
        let (stale, stale_rx) = online(&f, "stale");
        let (early, _rx_early) = online(&f, "early");
        let (late, _rx_late) = online(&f, "late");
        let (me, _rx_me) = online(&f, "me");

        f.matchmaker.enqueue(stale, DUEL);
        f.matchmaker.enqueue(early, DUEL);
        f.matchmaker.enqueue(late, DUEL);
        drop(stale_rx);

        let PairingOutcome::Started(session_id) = f.matchmaker.attempt_pair(me, DUEL) else {
            panic!("expected pairing with the first valid waiter");
        };

        assert_eq!(f.sessions.session(session_id).unwrap().players(), &[early, me]);
        assert!(!f.matchmaker.is_waiting(stale));
        assert!(f.matchmaker.is_waiting(late));
    }

    #[test]
    fn test_waiters_on_other_boards_are_ignored() {
        let f = fixture();
        let (other, _rx_other) = online(&f, "other");
        let (me, _rx_me) = online(&f, "me");

        f.matchmaker.enqueue(other, BoardId(3));
        assert_eq!(f.matchmaker.attempt_pair(me, DUEL), PairingOutcome::Waiting);
        assert!(f.matchmaker.is_waiting(other));
        assert!(f.matchmaker.is_waiting(me));
    }

    #[test]
    fn test_enqueue_is_noop_while_playing() {
        let f = fixture();
        let (u, _rx) = online(&f, "u");
        f.matchmaker.attempt_pair(u, SOLO);

        assert!(!f.matchmaker.enqueue(u, DUEL));
        assert!(!f.matchmaker.is_waiting(u));
        assert_eq!(f.matchmaker.attempt_pair(u, DUEL), PairingOutcome::Aborted);
    }

    #[test]
    fn test_non_candidates_abort_cleanly() {
        let f = fixture();
        let offline = f.users.register("offline").id;
        let unknown = UserId::new();
        let _rx = f.connections.register(unknown);

        f.matchmaker.enqueue(offline, DUEL);
        assert_eq!(f.matchmaker.attempt_pair(offline, DUEL), PairingOutcome::Aborted);
        assert!(!f.matchmaker.is_waiting(offline));
        assert_eq!(f.matchmaker.attempt_pair(unknown, DUEL), PairingOutcome::Aborted);
        assert_eq!(f.sessions.active_sessions(), 0);
    }

    #[test]
    fn test_unknown_board_falls_back_to_single_player() {
        let f = fixture();
        let (u, _rx) = online(&f, "u");

        assert!(matches!(
            f.matchmaker.attempt_pair(u, BoardId(99)),
            PairingOutcome::Started(_)
        ));
        assert!(f.sessions.is_playing(u));
    }

    #[test]
    fn test_waiting_and_playing_are_exclusive() {
        let f = fixture();
        let (u1, _rx1) = online(&f, "u1");
        let (u2, _rx2) = online(&f, "u2");

        for u in [u1, u2] {
            f.matchmaker.enqueue(u, DUEL);
            f.matchmaker.attempt_pair(u, DUEL);
        }

        for u in [u1, u2] {
            assert!(f.sessions.is_playing(u) != f.matchmaker.is_waiting(u));
        }

        f.matchmaker.remove_waiter(u1);
        f.sessions.remove_session_for_team(u1);
        assert!(f.matchmaker.enqueue(u1, DUEL));
        assert!(f.matchmaker.is_waiting(u1));
    }

    #[test]
    fn test_failed_seating_requeues_remaining_candidate() {
        let f = fixture();
        let (opponent, _rx_opponent) = online(&f, "opponent");
        let (me, _rx_me) = online(&f, "me");
        let directory = Arc::new(SeatedDuringLookup {
            users: f.users.clone(),
            sessions: f.sessions.clone(),
            target: opponent,
            armed: AtomicBool::new(false),
        });
        let matchmaker = Matchmaker::new(
            f.sessions.clone(),
            directory.clone(),
            f.boards.clone(),
            f.connections.clone(),
        );

        matchmaker.enqueue(opponent, DUEL);
        directory.armed.store(true, Ordering::SeqCst);

        assert_eq!(matchmaker.attempt_pair(me, DUEL), PairingOutcome::Waiting);
        assert!(matchmaker.is_waiting(me));
        assert!(!f.sessions.is_playing(me));
        assert!(!matchmaker.is_waiting(opponent));
        assert!(f.sessions.is_playing(opponent));
        assert_eq!(f.sessions.active_sessions(), 1);
    }

    #[test]
    fn test_concurrent_joins_never_double_book() {
        let f = fixture();
        let online_players: Vec<(UserId, Outbound)> =
            (0..32).map(|i| online(&f, &format!("p{i}"))).collect();
        let ids: Vec<UserId> = online_players.iter().map(|(id, _)| *id).collect();

        std::thread::scope(|scope| {
            for chunk in ids.chunks(4) {
                let matchmaker = &f.matchmaker;
                scope.spawn(move || {
                    for &u in chunk {
                        if matchmaker.enqueue(u, DUEL) {
                            matchmaker.attempt_pair(u, DUEL);
                        }
                    }
                });
            }
        });

        let mut started = HashSet::new();
        for &u in &ids {
            let waiting = f.matchmaker.is_waiting(u);
            let playing = f.sessions.is_playing(u);
            assert!(!(waiting && playing), "{u} is both waiting and seated");
            if let Some(session) = f.sessions.session_for(u) {
                started.insert(session.id());
            }
        }

        assert!(!started.is_empty());
        for session_id in started {
            let session = f.sessions.session(session_id).unwrap();
            let players = session.players();
            assert_eq!(players.len(), 2);
            assert_ne!(players[0], players[1]);
            for p in players {
                assert_eq!(f.sessions.session_for(*p).map(|s| s.id()), Some(session_id));
            }
        }
    }
}
