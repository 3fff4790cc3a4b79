//! Pending pairing entries, one per user

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::game::{BoardId, UserId};

/// A user waiting to be paired on a board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub user_id: UserId,
    pub board_id: BoardId,
    /// Insertion sequence, scans visit waiters in this order
    seq: u64,
}

/// Concurrent waiter table. Each operation locks a single entry only.
#[derive(Default)]
pub struct WaiterTable {
    waiters: DashMap<UserId, Waiter>,
    next_seq: AtomicU64,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the user's entry. A replaced entry moves to the back.
    pub fn insert(&self, user_id: UserId, board_id: BoardId) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.waiters.insert(
            user_id,
            Waiter {
                user_id,
                board_id,
                seq,
            },
        );
    }

    pub fn remove(&self, user_id: UserId) -> Option<Waiter> {
        self.waiters.remove(&user_id).map(|(_, w)| w)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.waiters.contains_key(&user_id)
    }

    /// Waiters on `board_id`, oldest first. A snapshot: entries may be gone by
    /// the time the caller looks at them.
    pub fn pending_for(&self, board_id: BoardId) -> Vec<Waiter> {
        let mut pending: Vec<Waiter> = self
            .waiters
            .iter()
            .filter(|w| w.board_id == board_id)
            .map(|w| *w)
            .collect();
        pending.sort_by_key(|w| w.seq);
        pending
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
